//! Ed25519/JWKS-backed JWT signer (spec §4.5, §6 `OIDC_PROVIDER_JWKS`).
//!
//! `OIDC_PROVIDER_JWKS` is a JSON array of private JWKs (OKP/Ed25519
//! expected). The first key in the array is the active signing key; every
//! key in the array is published at `/jwks` so a key can be rotated in by
//! prepending a new one and rotated out once no outstanding token
//! references its `kid`.

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub trait Signer: Send + Sync {
    fn kid(&self) -> &str;
    fn sign(&self, header: Header, claims: &serde_json::Value) -> Result<String>;
    fn jwks(&self) -> serde_json::Value;
}

#[derive(Debug, Deserialize)]
struct PrivateJwk {
    kty: String,
    crv: Option<String>,
    x: Option<String>,
    d: Option<String>,
    kid: Option<String>,
}

struct Key {
    kid: String,
    encoding_key: EncodingKey,
    public_jwk: serde_json::Value,
}

/// Fixed ASN.1 PKCS#8 prefix for an unencrypted Ed25519 private key; the
/// only variable part of the DER encoding is the trailing 32-byte seed.
const PKCS8_ED25519_PREFIX: [u8; 16] = [
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04, 0x20,
];

pub struct JwksSigner {
    keys: Vec<Key>,
}

impl JwksSigner {
    /// Parse `OIDC_PROVIDER_JWKS` and build encoding keys for every entry.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: Vec<PrivateJwk> =
            serde_json::from_str(json).context("parse OIDC_PROVIDER_JWKS as a JSON array of JWKs")?;
        if raw.is_empty() {
            anyhow::bail!("OIDC_PROVIDER_JWKS must contain at least one key");
        }

        let mut keys = Vec::with_capacity(raw.len());
        for (i, jwk) in raw.into_iter().enumerate() {
            if jwk.kty != "OKP" || jwk.crv.as_deref() != Some("Ed25519") {
                anyhow::bail!(
                    "OIDC_PROVIDER_JWKS[{}]: unsupported key type (expected kty=OKP, crv=Ed25519)",
                    i
                );
            }
            let d = jwk
                .d
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("OIDC_PROVIDER_JWKS[{}]: missing private component 'd'", i))?;
            let x = jwk
                .x
                .clone()
                .ok_or_else(|| anyhow::anyhow!("OIDC_PROVIDER_JWKS[{}]: missing public component 'x'", i))?;

            let seed_bytes = B64.decode(d).context("decode jwk 'd'")?;
            let seed: [u8; 32] = seed_bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("OIDC_PROVIDER_JWKS[{}]: 'd' must decode to 32 bytes", i))?;

            let mut der = Vec::with_capacity(PKCS8_ED25519_PREFIX.len() + seed.len());
            der.extend_from_slice(&PKCS8_ED25519_PREFIX);
            der.extend_from_slice(&seed);
            let encoding_key = EncodingKey::from_ed_der(&der);

            let kid = jwk.kid.clone().unwrap_or_else(|| {
                let mut hasher = Sha256::new();
                hasher.update(x.as_bytes());
                B64.encode(hasher.finalize())
            });

            let public_jwk = serde_json::json!({
                "kty": "OKP",
                "crv": "Ed25519",
                "use": "sig",
                "alg": "EdDSA",
                "kid": kid,
                "x": x,
            });

            keys.push(Key {
                kid,
                encoding_key,
                public_jwk,
            });
        }

        Ok(Self { keys })
    }
}

impl Signer for JwksSigner {
    fn kid(&self) -> &str {
        &self.keys[0].kid
    }

    fn sign(&self, mut header: Header, claims: &serde_json::Value) -> Result<String> {
        header.alg = Algorithm::EdDSA;
        header.kid = Some(self.keys[0].kid.clone());
        jsonwebtoken::encode(&header, claims, &self.keys[0].encoding_key).context("failed to encode jwt")
    }

    fn jwks(&self) -> serde_json::Value {
        serde_json::json!({ "keys": self.keys.iter().map(|k| k.public_jwk.clone()).collect::<Vec<_>>() })
    }
}

pub type DynSigner = Arc<dyn Signer>;

pub fn load_signer_from_json(json: &str) -> Result<DynSigner> {
    Ok(Arc::new(JwksSigner::from_json(json)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 32 zero bytes is a valid (if useless) Ed25519 seed; good enough to
    /// exercise DER construction and round-trip signing.
    fn sample_jwks() -> String {
        let d = B64.encode([7u8; 32]);
        let x = B64.encode([9u8; 32]);
        serde_json::json!([{
            "kty": "OKP",
            "crv": "Ed25519",
            "d": d,
            "x": x,
            "kid": "test-key-1",
        }])
        .to_string()
    }

    #[test]
    fn signs_and_exposes_jwks() {
        let signer = JwksSigner::from_json(&sample_jwks()).unwrap();
        assert_eq!(signer.kid(), "test-key-1");

        let header = Header::new(Algorithm::EdDSA);
        let claims = serde_json::json!({"sub": "user-1"});
        let token = signer.sign(header, &claims).unwrap();
        assert_eq!(token.split('.').count(), 3);

        let jwks = signer.jwks();
        assert_eq!(jwks["keys"].as_array().unwrap().len(), 1);
        assert_eq!(jwks["keys"][0]["kid"], "test-key-1");
    }

    #[test]
    fn rejects_non_ed25519_keys() {
        let bad = serde_json::json!([{"kty": "RSA", "d": "x", "x": "y"}]).to_string();
        assert!(JwksSigner::from_json(&bad).is_err());
    }
}
