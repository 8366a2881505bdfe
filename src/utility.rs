//! Filesystem hardening for the sqlite KV store (C1).
//!
//! The KV file backs every short-lived OAuth artifact this proxy handles —
//! grants, the upstream tokens embedded in them, downstream access/refresh
//! tokens, interactions, PKCE verifiers. Anyone who can read that file can
//! mint requests as any authorized user, so its directory and the database
//! file itself are locked to the owner before `SqliteKvStore::open` ever
//! touches them: 0700/0600 on Unix, an owner-only DACL on Windows.
//!
//! Both helpers require the target to already exist; callers create the
//! directory/file first and harden it afterwards rather than relying on
//! these functions to do both.

use anyhow::{Context, Result};
use std::path::Path;

#[cfg(unix)]
use std::{fs, os::unix::fs::PermissionsExt};

/// Restrict `dir_path` (the KV store's parent directory) to the current
/// user. Unix: mode `0700`. Windows: an owner-only DACL, protected against
/// inheriting broader access from a parent directory.
pub fn set_secure_dir_permissions(dir_path: &Path) -> Result<()> {
    tracing::debug!(path = %dir_path.display(), "restricting kv directory to owner");

    if !dir_path.exists() {
        return Err(anyhow::anyhow!(
            "kv directory does not exist: {}",
            dir_path.display()
        ));
    }

    #[cfg(unix)]
    {
        let metadata = fs::metadata(dir_path)
            .with_context(|| format!("reading metadata for {}", dir_path.display()))?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o700);
        fs::set_permissions(dir_path, permissions)
            .with_context(|| format!("setting unix permissions on {}", dir_path.display()))?;
    }

    #[cfg(windows)]
    {
        let p = dir_path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("invalid path string: {}", dir_path.display()))?;
        restrict_to_owner_readwrite(p)
            .with_context(|| format!("setting windows ACL on {}", dir_path.display()))?;
    }

    Ok(())
}

/// Restrict `file_path` (the KV store's sqlite database file) to the
/// current user. Unix: mode `0600`. Windows: an owner-only DACL granting
/// full control, protected against inheritance.
pub fn set_secure_file_permissions(file_path: &Path) -> Result<()> {
    tracing::debug!(path = %file_path.display(), "restricting kv database file to owner");

    if !file_path.exists() {
        return Err(anyhow::anyhow!(
            "kv database file does not exist: {}",
            file_path.display()
        ));
    }

    #[cfg(unix)]
    {
        let metadata = fs::metadata(file_path)
            .with_context(|| format!("reading metadata for {}", file_path.display()))?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o600);
        fs::set_permissions(file_path, permissions)
            .with_context(|| format!("setting unix permissions on {}", file_path.display()))?;
    }

    #[cfg(windows)]
    {
        let p = file_path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("invalid path string: {}", file_path.display()))?;
        restrict_to_owner_readwrite(p)
            .with_context(|| format!("setting windows ACL on {}", file_path.display()))?;
    }

    Ok(())
}

/// Replace `path`'s DACL with one that grants only the current process
/// user full control, protected from inherited ACEs. Windows-only
/// counterpart to the `0700`/`0600` Unix modes above, used for both the KV
/// directory and the KV database file.
///
/// Skips the rewrite if an existing ACE already grants the current user
/// full access. Errors surface the underlying Win32 error code.
#[cfg(windows)]
fn restrict_to_owner_readwrite(path: &str) -> anyhow::Result<()> {
    tracing::debug!(path, "applying owner-only ACL to kv path");

    use windows::{
        Win32::Foundation::{HANDLE, HLOCAL, LocalFree},
        Win32::Security::Authorization::*,
        Win32::Security::*,
        Win32::Storage::FileSystem::*,
        Win32::System::Threading::*,
        core::*,
    };

    unsafe {
        let mut token = HANDLE(std::ptr::null_mut());
        OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token)
            .map_err(|e| anyhow::anyhow!("OpenProcessToken failed: {}", e))?;

        let mut token_info = vec![0u8; 1024];
        let mut ret_len = 0u32;
        GetTokenInformation(
            token,
            TokenUser,
            Some(token_info.as_mut_ptr() as _),
            token_info.len() as u32,
            &mut ret_len,
        )
        .map_err(|e| anyhow::anyhow!("GetTokenInformation failed: {}", e))?;
        let user_sid = (*(token_info.as_ptr() as *const TOKEN_USER)).User.Sid;

        let wide_path: Vec<u16> = path.encode_utf16().chain(Some(0)).collect();
        let mut p_dacl = std::ptr::null_mut();
        let p_sd = std::ptr::null_mut();
        let status = GetNamedSecurityInfoW(
            PCWSTR(wide_path.as_ptr()),
            SE_FILE_OBJECT,
            DACL_SECURITY_INFORMATION,
            None,
            None,
            Some(&mut p_dacl),
            None,
            p_sd,
        );
        if status.0 != 0 {
            tracing::warn!(
                path,
                code = status.0,
                "GetNamedSecurityInfoW failed, replacing DACL unconditionally"
            );
        } else if !p_dacl.is_null() {
            let mut access_granted = false;
            let ace_count = (*p_dacl).AceCount;
            for i in 0..ace_count {
                let mut p_ace: *mut std::ffi::c_void = std::ptr::null_mut();
                if GetAce(p_dacl, i as u32, &mut p_ace).is_ok() {
                    let ace = *(p_ace as *const ACCESS_ALLOWED_ACE);
                    let sid = PSID(&ace.SidStart as *const u32 as *mut std::ffi::c_void);
                    if EqualSid(sid, user_sid).is_ok() {
                        let mask = ace.Mask;
                        if mask & FILE_ALL_ACCESS.0 == FILE_ALL_ACCESS.0 {
                            access_granted = true;
                            break;
                        }
                    }
                }
            }

            if access_granted {
                tracing::debug!(path, "owner already has full access, leaving DACL alone");
                return Ok(());
            }
        }

        let allow_owner_ea = EXPLICIT_ACCESS_W {
            grfAccessPermissions: FILE_ALL_ACCESS.0,
            grfAccessMode: GRANT_ACCESS,
            grfInheritance: NO_INHERITANCE,
            Trustee: TRUSTEE_W {
                pMultipleTrustee: std::ptr::null_mut(),
                MultipleTrusteeOperation: NO_MULTIPLE_TRUSTEE,
                TrusteeForm: TRUSTEE_IS_SID,
                TrusteeType: TRUSTEE_IS_USER,
                ptstrName: PWSTR(user_sid.0 as _),
            },
        };

        let entries = [allow_owner_ea];
        let mut new_dacl = std::ptr::null_mut();
        let create_rc = SetEntriesInAclW(Some(&entries), None, &mut new_dacl);
        if create_rc.0 != 0 {
            return Err(anyhow::anyhow!(
                "SetEntriesInAclW failed code={}",
                create_rc.0
            ));
        }

        let result = SetNamedSecurityInfoW(
            PCWSTR(wide_path.as_ptr()),
            SE_FILE_OBJECT,
            DACL_SECURITY_INFORMATION | PROTECTED_DACL_SECURITY_INFORMATION,
            None,
            None,
            Some(new_dacl),
            None,
        );
        if result.0 != 0 {
            if !new_dacl.is_null() {
                let h = HLOCAL(new_dacl as *mut core::ffi::c_void);
                let _ = LocalFree(Some(h));
            }
            return Err(anyhow::anyhow!(
                "SetNamedSecurityInfoW failed code={}",
                result.0
            ));
        }

        if !new_dacl.is_null() {
            let h = HLOCAL(new_dacl as *mut core::ffi::c_void);
            let _ = LocalFree(Some(h));
        }

        tracing::debug!(path, "replaced DACL with owner-only access");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[cfg(unix)]
    #[test]
    fn unix_set_secure_file_permissions_makes_owner_only() -> Result<()> {
        let td = tempfile::tempdir()?;
        let file_path = td.path().join("kv.sqlite3");
        std::fs::File::create(&file_path)?;

        set_secure_file_permissions(&file_path)?;

        let md = fs::metadata(&file_path)?;
        let mode = md.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "kv database file mode should be 0600");
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn unix_set_secure_dir_permissions_makes_owner_only() -> Result<()> {
        let td = tempfile::tempdir()?;
        let dir_path = td.path().join("kv-data");
        fs::create_dir_all(&dir_path)?;

        set_secure_dir_permissions(&dir_path)?;

        let md = fs::metadata(&dir_path)?;
        let mode = md.permissions().mode() & 0o777;
        assert_eq!(mode, 0o700, "kv directory mode should be 0700");
        Ok(())
    }

    #[test]
    fn missing_paths_return_error() {
        let td = tempfile::tempdir().expect("tmpdir");
        let missing = td.path().join("nope");
        assert!(set_secure_file_permissions(&missing).is_err());
        assert!(set_secure_dir_permissions(&missing).is_err());
    }

    #[cfg(windows)]
    #[test]
    fn windows_set_secure_file_permissions_is_idempotent() -> Result<()> {
        let td = tempfile::tempdir()?;
        let file_path = td.path().join("kv.sqlite3");
        std::fs::File::create(&file_path)?;

        set_secure_file_permissions(&file_path)?;
        set_secure_file_permissions(&file_path)?;

        let p = file_path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("invalid path"))?;
        restrict_to_owner_readwrite(p)?;
        Ok(())
    }
}
