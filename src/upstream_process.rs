//! Child-process supervisor for the proxied upstream resource server
//! (`UPSTREAM_SERVER_RUN_COMMAND` and friends, a C9 collaborator).

use crate::config::components::UpstreamProcessConfig;
use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub struct UpstreamProcessSupervisor {
    child: Mutex<Option<Child>>,
}

impl UpstreamProcessSupervisor {
    /// Spawn the configured upstream process, if one is configured. Returns
    /// `Ok(None)` when `run_command` is unset (the upstream is assumed to
    /// be running independently).
    pub fn spawn(config: &UpstreamProcessConfig) -> Result<Option<Self>> {
        let Some(command) = &config.run_command else {
            return Ok(None);
        };

        let mut cmd = Command::new(command);
        cmd.args(&config.args);
        if let Some(dir) = &config.dir {
            cmd.current_dir(dir);
        }
        for (k, v) in &config.env {
            cmd.env(k, v);
        }
        cmd.kill_on_drop(true);

        let child = cmd
            .spawn()
            .with_context(|| format!("spawn upstream process: {}", command))?;
        info!(command = %command, "spawned supervised upstream process");

        Ok(Some(Self {
            child: Mutex::new(Some(child)),
        }))
    }

    /// Terminate the supervised process, if still running.
    pub async fn shutdown(&self) {
        if let Some(mut child) = self.child.lock().await.take()
            && let Err(e) = child.kill().await
        {
            warn!(error = %e, "failed to kill upstream process");
        }
    }

    /// Spawn a background task that logs when the supervised process exits
    /// unexpectedly. The proxy does not attempt to restart it: a crash
    /// loop is an operator problem, not something to paper over silently.
    pub fn watch(self: std::sync::Arc<Self>) {
        tokio::spawn(async move {
            let status = {
                let mut guard = self.child.lock().await;
                match guard.as_mut() {
                    Some(child) => child.wait().await,
                    None => return,
                }
            };
            match status {
                Ok(status) => error!(?status, "supervised upstream process exited"),
                Err(e) => error!(error = %e, "failed to wait on upstream process"),
            }
        });
    }
}
