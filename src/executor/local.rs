// Local command execution without SSH, for hosts that point at the controller

use std::os::unix::fs::PermissionsExt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::info;

use super::{CommandResult, Connection, Connector, ScriptUpload};
use crate::output::errors::MonitorError;

/// "Dials" local shells; scripts are distributed by plain file copy
pub struct LocalConnector {
    host_name: String,
}

impl LocalConnector {
    pub fn new(host_name: impl Into<String>) -> Self {
        LocalConnector {
            host_name: host_name.into(),
        }
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self) -> Result<Arc<dyn Connection>, MonitorError> {
        Ok(Arc::new(LocalConnection::new(self.host_name.clone())))
    }

    async fn push_scripts(&self, scripts: &[ScriptUpload]) -> Result<(), MonitorError> {
        for script in scripts {
            let remote = std::path::Path::new(&script.remote);
            let io_err = |e: std::io::Error, message: &str| MonitorError::Io {
                message: format!("{}: {}", message, e),
                path: Some(remote.to_path_buf()),
            };

            let same_file = match (
                tokio::fs::canonicalize(&script.local).await,
                tokio::fs::canonicalize(remote).await,
            ) {
                (Ok(a), Ok(b)) => a == b,
                _ => false,
            };
            if !same_file {
                tokio::fs::copy(&script.local, remote)
                    .await
                    .map_err(|e| io_err(e, "Failed to copy check script"))?;
            }

            tokio::fs::set_permissions(remote, std::fs::Permissions::from_mode(0o755))
                .await
                .map_err(|e| io_err(e, "Failed to make check script executable"))?;

            info!(host = %self.host_name, script = %script.remote, "Installed check script");
        }
        Ok(())
    }

    fn host_name(&self) -> &str {
        &self.host_name
    }
}

/// Local connection for executing commands on the controller
pub struct LocalConnection {
    host_name: String,
    closed: AtomicBool,
}

impl LocalConnection {
    pub fn new(host_name: impl Into<String>) -> Self {
        LocalConnection {
            host_name: host_name.into(),
            closed: AtomicBool::new(false),
        }
    }

    fn error(&self, message: String) -> MonitorError {
        MonitorError::Ssh {
            host: self.host_name.clone(),
            message,
            suggestion: Some("Check that 'sh' is available on the system".to_string()),
        }
    }
}

#[async_trait]
impl Connection for LocalConnection {
    async fn exec(&self, cmd: &str) -> Result<CommandResult, MonitorError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MonitorError::NotConnected {
                host: self.host_name.clone(),
            });
        }

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.error(format!("Failed to spawn local command: {}", e)))?;

        let mut stdout_handle = child
            .stdout
            .take()
            .ok_or_else(|| self.error("Failed to capture stdout".to_string()))?;
        let mut stderr_handle = child
            .stderr
            .take()
            .ok_or_else(|| self.error("Failed to capture stderr".to_string()))?;

        // Both pipes are drained while the command runs
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stdout_handle.read_to_end(&mut buf).await.map(|_| buf)
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stderr_handle.read_to_end(&mut buf).await.map(|_| buf)
        });

        let status = child
            .wait()
            .await
            .map_err(|e| self.error(format!("Failed to wait for command: {}", e)))?;

        let stdout = stdout_task
            .await
            .map_err(|e| self.error(format!("Failed to read stdout: {}", e)))?
            .map_err(|e| self.error(format!("Failed to read stdout: {}", e)))?;
        let stderr = stderr_task
            .await
            .map_err(|e| self.error(format!("Failed to read stderr: {}", e)))?
            .map_err(|e| self.error(format!("Failed to read stderr: {}", e)))?;

        Ok(CommandResult {
            stdout,
            stderr,
            // Killed by a signal
            exit_code: status.code().unwrap_or(-1),
        })
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn host_name(&self) -> &str {
        &self.host_name
    }
}
