// Executor module - remote script execution and per-check scheduling

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::inventory::{HostConfig, MonitorSettings};
use crate::output::errors::MonitorError;

pub mod connection;
pub mod handlers;
pub mod local;
pub mod result;
pub mod scheduler;
pub mod ssh;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::HostConnection;
pub use handlers::{DispatchReport, HandlerDispatcher, Notification, Notifier};
pub use local::{LocalConnection, LocalConnector};
pub use result::{Counters, History, ResultRecord, Status};
pub use scheduler::{CheckRunner, CheckSnapshot, RunnerState, RunningCheck, TickOutcome};
pub use ssh::{SshConnection, SshConnector};

/// A live session to one host, able to run commands.
///
/// `exec` returns `Ok` whenever the command ran, whatever its exit code.
/// `Err` is reserved for session-level failures, which callers treat as a
/// reason to reconnect rather than as a check outcome.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Run a command to completion, capturing both output streams
    async fn exec(&self, cmd: &str) -> Result<CommandResult, MonitorError>;

    /// False once the session is known to be closed or broken
    fn is_alive(&self) -> bool;

    /// Terminate the session. Calling it twice is harmless.
    fn close(&self);

    fn host_name(&self) -> &str;
}

/// Dials sessions to a single host and distributes scripts to it
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Connection>, MonitorError>;

    /// Copy check scripts to the host with mode 0755
    async fn push_scripts(&self, scripts: &[ScriptUpload]) -> Result<(), MonitorError>;

    fn host_name(&self) -> &str;
}

/// One script to place on a host before scheduling starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptUpload {
    pub local: PathBuf,
    pub remote: String,
}

/// Result of executing a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Pick the transport for a host: local processes for the controller itself, SSH otherwise
pub fn connector_for(
    host: &HostConfig,
    settings: &MonitorSettings,
) -> Result<Arc<dyn Connector>, MonitorError> {
    if host.is_local() {
        Ok(Arc::new(LocalConnector::new(host.name.clone())))
    } else {
        Ok(Arc::new(SshConnector::new(host, settings.connect_timeout)?))
    }
}
