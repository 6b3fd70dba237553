// Host supervisor - one connection and every check runner for one host

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::executor::{
    CheckRunner, CheckSnapshot, Connector, HostConnection, Notifier, RunningCheck, ScriptUpload,
};
use crate::inventory::{CheckConfig, HostConfig, MonitorSettings};
use crate::output::errors::MonitorError;
use crate::output::status::{CheckStatus, HostStatus};

/// A host whose checks are scheduled
pub struct HostSupervisor {
    host: HostConfig,
    connection: Arc<HostConnection>,
    runners: Mutex<Vec<RunningCheck>>,
    snapshots: Vec<watch::Receiver<CheckSnapshot>>,
    started: DateTime<Utc>,
}

impl HostSupervisor {
    /// Connect, distribute scripts, then start every runner plus the keepalive.
    ///
    /// Any failure before the runners start is returned and leaves nothing
    /// running for this host.
    pub async fn start(
        host: HostConfig,
        checks: Vec<CheckConfig>,
        connector: Arc<dyn Connector>,
        notifier: Arc<dyn Notifier>,
        settings: &MonitorSettings,
    ) -> Result<Self, MonitorError> {
        info!(host = %host.name, address = %host.target(), checks = checks.len(), "Starting host");

        let connection = Arc::new(HostConnection::new(host.name.clone(), connector));
        connection.connect().await?;

        let uploads: Vec<ScriptUpload> = checks
            .iter()
            .map(|check| ScriptUpload {
                local: check.script.clone(),
                remote: host.remote_script_path(&check.script),
            })
            .collect();
        if let Err(e) = connection.push_scripts(&uploads).await {
            connection.close();
            return Err(e);
        }

        let mut runners: Vec<CheckRunner> = checks
            .into_iter()
            .zip(uploads)
            .map(|(check, upload)| {
                CheckRunner::new(
                    Arc::new(check),
                    host.address.clone(),
                    upload.remote,
                    connection.clone(),
                    notifier.clone(),
                    settings.history_capacity,
                )
            })
            .collect();

        let keepalive = CheckConfig::keepalive(settings.keepalive_interval);
        let command = keepalive.script.to_string_lossy().to_string();
        runners.push(CheckRunner::new(
            Arc::new(keepalive),
            host.address.clone(),
            command,
            connection.clone(),
            notifier,
            settings.history_capacity,
        ));

        debug!(
            host = %host.name,
            checks = ?runners.iter().map(CheckRunner::name).collect::<Vec<_>>(),
            "Scheduling checks"
        );

        let running = join_all(runners.into_iter().map(CheckRunner::start)).await;
        let snapshots = running.iter().map(RunningCheck::subscribe).collect();

        info!(host = %host.name, "Host started");
        Ok(HostSupervisor {
            host,
            connection,
            runners: Mutex::new(running),
            snapshots,
            started: Utc::now(),
        })
    }

    pub fn host(&self) -> &HostConfig {
        &self.host
    }

    pub fn connection(&self) -> &Arc<HostConnection> {
        &self.connection
    }

    pub fn status(&self) -> HostStatus {
        let now = Utc::now();
        HostStatus {
            host: self.host.name.clone(),
            address: self.host.address.clone(),
            reconnects: self.connection.reconnects(),
            connected: self.connection.is_connected(),
            connecting: self.connection.is_connecting(),
            started: Some(self.started),
            error: None,
            checks: self
                .snapshots
                .iter()
                .map(|rx| CheckStatus::from_snapshot(&rx.borrow(), now))
                .collect(),
        }
    }

    /// Stop every runner, then close the connection. Later calls do nothing.
    pub async fn stop(&self, grace: Duration) {
        let runners = std::mem::take(&mut *self.runners.lock());
        if runners.is_empty() {
            return;
        }

        info!(host = %self.host.name, "Stopping host");
        for runner in &runners {
            runner.stop();
        }
        join_all(runners.into_iter().map(|r| r.shutdown(grace))).await;

        self.connection.close();
    }
}
