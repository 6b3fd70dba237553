// Fleet coordinator - starts every host in parallel and aggregates status

use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{error, info};

use super::host::HostSupervisor;
use crate::executor::{connector_for, Connector, HandlerDispatcher, Notifier};
use crate::inventory::{HostConfig, Inventory, MonitorSettings};
use crate::output::errors::MonitorError;
use crate::output::status::HostStatus;

/// Builds the transport for one host
pub type ConnectorFactory =
    Arc<dyn Fn(&HostConfig, &MonitorSettings) -> Result<Arc<dyn Connector>, MonitorError> + Send + Sync>;

enum HostEntry {
    Started(Arc<HostSupervisor>),
    Failed { host: HostConfig, error: String },
}

/// Result of [`Fleet::start`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FleetSummary {
    pub started: usize,
    pub failed: usize,
}

pub struct Fleet {
    inventory: Inventory,
    settings: MonitorSettings,
    factory: ConnectorFactory,
    notifier: Arc<dyn Notifier>,
    hosts: RwLock<Vec<HostEntry>>,
}

impl Fleet {
    /// Fleet using SSH (or local processes) and the configured handlers
    pub fn new(inventory: Inventory, settings: MonitorSettings) -> Self {
        let notifier = Arc::new(HandlerDispatcher::new(inventory.handlers.handlers.clone()));
        Fleet::with_parts(inventory, settings, Arc::new(connector_for), notifier)
    }

    pub fn with_parts(
        inventory: Inventory,
        settings: MonitorSettings,
        factory: ConnectorFactory,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Fleet {
            inventory,
            settings,
            factory,
            notifier,
            hosts: RwLock::new(Vec::new()),
        }
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// Start every host concurrently. A host that fails to start is reported
    /// and left out; its siblings are unaffected.
    pub async fn start(&self) -> FleetSummary {
        let starts = self.inventory.hosts.hosts.iter().map(|host| async move {
            let checks = self.inventory.checks_for(host);
            let started = match (self.factory)(host, &self.settings) {
                Ok(connector) => {
                    HostSupervisor::start(
                        host.clone(),
                        checks,
                        connector,
                        self.notifier.clone(),
                        &self.settings,
                    )
                    .await
                }
                Err(e) => Err(e),
            };

            match started {
                Ok(supervisor) => HostEntry::Started(Arc::new(supervisor)),
                Err(e) => {
                    error!(host = %host.name, error = %e, "Failed to start host");
                    HostEntry::Failed {
                        host: host.clone(),
                        error: e.message().to_string(),
                    }
                }
            }
        });
        let entries = join_all(starts).await;

        let summary = FleetSummary {
            started: entries
                .iter()
                .filter(|e| matches!(e, HostEntry::Started(_)))
                .count(),
            failed: entries
                .iter()
                .filter(|e| matches!(e, HostEntry::Failed { .. }))
                .count(),
        };
        info!(started = summary.started, failed = summary.failed, "Fleet started");

        self.hosts.write().extend(entries);
        summary
    }

    /// Status of every host in inventory order
    pub fn status(&self) -> Vec<HostStatus> {
        self.hosts
            .read()
            .iter()
            .map(|entry| match entry {
                HostEntry::Started(supervisor) => supervisor.status(),
                HostEntry::Failed { host, error } => {
                    HostStatus::failed(&host.name, &host.address, error.clone())
                }
            })
            .collect()
    }

    /// Stop all hosts in parallel
    pub async fn stop(&self) {
        let supervisors: Vec<Arc<HostSupervisor>> = self
            .hosts
            .read()
            .iter()
            .filter_map(|entry| match entry {
                HostEntry::Started(supervisor) => Some(supervisor.clone()),
                HostEntry::Failed { .. } => None,
            })
            .collect();

        let grace = self.settings.shutdown_grace;
        join_all(supervisors.iter().map(|s| s.stop(grace))).await;
        info!(hosts = supervisors.len(), "Fleet stopped");
    }
}
