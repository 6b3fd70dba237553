// YAML inventory loading and validation

use std::collections::HashSet;
use std::path::Path;

use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::Inventory;
use crate::output::errors::MonitorError;

impl Inventory {
    /// Load and validate the three inventory files
    pub fn load(hosts: &Path, checks: &Path, handlers: &Path) -> Result<Self, MonitorError> {
        let inventory = Inventory {
            hosts: read_yaml(hosts)?,
            checks: read_yaml(checks)?,
            handlers: read_yaml(handlers)?,
        };
        let inventory = inventory.normalized();
        inventory.validate()?;

        info!(
            hosts = inventory.hosts.hosts.len(),
            checks = inventory.checks.checks.len(),
            handlers = inventory.handlers.handlers.len(),
            "Inventory loaded"
        );
        Ok(inventory)
    }

    /// Build an inventory from YAML strings
    pub fn parse_str(hosts: &str, checks: &str, handlers: &str) -> Result<Self, MonitorError> {
        let inventory = Inventory {
            hosts: parse_yaml(hosts, "hosts")?,
            checks: parse_yaml(checks, "checks")?,
            handlers: parse_yaml(handlers, "handlers")?,
        }
        .normalized();
        inventory.validate()?;
        Ok(inventory)
    }

    fn normalized(mut self) -> Self {
        for host in &mut self.hosts.hosts {
            if host.name.is_empty() {
                host.name = host.address.clone();
            }
        }
        self
    }

    /// Reject configurations the engine cannot run
    pub fn validate(&self) -> Result<(), MonitorError> {
        let mut names = HashSet::new();
        for host in &self.hosts.hosts {
            if host.address.trim().is_empty() {
                return Err(MonitorError::config(
                    format!("Host '{}' has no address", host.name),
                    Some("Set 'address' (or 'host') for every entry in hosts.yml"),
                ));
            }
            if !host.is_local() && host.user.trim().is_empty() {
                return Err(MonitorError::config(
                    format!("Host '{}' has no user", host.name),
                    Some("Set 'user' for every remote host"),
                ));
            }
            if !host.is_local() && host.key.as_os_str().is_empty() {
                return Err(MonitorError::config(
                    format!("Host '{}' has no private key", host.name),
                    Some("Only public key authentication is supported; set 'key'"),
                ));
            }
            if !names.insert(host.name.as_str()) {
                return Err(MonitorError::config(
                    format!("Duplicate host name '{}'", host.name),
                    None,
                ));
            }
        }

        let mut names = HashSet::new();
        for check in &self.checks.checks {
            if check.name.trim().is_empty() {
                return Err(MonitorError::config("Check without a name", None));
            }
            if check.script.as_os_str().is_empty() {
                return Err(MonitorError::config(
                    format!("Check '{}' has no script", check.name),
                    None,
                ));
            }
            if check.interval == 0 {
                return Err(MonitorError::config(
                    format!("Check '{}' has an interval of 0", check.name),
                    Some("Intervals are in seconds and must be at least 1"),
                ));
            }
            if !names.insert(check.name.as_str()) {
                return Err(MonitorError::config(
                    format!("Duplicate check name '{}'", check.name),
                    None,
                ));
            }
        }

        for handler in &self.handlers.handlers {
            if handler.command.split_whitespace().next().is_none() {
                return Err(MonitorError::config(
                    format!("Handler '{}' has an empty command", handler.name),
                    None,
                ));
            }
        }

        Ok(())
    }
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, MonitorError> {
    let content = std::fs::read_to_string(path).map_err(|e| MonitorError::Io {
        message: format!("Failed to read configuration file: {}", e),
        path: Some(path.to_path_buf()),
    })?;
    debug!(path = %path.display(), "Parsing configuration");

    parse_yaml(&content, &path.display().to_string())
}

fn parse_yaml<T: DeserializeOwned>(content: &str, source: &str) -> Result<T, MonitorError> {
    serde_yaml::from_str(content).map_err(|e| {
        let location = e
            .location()
            .map(|l| format!(" at line {}, column {}", l.line(), l.column()))
            .unwrap_or_default();
        MonitorError::config(
            format!("Invalid YAML in {}{}: {}", source, location, e),
            Some("Check the file syntax"),
        )
    })
}
