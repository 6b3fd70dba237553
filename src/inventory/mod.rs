// Inventory module: the hosts, checks and handlers being monitored

mod loader;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Name of the synthetic check added to every host
pub const KEEPALIVE_CHECK: &str = "keepalive";

/// A single monitored host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Display name, defaults to the address
    #[serde(default)]
    pub name: String,
    #[serde(alias = "host")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Required unless the host is local
    #[serde(default)]
    pub user: String,
    /// Path to the private key used for public key authentication
    #[serde(default)]
    pub key: PathBuf,
    /// Tags matched against each check's `subscribers`
    #[serde(default)]
    pub subscriptions: Vec<String>,
    /// Remote working directory scripts are pushed into
    #[serde(default = "default_directory")]
    pub directory: String,
}

fn default_port() -> u16 {
    22
}

fn default_directory() -> String {
    "/tmp".to_string()
}

impl HostConfig {
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        HostConfig {
            name: address.clone(),
            address,
            port: default_port(),
            user: String::new(),
            key: PathBuf::new(),
            subscriptions: Vec::new(),
            directory: default_directory(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_key(mut self, key: impl Into<PathBuf>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_subscriptions(mut self, subscriptions: &[&str]) -> Self {
        self.subscriptions = subscriptions.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_directory(mut self, directory: impl Into<String>) -> Self {
        self.directory = directory.into();
        self
    }

    /// The `address:port` pair to dial
    pub fn target(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Hosts pointing at the controller itself are checked without SSH
    pub fn is_local(&self) -> bool {
        matches!(self.address.as_str(), "localhost" | "127.0.0.1" | "::1")
    }

    /// Where a check script lands on this host
    pub fn remote_script_path(&self, script: &Path) -> String {
        let base = script
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        format!("{}/{}", self.directory.trim_end_matches('/'), base)
    }
}

/// Immutable definition of one periodic check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckConfig {
    pub name: String,
    /// Local path of the script pushed to each host
    pub script: PathBuf,
    /// Seconds between runs
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub subscribers: Vec<String>,
    /// Handler names notified when the status of this check changes
    #[serde(default)]
    pub handlers: Vec<String>,
}

fn default_interval() -> u64 {
    60
}

impl CheckConfig {
    pub fn new(name: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        CheckConfig {
            name: name.into(),
            script: script.into(),
            interval: default_interval(),
            description: String::new(),
            subscribers: Vec::new(),
            handlers: Vec::new(),
        }
    }

    pub fn with_interval(mut self, seconds: u64) -> Self {
        self.interval = seconds;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_subscribers(mut self, subscribers: &[&str]) -> Self {
        self.subscribers = subscribers.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_handlers(mut self, handlers: &[&str]) -> Self {
        self.handlers = handlers.iter().map(|s| s.to_string()).collect();
        self
    }

    /// The always-present reachability check
    pub fn keepalive(interval: u64) -> Self {
        CheckConfig::new(KEEPALIVE_CHECK, "true")
            .with_interval(interval)
            .with_description("Keepalive check to ensure host is still reachable.")
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.interval.max(1))
    }

    /// A host runs this check when any of its subscriptions is listed as a subscriber
    pub fn applies_to(&self, host: &HostConfig) -> bool {
        host.subscriptions
            .iter()
            .any(|sub| self.subscribers.iter().any(|s| s == sub))
    }
}

/// A local command run when a check changes status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerConfig {
    pub name: String,
    /// Whitespace separated command; the notification is appended as the last argument
    pub command: String,
}

impl HandlerConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        HandlerConfig {
            name: name.into(),
            command: command.into(),
        }
    }

    /// Program and arguments for one invocation carrying `message`
    pub fn argv(&self, message: &str) -> Vec<String> {
        let mut argv: Vec<String> = self.command.split_whitespace().map(str::to_string).collect();
        argv.push(message.to_string());
        argv
    }
}

/// `hosts.yml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostsFile {
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

/// `checks.yml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksFile {
    #[serde(default)]
    pub checks: Vec<CheckConfig>,
}

/// `handlers.yml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlersFile {
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,
}

/// The complete, validated configuration
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub hosts: HostsFile,
    pub checks: ChecksFile,
    pub handlers: HandlersFile,
}

impl Inventory {
    /// Checks a host runs, in definition order, each at most once
    pub fn checks_for(&self, host: &HostConfig) -> Vec<CheckConfig> {
        self.checks
            .checks
            .iter()
            .filter(|check| check.applies_to(host))
            .cloned()
            .collect()
    }
}

/// Runtime knobs that are not part of the YAML inventory
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Address the status API listens on
    pub listen: String,
    /// Seconds between keepalive runs
    pub keepalive_interval: u64,
    /// TCP connect and handshake timeout
    pub connect_timeout: Duration,
    /// Results retained per check
    pub history_capacity: usize,
    /// How long shutdown waits for in-flight executions
    pub shutdown_grace: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        MonitorSettings {
            listen: "0.0.0.0:8080".to_string(),
            keepalive_interval: 15,
            connect_timeout: Duration::from_secs(30),
            history_capacity: 20,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_script_path() {
        let host = HostConfig::new("10.0.0.5").with_directory("/opt/checks/");
        assert_eq!(
            host.remote_script_path(Path::new("scripts/disk.sh")),
            "/opt/checks/disk.sh"
        );
        assert_eq!(host.target(), "10.0.0.5:22");
    }

    #[test]
    fn test_applies_to() {
        let host = HostConfig::new("web-1").with_subscriptions(&["web", "linux"]);
        let check = CheckConfig::new("disk", "disk.sh").with_subscribers(&["linux"]);
        let other = CheckConfig::new("db", "db.sh").with_subscribers(&["database"]);

        assert!(check.applies_to(&host));
        assert!(!other.applies_to(&host));
    }

    #[test]
    fn test_checks_for_adds_each_check_once() {
        let host = HostConfig::new("web-1").with_subscriptions(&["web", "linux"]);
        let inventory = Inventory {
            checks: ChecksFile {
                checks: vec![
                    CheckConfig::new("disk", "disk.sh").with_subscribers(&["web", "linux"]),
                    CheckConfig::new("db", "db.sh").with_subscribers(&["database"]),
                ],
            },
            ..Default::default()
        };

        let checks = inventory.checks_for(&host);
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].name, "disk");
    }

    #[test]
    fn test_handler_argv() {
        let handler = HandlerConfig::new("slack", "/usr/local/bin/notify  --channel ops");
        assert_eq!(
            handler.argv("## WARNING disk"),
            vec!["/usr/local/bin/notify", "--channel", "ops", "## WARNING disk"]
        );
    }

    #[test]
    fn test_local_host_needs_no_credentials() {
        let inventory =
            Inventory::parse_str("hosts:\n  - host: localhost\n", "checks: []", "handlers: []")
                .unwrap();
        let host = &inventory.hosts.hosts[0];
        assert_eq!(host.name, "localhost");
        assert!(host.user.is_empty());
    }

    #[test]
    fn test_is_local() {
        assert!(HostConfig::new("localhost").is_local());
        assert!(HostConfig::new("::1").is_local());
        assert!(!HostConfig::new("192.168.1.1").is_local());
    }
}
