// Status report views served by the HTTP façade

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::executor::{CheckSnapshot, RunnerState, Status};

/// One host in the status report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostStatus {
    pub host: String,
    pub address: String,
    pub reconnects: u64,
    pub connected: bool,
    pub connecting: bool,
    /// When the host finished startup; absent if startup failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    /// Why startup failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checks: Vec<CheckStatus>,
}

impl HostStatus {
    /// Report entry for a host that never got running
    pub fn failed(host: &str, address: &str, error: impl Into<String>) -> Self {
        HostStatus {
            host: host.to_string(),
            address: address.to_string(),
            reconnects: 0,
            connected: false,
            connecting: false,
            started: None,
            error: Some(error.into()),
            checks: Vec::new(),
        }
    }
}

/// One check in the status report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckStatus {
    pub name: String,
    pub script: String,
    pub state: RunnerState,
    /// Status of the last result, if any
    pub status: Option<Status>,
    /// Time since the last execution, e.g. "2m 5s ago", or "Never"
    pub ago: String,
    /// Unix seconds of the last execution
    pub executed: Option<i64>,
    pub exit_status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub attempts: u64,
    pub warnings: u64,
    pub failures: u64,
    pub unknowns: u64,
    pub ssh_failures: u64,
    pub history: usize,
}

impl CheckStatus {
    pub fn from_snapshot(snapshot: &CheckSnapshot, now: DateTime<Utc>) -> Self {
        let counters = snapshot.counters;
        let mut status = CheckStatus {
            name: snapshot.name.clone(),
            script: snapshot.script.clone(),
            state: snapshot.state,
            status: None,
            ago: "Never".to_string(),
            executed: None,
            exit_status: None,
            stdout: String::new(),
            stderr: String::new(),
            attempts: counters.attempts,
            warnings: counters.warnings,
            failures: counters.failures,
            unknowns: counters.unknowns,
            ssh_failures: counters.connection_failures,
            history: snapshot.history_len,
        };

        if let Some(last) = &snapshot.last {
            status.status = Some(last.status);
            status.ago = ago(last.executed, now);
            status.executed = Some(last.executed.timestamp());
            status.exit_status = Some(last.exit_code);
            status.stdout = last.stdout_lossy();
            status.stderr = last.stderr_lossy();
        }

        status
    }
}

/// Humanised age at whole-second precision
pub fn ago(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - then).num_seconds().max(0) as u64;
    format!("{} ago", humantime::format_duration(Duration::from_secs(secs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Counters, ResultRecord};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn snapshot(last: Option<ResultRecord>) -> CheckSnapshot {
        CheckSnapshot {
            name: "disk".to_string(),
            script: "/tmp/disk.sh".to_string(),
            state: RunnerState::Running,
            last,
            counters: Counters {
                attempts: 3,
                warnings: 1,
                failures: 0,
                unknowns: 0,
                connection_failures: 1,
            },
            history_len: 2,
        }
    }

    #[test]
    fn test_never_executed() {
        let status = CheckStatus::from_snapshot(&snapshot(None), Utc::now());
        assert_eq!(status.ago, "Never");
        assert_eq!(status.executed, None);
        assert_eq!(status.exit_status, None);
        assert_eq!(status.ssh_failures, 1);
    }

    #[test]
    fn test_last_result_fields() {
        let executed = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let now = executed + chrono::Duration::seconds(125);
        let record = ResultRecord::new(1, b"91% used\n".to_vec(), Vec::new(), executed);

        let status = CheckStatus::from_snapshot(&snapshot(Some(record)), now);
        assert_eq!(status.status, Some(Status::Warning));
        assert_eq!(status.ago, "2m 5s ago");
        assert_eq!(status.executed, Some(executed.timestamp()));
        assert_eq!(status.exit_status, Some(1));
        assert_eq!(status.stdout, "91% used\n");
        assert_eq!(status.history, 2);
    }

    #[test]
    fn test_json_shape() {
        let status = CheckStatus::from_snapshot(&snapshot(None), Utc::now());
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "running");
        assert_eq!(json["ago"], "Never");
        assert!(json["status"].is_null());

        let failed = HostStatus::failed("web-1", "10.0.0.5", "Connection failed");
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["error"], "Connection failed");
        assert!(json.get("started").is_none());
    }
}
