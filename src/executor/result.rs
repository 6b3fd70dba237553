// Check results: status classification, counters and bounded history

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health state derived from a script's exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Ok,
    Warning,
    Failure,
    Unknown,
}

impl Status {
    /// Fixed mapping: 0 OK, 1 WARNING, 2 FAILURE, anything else UNKNOWN
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => Status::Ok,
            1 => Status::Warning,
            2 => Status::Failure,
            _ => Status::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Warning => "WARNING",
            Status::Failure => "FAILURE",
            Status::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one completed execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRecord {
    pub status: Status,
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub executed: DateTime<Utc>,
}

impl ResultRecord {
    pub fn new(exit_code: i32, stdout: Vec<u8>, stderr: Vec<u8>, executed: DateTime<Utc>) -> Self {
        ResultRecord {
            status: Status::from_exit_code(exit_code),
            exit_code,
            stdout,
            stderr,
            executed,
        }
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

/// Monotonic per-check counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub attempts: u64,
    pub warnings: u64,
    pub failures: u64,
    pub unknowns: u64,
    pub connection_failures: u64,
}

impl Counters {
    /// Count one classified result
    pub fn record(&mut self, status: Status) {
        match status {
            Status::Ok => {}
            Status::Warning => self.warnings += 1,
            Status::Failure => self.failures += 1,
            Status::Unknown => self.unknowns += 1,
        }
    }
}

/// Fixed-capacity ring of results; the oldest entry is overwritten when full
#[derive(Debug, Clone)]
pub struct History {
    slots: VecDeque<ResultRecord>,
    capacity: usize,
}

impl History {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        History {
            slots: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, record: ResultRecord) {
        if self.slots.len() == self.capacity {
            self.slots.pop_front();
        }
        self.slots.push_back(record);
    }

    pub fn last(&self) -> Option<&ResultRecord> {
        self.slots.back()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Oldest first
    pub fn iter(&self) -> impl Iterator<Item = &ResultRecord> {
        self.slots.iter()
    }
}
