// Check runner - one periodic check on one host

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::HostConnection;
use super::handlers::{Notification, Notifier};
use super::result::{Counters, History, ResultRecord, Status};
use super::CommandResult;
use crate::inventory::CheckConfig;

/// Lifecycle of a runner: idle until started, stopped for good
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerState {
    Idle,
    Running,
    Stopped,
}

/// Read-only copy of a runner's state, published after every tick
#[derive(Debug, Clone)]
pub struct CheckSnapshot {
    pub name: String,
    pub script: String,
    pub state: RunnerState,
    pub last: Option<ResultRecord>,
    pub counters: Counters,
    pub history_len: usize,
}

/// What a single tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Recorded { status: Status, transition: bool },
    ConnectionFailed,
}

/// Mutable runtime state for one scheduled check. Owned by its task; the
/// outside world only sees [`CheckSnapshot`]s.
pub struct CheckRunner {
    check: Arc<CheckConfig>,
    host: String,
    command: String,
    connection: Arc<HostConnection>,
    notifier: Arc<dyn Notifier>,
    history: History,
    counters: Counters,
    state: RunnerState,
    published: watch::Sender<CheckSnapshot>,
}

impl CheckRunner {
    /// `command` is the script path as resolved on the host
    pub fn new(
        check: Arc<CheckConfig>,
        host: impl Into<String>,
        command: impl Into<String>,
        connection: Arc<HostConnection>,
        notifier: Arc<dyn Notifier>,
        history_capacity: usize,
    ) -> Self {
        let command = command.into();
        let (published, _) = watch::channel(CheckSnapshot {
            name: check.name.clone(),
            script: command.clone(),
            state: RunnerState::Idle,
            last: None,
            counters: Counters::default(),
            history_len: 0,
        });

        CheckRunner {
            check,
            host: host.into(),
            command,
            connection,
            notifier,
            history: History::with_capacity(history_capacity),
            counters: Counters::default(),
            state: RunnerState::Idle,
            published,
        }
    }

    pub fn name(&self) -> &str {
        &self.check.name
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn subscribe(&self) -> watch::Receiver<CheckSnapshot> {
        self.published.subscribe()
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    pub fn last(&self) -> Option<&ResultRecord> {
        self.history.last()
    }

    /// Run the check once and record the outcome
    pub async fn tick(&mut self) -> TickOutcome {
        debug!(host = %self.host, check = %self.check.name, "Checking");
        self.counters.attempts += 1;

        let executed = Utc::now();
        let (outcome, session) = match self.connection.session() {
            Ok(session) => (session.exec(&self.command).await, Some(session)),
            Err(e) => (Err(e), None),
        };

        let outcome = match outcome {
            Ok(result) => {
                let (status, notification) = self.record(result, executed);
                let transition = notification.is_some();
                if let Some(notification) = notification {
                    self.notifier
                        .notify(&notification, &self.check.handlers)
                        .await;
                }
                TickOutcome::Recorded { status, transition }
            }
            Err(e) => {
                self.counters.connection_failures += 1;
                warn!(host = %self.host, check = %self.check.name, error = %e, "Connection failure, run skipped");
                self.connection.request_reconnect(session);
                TickOutcome::ConnectionFailed
            }
        };

        self.publish();
        outcome
    }

    /// Classify, detect a transition against the previous result, store.
    fn record(
        &mut self,
        result: CommandResult,
        executed: chrono::DateTime<Utc>,
    ) -> (Status, Option<Notification>) {
        let record = ResultRecord::new(result.exit_code, result.stdout, result.stderr, executed);
        let status = record.status;
        self.counters.record(status);

        if status != Status::Ok {
            info!(
                host = %self.host,
                check = %self.check.name,
                exit_code = record.exit_code,
                %status,
                "Check failed"
            );
        }

        let notification = match self.history.last() {
            Some(previous) if previous.status != status => Some(Notification {
                check: self.check.name.clone(),
                status,
                previous: previous.status,
                host: self.host.clone(),
                script: self.command.clone(),
                description: self.check.description.clone(),
                stdout: record.stdout_lossy(),
                stderr: record.stderr_lossy(),
            }),
            _ => None,
        };

        self.history.push(record);
        (status, notification)
    }

    fn publish(&self) {
        self.published.send_replace(CheckSnapshot {
            name: self.check.name.clone(),
            script: self.command.clone(),
            state: self.state,
            last: self.history.last().cloned(),
            counters: self.counters,
            history_len: self.history.len(),
        });
    }

    fn set_state(&mut self, state: RunnerState) {
        self.state = state;
        self.published.send_modify(|snapshot| snapshot.state = state);
    }

    /// Fire the first run right away, then arm the timer on a background task
    pub async fn start(mut self) -> RunningCheck {
        let cancel = CancellationToken::new();
        let snapshots = self.subscribe();
        let name = self.check.name.clone();

        self.set_state(RunnerState::Running);
        info!(host = %self.host, check = %name, interval = self.check.interval, "Starting check");
        self.tick().await;

        let token = cancel.clone();
        let task = tokio::spawn(async move { self.run(token).await });

        RunningCheck {
            name,
            cancel,
            task: Some(task),
            snapshots,
        }
    }

    async fn run(mut self, cancel: CancellationToken) {
        let period = self.check.period();
        // Missed ticks during a slow run are caught up, not coalesced
        let mut ticker = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    self.tick().await;
                }
            }
        }

        self.set_state(RunnerState::Stopped);
        debug!(host = %self.host, check = %self.check.name, "Check stopped");
    }
}

/// Handle to a started runner
pub struct RunningCheck {
    name: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    snapshots: watch::Receiver<CheckSnapshot>,
}

impl RunningCheck {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot(&self) -> CheckSnapshot {
        self.snapshots.borrow().clone()
    }

    /// A receiver that outlives this handle
    pub fn subscribe(&self) -> watch::Receiver<CheckSnapshot> {
        self.snapshots.clone()
    }

    /// Signal the runner to stop; no new execution starts after this returns
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop and wait for an in-flight execution to be recorded, up to `grace`
    pub async fn shutdown(mut self, grace: Duration) {
        self.stop();
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                warn!(check = %self.name, "Execution still running after grace period, aborting");
                task.abort();
            }
        }
    }
}

impl Drop for RunningCheck {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
