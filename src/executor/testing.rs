// Scripted transports and notifiers for engine tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CommandResult, Connection, Connector, Notification, Notifier, ScriptUpload};
use crate::output::errors::MonitorError;

/// What the next `exec` on a scripted connection does
#[derive(Debug, Clone)]
pub enum Step {
    Exit(i32),
    /// The session breaks mid-command
    Drop,
    /// Runs for a while, then fails if the session was closed meanwhile
    Sleep(Duration),
}

#[derive(Default)]
pub struct ScriptedConnector {
    pub dials: AtomicUsize,
    /// `false` entries make the matching dial fail; an empty plan always succeeds
    dial_plan: Mutex<VecDeque<bool>>,
    dial_delay: Mutex<Duration>,
    steps: Arc<Mutex<VecDeque<Step>>>,
    pub commands: Arc<Mutex<Vec<String>>>,
    pub pushed: Mutex<Vec<ScriptUpload>>,
    fail_push: AtomicBool,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(ScriptedConnector::default())
    }

    pub fn with_exits(codes: &[i32]) -> Arc<Self> {
        let connector = ScriptedConnector::default();
        connector
            .steps
            .lock()
            .extend(codes.iter().map(|c| Step::Exit(*c)));
        Arc::new(connector)
    }

    pub fn plan_dials(&self, plan: &[bool]) {
        self.dial_plan.lock().extend(plan.iter().copied());
    }

    pub fn set_dial_delay(&self, delay: Duration) {
        *self.dial_delay.lock() = delay;
    }

    pub fn push_step(&self, step: Step) {
        self.steps.lock().push_back(step);
    }

    pub fn fail_push(&self) {
        self.fail_push.store(true, Ordering::SeqCst);
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> Result<Arc<dyn Connection>, MonitorError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let delay = *self.dial_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let succeed = self.dial_plan.lock().pop_front().unwrap_or(true);
        if !succeed {
            return Err(MonitorError::ssh("scripted", "Connection failed: refused"));
        }

        Ok(Arc::new(ScriptedConnection {
            alive: AtomicBool::new(true),
            steps: self.steps.clone(),
            commands: self.commands.clone(),
        }))
    }

    async fn push_scripts(&self, scripts: &[ScriptUpload]) -> Result<(), MonitorError> {
        if self.fail_push.load(Ordering::SeqCst) {
            return Err(MonitorError::ssh("scripted", "Failed to open SFTP"));
        }
        self.pushed.lock().extend(scripts.iter().cloned());
        Ok(())
    }

    fn host_name(&self) -> &str {
        "scripted"
    }
}

pub struct ScriptedConnection {
    alive: AtomicBool,
    steps: Arc<Mutex<VecDeque<Step>>>,
    commands: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn exec(&self, cmd: &str) -> Result<CommandResult, MonitorError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(MonitorError::ssh("scripted", "Unable to open session"));
        }
        self.commands.lock().push(cmd.to_string());

        let step = self.steps.lock().pop_front().unwrap_or(Step::Exit(0));
        match step {
            Step::Exit(code) => Ok(CommandResult {
                stdout: format!("exit {}", code).into_bytes(),
                stderr: Vec::new(),
                exit_code: code,
            }),
            Step::Drop => {
                self.alive.store(false, Ordering::SeqCst);
                Err(MonitorError::ssh("scripted", "Failed reading stdout: broken pipe"))
            }
            Step::Sleep(delay) => {
                tokio::time::sleep(delay).await;
                if !self.alive.load(Ordering::SeqCst) {
                    return Err(MonitorError::ssh("scripted", "Failed reading stdout: channel closed"));
                }
                Ok(CommandResult {
                    stdout: b"exit 0".to_vec(),
                    stderr: Vec::new(),
                    exit_code: 0,
                })
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    fn host_name(&self) -> &str {
        "scripted"
    }
}

/// Notifier that remembers every notification it receives
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(Notification, Vec<String>)>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingNotifier::default())
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification, handlers: &[String]) {
        self.sent
            .lock()
            .push((notification.clone(), handlers.to_vec()));
    }
}

/// Poll `condition` until it holds, panicking after a few seconds
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
