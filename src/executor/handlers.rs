// Handler dispatch - run local commands when a check changes status
//
// Every configured handler whose name matches one listed on the check is run
// once per notification, with the rendered message as its final argument.
// A handler that fails is logged and skipped; the others still run.

use std::fmt::Write as _;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::result::Status;
use crate::inventory::HandlerConfig;
use crate::output::errors::{suggest_fix, MonitorError};

/// Everything a handler is told about a status change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub check: String,
    pub status: Status,
    pub previous: Status,
    pub host: String,
    pub script: String,
    pub description: String,
    pub stdout: String,
    pub stderr: String,
}

impl Notification {
    /// Markdown body passed to handler commands
    pub fn render(&self) -> String {
        let mut body = String::new();
        let _ = writeln!(body, "## {} {}\n", self.status, self.check);
        let _ = writeln!(body, "- *Host:* {}", self.host);
        let _ = writeln!(body, "- *Script:* {}", self.script);
        let _ = writeln!(body, "- *Last Status:* {}\n", self.previous);
        let _ = writeln!(body, "- *Description:* {}\n", self.description);
        let _ = writeln!(body, "#### STDOUT\n```\n{}\n```\n", self.stdout);
        let _ = writeln!(body, "#### STDERR\n```\n{}\n```\n", self.stderr);
        body
    }
}

/// Receives status-change notifications for a check
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification, handlers: &[String]);
}

/// Outcome counts for one dispatch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub invoked: usize,
    pub failed: usize,
}

/// Resolves handler names against the configured handlers and runs them
pub struct HandlerDispatcher {
    handlers: Vec<HandlerConfig>,
}

impl HandlerDispatcher {
    pub fn new(handlers: Vec<HandlerConfig>) -> Self {
        HandlerDispatcher { handlers }
    }

    /// All handlers matching each name, in name order then definition order
    pub fn resolve<'a>(&'a self, names: &'a [String]) -> impl Iterator<Item = &'a HandlerConfig> {
        names
            .iter()
            .flat_map(move |name| self.handlers.iter().filter(move |h| &h.name == name))
    }

    /// Run every matching handler with `message`. Never fails as a whole.
    pub async fn dispatch(&self, message: &str, names: &[String]) -> DispatchReport {
        let mut report = DispatchReport::default();

        for handler in self.resolve(names) {
            report.invoked += 1;
            debug!(handler = %handler.name, "Found matching handler");

            match invoke(handler, message).await {
                Ok(output) => {
                    debug!(handler = %handler.name, output = %output.trim_end(), "Handler finished");
                }
                Err(e) => {
                    report.failed += 1;
                    let hint = suggest_fix(&e).unwrap_or_default();
                    warn!(handler = %handler.name, command = %handler.command, error = %e, %hint, "Failed to execute handler");
                }
            }
        }

        report
    }
}

#[async_trait]
impl Notifier for HandlerDispatcher {
    async fn notify(&self, notification: &Notification, handlers: &[String]) {
        info!(
            check = %notification.check,
            host = %notification.host,
            from = %notification.previous,
            to = %notification.status,
            "Check status changed"
        );
        let report = self.dispatch(&notification.render(), handlers).await;
        if report.invoked == 0 {
            debug!(check = %notification.check, "No handlers matched");
        }
    }
}

/// Run one handler; stdout is returned for logging only
async fn invoke(handler: &HandlerConfig, message: &str) -> Result<String, MonitorError> {
    let argv = handler.argv(message);
    let (program, args) = argv.split_first().ok_or_else(|| MonitorError::Handler {
        handler: handler.name.clone(),
        message: "Empty handler command".to_string(),
    })?;

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| MonitorError::Handler {
            handler: handler.name.clone(),
            message: format!("Failed to spawn '{}': {}", program, e),
        })?;

    if !output.status.success() {
        return Err(MonitorError::Handler {
            handler: handler.name.clone(),
            message: format!(
                "'{}' exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim_end()
            ),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
