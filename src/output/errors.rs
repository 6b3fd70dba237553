// Human-readable error messages for sshwatch

use std::fmt;
use std::io::IsTerminal;
use std::path::PathBuf;

use colored::*;

/// Decide color output from TTY detection and the NO_COLOR environment variable
fn should_use_colors() -> bool {
    // https://no-color.org/
    if std::env::var("NO_COLOR").is_ok() {
        return false;
    }

    std::io::stderr().is_terminal()
}

/// All error types in sshwatch
#[derive(Debug)]
pub enum MonitorError {
    /// I/O errors (key material, local scripts, config files)
    Io {
        message: String,
        path: Option<PathBuf>,
    },

    /// Missing or invalid configuration
    Config {
        message: String,
        suggestion: Option<String>,
    },

    /// Connection-level SSH failures: dial, handshake, channel or stream setup
    Ssh {
        host: String,
        message: String,
        suggestion: Option<String>,
    },

    /// A connect attempt is already in flight for this host
    Busy { host: String },

    /// No live connection is available for this host
    NotConnected { host: String },

    /// A notification handler could not be run
    Handler { handler: String, message: String },

    /// The reporting server failed
    Http { message: String },
}

impl MonitorError {
    pub fn ssh(host: impl Into<String>, message: impl Into<String>) -> Self {
        MonitorError::Ssh {
            host: host.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn config(message: impl Into<String>, suggestion: Option<&str>) -> Self {
        MonitorError::Config {
            message: message.into(),
            suggestion: suggestion.map(str::to_string),
        }
    }

    /// Whether this error means the transport is unusable and the host should reconnect.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, MonitorError::Ssh { .. } | MonitorError::NotConnected { .. })
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, MonitorError::Busy { .. })
    }

    /// The bare message, without colour or hints
    pub fn message(&self) -> &str {
        match self {
            MonitorError::Io { message, .. }
            | MonitorError::Config { message, .. }
            | MonitorError::Ssh { message, .. }
            | MonitorError::Handler { message, .. }
            | MonitorError::Http { message } => message,
            MonitorError::Busy { .. } => "Connect already in progress",
            MonitorError::NotConnected { .. } => "No live connection",
        }
    }
}

impl std::error::Error for MonitorError {}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !should_use_colors() {
            colored::control::set_override(false);
        }

        match self {
            MonitorError::Io { message, path } => {
                write!(f, "{}: {}", "I/O ERROR".red().bold(), message)?;
                if let Some(path) = path {
                    write!(f, "\n  {} {}", "Path:".dimmed(), path.display())?;
                }
                Ok(())
            }

            MonitorError::Config {
                message,
                suggestion,
            } => {
                write!(f, "{}: {}", "CONFIG ERROR".red().bold(), message)?;
                if let Some(suggestion) = suggestion {
                    write!(f, "\n{}: {}", "Hint".yellow().bold(), suggestion)?;
                }
                Ok(())
            }

            MonitorError::Ssh {
                host,
                message,
                suggestion,
            } => {
                write!(f, "{}: {}", "SSH ERROR".red().bold(), message)?;
                write!(f, "\n  {} {}", "Host:".dimmed(), host)?;
                if let Some(suggestion) = suggestion {
                    write!(f, "\n{}: {}", "Hint".yellow().bold(), suggestion)?;
                }
                Ok(())
            }

            MonitorError::Busy { host } => {
                write!(
                    f,
                    "{}: already connecting to {}",
                    "BUSY".yellow().bold(),
                    host
                )
            }

            MonitorError::NotConnected { host } => {
                write!(f, "{}: no live connection to {}", "SSH ERROR".red().bold(), host)
            }

            MonitorError::Handler { handler, message } => {
                write!(f, "{}: {}", "HANDLER ERROR".red().bold(), message)?;
                write!(f, "\n  {} {}", "Handler:".dimmed(), handler)
            }

            MonitorError::Http { message } => {
                write!(f, "{}: {}", "HTTP ERROR".red().bold(), message)
            }
        }
    }
}

/// Suggest common fixes for errors
pub fn suggest_fix(error: &MonitorError) -> Option<String> {
    match error {
        MonitorError::Ssh { message, .. } => {
            let message = message.to_lowercase();
            if message.contains("connection refused") {
                Some("Ensure SSH service is running on the target host".to_string())
            } else if message.contains("timed out") || message.contains("timeout") {
                Some("Check network connectivity and firewall rules".to_string())
            } else if message.contains("authentication") {
                Some("Verify the private key is authorized for this user".to_string())
            } else {
                None
            }
        }
        MonitorError::Handler { message, .. } => {
            if message.contains("No such file") || message.contains("not found") {
                Some("Check the handler command path in handlers.yml".to_string())
            } else {
                None
            }
        }
        _ => None,
    }
}
