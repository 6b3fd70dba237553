// sshwatch - agent-less health checks over SSH
//
// Connects to a fleet of hosts, runs check scripts on a timer, tracks status
// transitions and fires local handler commands when a check changes state.

pub mod executor;
pub mod inventory;
pub mod monitor;
pub mod output;

pub use executor::{CheckRunner, HandlerDispatcher, HostConnection, Status};
pub use inventory::{Inventory, MonitorSettings};
pub use monitor::{Fleet, HostSupervisor};
pub use output::{HostStatus, MonitorError};

/// Version of sshwatch
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
