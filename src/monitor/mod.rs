// Monitor module - host supervisors and the fleet that owns them

pub mod fleet;
pub mod host;

pub use fleet::{ConnectorFactory, Fleet, FleetSummary};
pub use host::HostSupervisor;
