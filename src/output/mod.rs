// Output module - errors, status views and the HTTP façade

pub mod errors;
pub mod http;
pub mod status;

pub use errors::*;
pub use status::{CheckStatus, HostStatus};
