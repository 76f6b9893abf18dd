//! Macvlan network driver for global-scope container networks
//!
//! This implementation provides a pure Rust macvlan driver that:
//! - Allocates networks bound to one parent interface each
//! - Assigns MAC and IP addresses to container endpoints
//! - Persists endpoints so they survive a driver restart
//! - Creates the macvlan sub-interfaces handed to container namespaces

pub mod commands;
pub mod config;
pub mod error;
pub mod integrations;
pub mod link;
pub mod plugin;
pub mod store;
pub mod types;

// Re-export commonly used items
pub use commands::{dispatch, handle};
pub use config::{DriverConfig, NetworkConfig};
pub use error::{DriverError, ErrorKind};
pub use plugin::{Cleanup, DeleteReport, Driver, FreeReport, MacvlanMode};
pub use store::{EndpointRecord, FileStore, Store};
