//! Clients for systems the driver coordinates with

pub mod control_plane;

pub use control_plane::ControlPlaneClient;
