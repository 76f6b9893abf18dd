use http::Uri;
use tracing::{debug, info};

use crate::error::DriverError;

const UNIX_SCHEME: &str = "unix://";
const ACCEPTED_SCHEMES: [&str; 3] = ["http", "https", "tcp"];

/// Where the control plane can be reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPlaneAddr {
    /// Host and port reached over TCP, optionally with TLS
    Tcp { scheme: String, authority: String },
    /// Local socket path
    Unix(String),
}

/// Connection to the cluster control plane, established once at startup
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    endpoint: String,
    addr: ControlPlaneAddr,
}

impl ControlPlaneClient {
    /// Validate the endpoint and set up the client
    pub fn connect(endpoint: &str) -> Result<Self, DriverError> {
        let fail = |reason: String| DriverError::ControlPlane {
            endpoint: endpoint.to_string(),
            reason,
        };

        let addr = if let Some(path) = endpoint.strip_prefix(UNIX_SCHEME) {
            if !path.starts_with('/') {
                return Err(fail("unix endpoint needs an absolute socket path".to_string()));
            }
            ControlPlaneAddr::Unix(path.to_string())
        } else {
            let uri: Uri = endpoint.parse().map_err(|e: http::uri::InvalidUri| fail(e.to_string()))?;
            let scheme = uri
                .scheme_str()
                .ok_or_else(|| fail("missing scheme".to_string()))?;
            if !ACCEPTED_SCHEMES.contains(&scheme) {
                return Err(fail(format!("unsupported scheme {}", scheme)));
            }
            let authority = uri
                .authority()
                .filter(|a| !a.host().is_empty())
                .ok_or_else(|| fail("missing host".to_string()))?;
            ControlPlaneAddr::Tcp {
                scheme: scheme.to_string(),
                authority: authority.to_string(),
            }
        };

        debug!("Control plane address resolved to {:?}", addr);
        info!("Connected to control plane at {}", endpoint);

        Ok(Self {
            endpoint: endpoint.to_string(),
            addr,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn addr(&self) -> &ControlPlaneAddr {
        &self.addr
    }
}
