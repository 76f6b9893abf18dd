use mac_address::MacAddress;
use nix::errno::Errno;
use nix::net::if_::if_nametoindex;
use std::process::Command;
use tracing::{debug, info};

use crate::error::LinkError;
use crate::plugin::endpoint::format_mac;
use crate::plugin::MacvlanMode;

/// A link that exists on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkHandle {
    pub name: String,
    pub index: u32,
}

/// Description of a macvlan sub-interface to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacvlanLink {
    pub name: String,
    pub parent: String,
    pub mode: MacvlanMode,
    pub mac: MacAddress,
    /// Master and VLAN id when the parent is a VLAN sub-interface
    pub vlan: Option<(String, u16)>,
    /// Parent is a dummy link owned by an internal network
    pub internal: bool,
}

/// Host link manipulation used by the driver
pub trait LinkOps: Send + Sync {
    /// Find a link by name, `None` if it does not exist
    fn lookup_interface(&self, name: &str) -> Result<Option<LinkHandle>, LinkError>;

    fn delete_interface(&self, link: &LinkHandle) -> Result<(), LinkError>;

    /// Create the sub-interface, creating a missing VLAN or dummy parent first
    fn create_macvlan(&self, link: &MacvlanLink) -> Result<(), LinkError>;
}

/// [`LinkOps`] backed by `if_nametoindex` and the `ip` command
#[derive(Debug, Clone, Default)]
pub struct IpLink;

impl IpLink {
    pub fn new() -> Self {
        Self
    }

    fn run(&self, args: &[&str], tolerate_exists: bool) -> Result<(), LinkError> {
        debug!("Running ip {}", args.join(" "));
        let output = Command::new("ip").args(args).output()?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() && !(tolerate_exists && stderr.contains("File exists")) {
            return Err(LinkError::CommandFailed {
                command: format!("ip {}", args.join(" ")),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    fn ensure_parent(&self, link: &MacvlanLink) -> Result<(), LinkError> {
        if self.lookup_interface(&link.parent)?.is_some() {
            return Ok(());
        }

        if let Some((master, vlan)) = &link.vlan {
            info!("Creating VLAN interface: {}", link.parent);
            self.run(
                &["link", "add", "link", master, "name", &link.parent,
                  "type", "vlan", "id", &vlan.to_string()],
                true,
            )?;
        } else if link.internal {
            info!("Creating dummy interface: {}", link.parent);
            self.run(&["link", "add", "name", &link.parent, "type", "dummy"], true)?;
        } else {
            return Err(LinkError::Interface {
                interface: link.parent.clone(),
                reason: "parent interface does not exist".to_string(),
            });
        }

        self.run(&["link", "set", "dev", &link.parent, "up"], false)
    }
}

impl LinkOps for IpLink {
    fn lookup_interface(&self, name: &str) -> Result<Option<LinkHandle>, LinkError> {
        match if_nametoindex(name) {
            Ok(index) => Ok(Some(LinkHandle {
                name: name.to_string(),
                index,
            })),
            Err(Errno::ENODEV) => Ok(None),
            Err(e) => Err(LinkError::Interface {
                interface: name.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn delete_interface(&self, link: &LinkHandle) -> Result<(), LinkError> {
        self.run(&["link", "delete", "dev", &link.name], false)
    }

    fn create_macvlan(&self, link: &MacvlanLink) -> Result<(), LinkError> {
        self.ensure_parent(link)?;

        info!(
            "Creating macvlan interface {} on {} in {} mode",
            link.name, link.parent, link.mode
        );
        let mac = format_mac(&link.mac);
        self.run(
            &["link", "add", "link", &link.parent, "name", &link.name,
              "address", &mac, "type", "macvlan", "mode", link.mode.as_str()],
            false,
        )
    }
}
