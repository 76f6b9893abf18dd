use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use macni::commands;
use macni::config::{MODE_OPT, PARENT_OPT};
use macni::plugin::network::supported_modes;
use macni::types::{
    AllocateNetworkRequest, CreateEndpointRequest, DeleteEndpointRequest, EndpointInterface,
    FreeNetworkRequest, InfoRequest, IpamData, Options, Request,
};

/// A command line tool to talk to a running macni driver
#[derive(Parser)]
#[clap(name = "macni-ctl", author, version, about)]
struct Cli {
    /// Path to the driver socket
    #[clap(long, default_value = "/run/docker/plugins/macni.sock")]
    socket: PathBuf,

    /// Enable verbose output
    #[clap(short, long)]
    verbose: bool,

    /// Subcommand to execute
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Perform the plugin handshake
    Activate,

    /// Show driver capabilities
    Capabilities,

    /// Allocate a macvlan network
    Allocate {
        /// Network ID
        #[clap(long)]
        id: String,

        /// Parent interface (eth1, or eth1.100 for a VLAN)
        #[clap(long)]
        parent: Option<String>,

        /// Macvlan mode
        #[clap(long, help = format!("Macvlan mode ({})", supported_modes()))]
        mode: Option<String>,

        /// IPv4 pool (CIDR notation), repeatable
        #[clap(long, required = true)]
        subnet: Vec<String>,

        /// Gateway of the first IPv4 pool
        #[clap(long)]
        gateway: Option<String>,

        /// IPv6 pool (CIDR notation), repeatable
        #[clap(long)]
        subnet_v6: Vec<String>,
    },

    /// Free a macvlan network
    Free {
        /// Network ID
        #[clap(long)]
        id: String,
    },

    /// Create an endpoint
    CreateEndpoint {
        /// Network ID
        #[clap(long)]
        network: String,

        /// Endpoint ID
        #[clap(long)]
        id: String,

        /// IPv4 address with prefix length
        #[clap(long)]
        address: String,

        /// IPv6 address with prefix length
        #[clap(long)]
        address_v6: Option<String>,

        /// MAC address, derived from the IPv4 address when omitted
        #[clap(long)]
        mac: Option<String>,
    },

    /// Delete an endpoint
    DeleteEndpoint {
        /// Network ID
        #[clap(long)]
        network: String,

        /// Endpoint ID
        #[clap(long)]
        id: String,
    },

    /// Show endpoint details
    Info {
        /// Network ID
        #[clap(long)]
        network: String,

        /// Endpoint ID
        #[clap(long)]
        id: String,
    },
}

impl Commands {
    fn into_request(self) -> Result<Request> {
        let request = match self {
            Commands::Activate => Request {
                method: commands::ACTIVATE.to_string(),
                body: Value::Null,
            },
            Commands::Capabilities => Request {
                method: commands::GET_CAPABILITIES.to_string(),
                body: Value::Null,
            },
            Commands::Allocate { id, parent, mode, subnet, gateway, subnet_v6 } => {
                let mut options = Options::new();
                if let Some(parent) = parent {
                    options.insert(PARENT_OPT.to_string(), Value::String(parent));
                }
                if let Some(mode) = mode {
                    options.insert(MODE_OPT.to_string(), Value::String(mode));
                }
                let mut ipv4_data: Vec<IpamData> = subnet.iter().map(|s| IpamData::pool(s)).collect();
                if let (Some(first), Some(gateway)) = (ipv4_data.first_mut(), gateway) {
                    first.gateway = gateway;
                }
                let ipv6_data = subnet_v6.iter().map(|s| IpamData::pool(s)).collect();

                Request::new(
                    commands::ALLOCATE_NETWORK,
                    &AllocateNetworkRequest {
                        network_id: id,
                        options,
                        ipv4_data,
                        ipv6_data,
                    },
                )?
            }
            Commands::Free { id } => Request::new(
                commands::FREE_NETWORK,
                &FreeNetworkRequest { network_id: id },
            )?,
            Commands::CreateEndpoint { network, id, address, address_v6, mac } => Request::new(
                commands::CREATE_ENDPOINT,
                &CreateEndpointRequest {
                    network_id: network,
                    endpoint_id: id,
                    interface: Some(EndpointInterface {
                        address,
                        address_ipv6: address_v6.unwrap_or_default(),
                        mac_address: mac.unwrap_or_default(),
                    }),
                    options: Options::new(),
                },
            )?,
            Commands::DeleteEndpoint { network, id } => Request::new(
                commands::DELETE_ENDPOINT,
                &DeleteEndpointRequest {
                    network_id: network,
                    endpoint_id: id,
                },
            )?,
            Commands::Info { network, id } => Request::new(
                commands::ENDPOINT_INFO,
                &InfoRequest {
                    network_id: network,
                    endpoint_id: id,
                },
            )?,
        };
        Ok(request)
    }
}

fn send(socket: &Path, request: &Request) -> Result<Value> {
    let mut stream = UnixStream::connect(socket)
        .with_context(|| format!("Failed to connect to driver at {}", socket.display()))?;

    let mut line = serde_json::to_vec(request)?;
    line.push(b'\n');
    stream.write_all(&line).context("Failed to send request")?;
    debug!("Sent {}", request.method);

    let mut response = String::new();
    BufReader::new(stream)
        .read_line(&mut response)
        .context("Failed to read response")?;
    serde_json::from_str(&response).context("Failed to parse driver response")
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "warn" };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let request = cli.command.into_request()?;
    let response = send(&cli.socket, &request)?;

    println!("{}", serde_json::to_string_pretty(&response)?);

    if let Some(err) = response.get("Err").and_then(Value::as_str) {
        anyhow::bail!("{} failed: {}", request.method, err);
    }

    Ok(())
}
