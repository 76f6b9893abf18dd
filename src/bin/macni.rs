use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use macni::commands::{error_response, handle};
use macni::types::Request;
use macni::{Driver, DriverConfig};

/// Macvlan network driver daemon
#[derive(Parser)]
#[clap(name = "macni", author, version, about)]
struct Args {
    /// Path to a JSON config file
    #[clap(long)]
    config: Option<PathBuf>,

    /// Socket to serve driver requests on
    #[clap(long)]
    socket: Option<PathBuf>,

    /// Directory for persisted endpoint state
    #[clap(long)]
    state_dir: Option<PathBuf>,

    /// Control plane endpoint
    #[clap(long)]
    control_plane: Option<String>,

    /// Enable debug logging
    #[clap(short, long)]
    verbose: bool,
}

impl Args {
    fn driver_config(&self) -> Result<DriverConfig> {
        let mut config = match &self.config {
            Some(path) => DriverConfig::load(path)?,
            None => DriverConfig::default(),
        };
        if let Some(socket) = &self.socket {
            config.socket_path = socket.clone();
        }
        if let Some(state_dir) = &self.state_dir {
            config.state_dir = state_dir.clone();
        }
        if let Some(endpoint) = &self.control_plane {
            config.control_plane_endpoint = endpoint.clone();
        }
        Ok(config)
    }
}

async fn serve_connection(driver: Arc<Driver>, stream: UnixStream) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                let driver = driver.clone();
                tokio::task::spawn_blocking(move || handle(&driver, &request))
                    .await
                    .context("Driver task panicked")?
            }
            Err(e) => error_response(&format!("Malformed request: {}", e)),
        };

        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        writer.write_all(&out).await?;
    }

    Ok(())
}

async fn run(config: DriverConfig) -> Result<()> {
    let driver = Arc::new(Driver::init(&config).context("Failed to initialize macvlan driver")?);
    info!(
        "macvlan driver ready, control plane {}",
        driver.control_plane().endpoint()
    );

    if let Some(dir) = config.socket_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }
    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path)
            .with_context(|| format!("Failed to remove stale socket {}", config.socket_path.display()))?;
    }
    let listener = UnixListener::bind(&config.socket_path)
        .with_context(|| format!("Failed to bind {}", config.socket_path.display()))?;
    info!("Listening on {}", config.socket_path.display());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted.context("Failed to accept connection")?;
                let driver = driver.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(driver, stream).await {
                        error!("Connection error: {:#}", e);
                    }
                    debug!("Connection closed");
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    let _ = std::fs::remove_file(&config.socket_path);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up tracing
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();

    let _ = tracing::subscriber::set_global_default(subscriber);

    let config = args.driver_config()?;
    if let Err(err) = run(config).await {
        error!("macvlan driver error: {:#}", err);
        std::process::exit(1);
    }

    Ok(())
}
