mod quic;
mod ws;

use anyhow::{Context, Result};
use clap::Parser;
use ndt7_engine::{JsonFileSink, LogObserver, Session};
use ndt7_model::{BoundsOverride, ServerConfig};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "ndt7 download/upload measurement server")]
struct Args {
    /// TOML configuration file; flags below override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Plain WebSocket listen address.
    #[arg(long)]
    ws_addr: Option<SocketAddr>,

    /// QUIC listen address (needs --cert and --key).
    #[arg(long)]
    quic_addr: Option<SocketAddr>,

    /// PEM certificate chain.
    #[arg(long)]
    cert: Option<PathBuf>,

    /// PEM private key.
    #[arg(long)]
    key: Option<PathBuf>,

    /// Root directory for result files.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long)]
    max_runtime_ms: Option<u64>,
    #[arg(long)]
    default_runtime_ms: Option<u64>,
    #[arg(long)]
    max_message_size: Option<usize>,

    /// More output; repeat for trace level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn server_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => ServerConfig::default(),
        };
        if self.ws_addr.is_some() {
            config.ws_addr = self.ws_addr;
        }
        if self.quic_addr.is_some() {
            config.quic_addr = self.quic_addr;
        }
        if self.cert.is_some() {
            config.cert = self.cert.clone();
        }
        if self.key.is_some() {
            config.key = self.key.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        config.bounds.merge(&BoundsOverride {
            max_runtime_ms: self.max_runtime_ms,
            default_runtime_ms: self.default_runtime_ms,
            max_message_size: self.max_message_size,
            ..Default::default()
        });
        Ok(config)
    }
}

fn load_config(path: &Path) -> Result<ServerConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: ServerConfig = toml::from_str(&content).context("Failed to parse config file")?;
    Ok(config)
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);
    info!("ndt7-server starting…");

    let config = args.server_config()?;
    let bounds = config.session_bounds().context("Invalid session bounds")?;
    let session = Session::new(
        bounds,
        Arc::new(LogObserver),
        Arc::new(JsonFileSink::new(&config.data_dir)),
    )?
    .with_server_metadata(config.metadata());

    let shutdown = CancellationToken::new();
    let mut listeners = JoinSet::new();
    if let Some(addr) = config.ws_addr {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        listeners.spawn(ws::serve(listener, session.clone(), shutdown.clone()));
    }
    if let Some(addr) = config.quic_addr {
        let (Some(cert), Some(key)) = (&config.cert, &config.key) else {
            anyhow::bail!("--quic-addr needs --cert and --key");
        };
        let endpoint = quic::bind(addr, cert, key)?;
        listeners.spawn(quic::serve(endpoint, session.clone(), shutdown.clone()));
    }
    if listeners.is_empty() {
        anyhow::bail!("no listener configured");
    }

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("Failed to listen for ctrl-c")?;
            info!("shutting down");
        }
        Some(res) = listeners.join_next() => {
            warn!("listener stopped early");
            res??;
        }
    }
    shutdown.cancel();
    while let Some(res) = listeners.join_next().await {
        res??;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ndt7.toml");
        fs::write(
            &path,
            r#"
            ws_addr = "127.0.0.1:9000"
            data_dir = "/srv/ndt"

            [bounds]
            max_runtime_ms = 8000
            default_runtime_ms = 4000
            "#,
        )
        .unwrap();

        let args = Args::parse_from([
            "ndt7-server",
            "--config",
            path.to_str().unwrap(),
            "--data-dir",
            "/tmp/results",
            "--default-runtime-ms",
            "2000",
        ]);
        let config = args.server_config().unwrap();
        assert_eq!(config.ws_addr, Some("127.0.0.1:9000".parse().unwrap()));
        assert_eq!(config.data_dir, PathBuf::from("/tmp/results"));
        let bounds = config.session_bounds().unwrap();
        assert_eq!(bounds.max_runtime, Duration::from_secs(8));
        assert_eq!(bounds.default_runtime, Duration::from_secs(2));
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let args = Args::parse_from(["ndt7-server", "--config", "/nonexistent/ndt7.toml"]);
        assert!(args.server_config().is_err());
    }
}
