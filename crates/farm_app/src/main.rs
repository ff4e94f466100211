mod console;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use farm_network::{NodeConfig, NodeIdentity, PeerNode, WsTransport};

use crate::console::ConsoleBridge;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_SITE_NAME: &str = "farm-site";

#[derive(Parser, Debug)]
#[command(name = "farmnet")]
#[command(about = "Peer-to-peer pest alert node for farm sites", version)]
struct Cli {
    /// Config file (JSON). Defaults to ~/.farmnet/config.json.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Site name used when a new identity is generated.
    #[arg(long)]
    name: Option<String>,

    /// Address to listen on, e.g. 0.0.0.0:9470.
    #[arg(long)]
    listen: Option<String>,

    /// Address neighbors should dial, e.g. 192.168.1.20:9470. Needed when
    /// listening on a wildcard address.
    #[arg(long)]
    advertise: Option<String>,

    /// Directory for the identity, message store and peer registry.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Neighbor to introduce ourselves to at startup. Repeatable.
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Hop budget for messages originated here.
    #[arg(long)]
    ttl: Option<u8>,
}

/// Root directory for app state: `~/.farmnet`.
fn base_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".farmnet"))
}

fn build_config(cli: &Cli, base: &std::path::Path) -> Result<NodeConfig> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| base.join("config.json"));
    let from_file = config_path.exists();
    let mut config = NodeConfig::load_or_default(&config_path);
    if !from_file {
        config.data_dir = base.join("data");
    }

    if let Some(listen) = &cli.listen {
        config.listen_addr = listen.clone();
    }
    if let Some(advertise) = &cli.advertise {
        config.advertise_addr = Some(advertise.clone());
    }
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(ttl) = cli.ttl {
        config.default_ttl_hops = ttl;
    }
    for peer in &cli.peers {
        if !config.known_peers.contains(peer) {
            config.known_peers.push(peer.clone());
        }
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let base = base_dir()?;

    let _log_guard = logging::init_logging(&base.join("logs")).context("Failed to initialize logging")?;
    info!("Starting farmnet v{VERSION}");

    let config = build_config(&cli, &base)?;

    let identity_path = config.identity_path();
    let mut identity = NodeIdentity::load_or_generate(
        &identity_path,
        cli.name.as_deref().unwrap_or(DEFAULT_SITE_NAME),
    );
    if let Some(name) = &cli.name {
        if &identity.name != name {
            identity.name = name.clone();
            identity
                .save_to_file(&identity_path)
                .context("Failed to save identity")?;
        }
    }
    info!("Site {} ({})", identity.name, identity.peer_id);

    let mut node = PeerNode::open(
        identity,
        config,
        Arc::new(WsTransport::new()),
        Arc::new(ConsoleBridge),
    )
    .context("Failed to open node state")?;
    node.start()
        .await
        .context("Failed to start node (use --advertise when listening on 0.0.0.0)")?;

    if let (Some(addr), Some(advertised)) = (node.local_addr(), node.advertised_addr()) {
        println!(
            "farmnet {VERSION}: {} listening on {addr}, reachable at {advertised}",
            node.identity().name
        );
    }

    let result = console::run(&node).await;
    node.stop().await;
    info!("farmnet stopped");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("farmnet").chain(args.iter().copied()))
    }

    #[test]
    fn test_defaults_live_under_base_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let config = build_config(&cli(&[]), tmp.path()).unwrap();
        assert_eq!(config.data_dir, tmp.path().join("data"));
        assert!(config.known_peers.is_empty());
    }

    #[test]
    fn test_flags_override_config_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("site.json");
        let mut on_disk = NodeConfig::default();
        on_disk.known_peers = vec!["10.0.0.2:9470".to_string()];
        on_disk.save_to_file(&path).unwrap();

        let config = build_config(
            &cli(&[
                "--config",
                path.to_str().unwrap(),
                "--listen",
                "127.0.0.1:9999",
                "--ttl",
                "3",
                "--peer",
                "10.0.0.2:9470",
                "--peer",
                "10.0.0.3:9470",
            ]),
            tmp.path(),
        )
        .unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:9999");
        assert_eq!(config.default_ttl_hops, 3);
        assert_eq!(config.data_dir, NodeConfig::default().data_dir);
        assert_eq!(config.known_peers, vec!["10.0.0.2:9470", "10.0.0.3:9470"]);
    }

    #[test]
    fn test_advertise_flag_sets_config() {
        let tmp = tempfile::tempdir().unwrap();
        let config = build_config(&cli(&["--advertise", "192.168.1.20:9470"]), tmp.path()).unwrap();
        assert_eq!(config.advertise_addr.as_deref(), Some("192.168.1.20:9470"));
        assert_eq!(
            config.advertised_addr("0.0.0.0:9470").unwrap(),
            "192.168.1.20:9470"
        );

        assert!(build_config(&cli(&["--advertise", "0.0.0.0:9470"]), tmp.path()).is_err());
    }

    #[test]
    fn test_excessive_ttl_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(build_config(&cli(&["--ttl", "200"]), tmp.path()).is_err());
    }
}
