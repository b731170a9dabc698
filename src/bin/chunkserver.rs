//! Chunk server entry point (C8 bootstrap): starts the checksum-verified
//! blob store's gRPC surface and its background heartbeat task.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tonic::transport::Server;
use tracing::info;

use quorumfs::chunkserver_service::ChunkService;
use quorumfs::config::{load_config, ChunkServerConfig, CommonConfig};
use quorumfs::logging;
use quorumfs::proto::chunk::chunk_server::ChunkServer;

/// `qfs-chunkserver <port> [master_host master_port]...`, or the flag-based
/// equivalent.
#[derive(Parser, Debug)]
#[command(name = "qfs-chunkserver", about = "Starts a quorumfs chunk server")]
struct Args {
    /// Path to a TOML config file; built-in defaults apply if it's absent.
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Bind address (host:port). Overrides the positional port.
    #[arg(long)]
    addr: Option<String>,

    /// Master address (host:port) to heartbeat against; may be repeated.
    #[arg(long = "master", value_name = "HOST:PORT")]
    master: Vec<String>,

    /// Legacy positional form: `<port> [master_host master_port]...`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    positional: Vec<String>,
}

fn legacy_masters(positional: &[String]) -> Vec<String> {
    if positional.len() <= 1 {
        return Vec::new();
    }
    positional[1..]
        .chunks(2)
        .filter(|pair| pair.len() == 2)
        .map(|pair| format!("{}:{}", pair[0], pair[1]))
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args.config)?;
    let common: CommonConfig = config.common;
    let chunkserver_config: ChunkServerConfig = config.chunkserver;

    let addr = match &args.addr {
        Some(addr) => addr.clone(),
        None => {
            let port = args
                .positional
                .first()
                .expect("a port or --addr is required");
            format!("0.0.0.0:{}", port)
        }
    };
    let socket_addr: SocketAddr = addr.parse()?;

    let mut master_addrs = chunkserver_config.master_addrs.clone();
    master_addrs.extend(args.master.clone());
    master_addrs.extend(legacy_masters(&args.positional));
    master_addrs.sort();
    master_addrs.dedup();

    let _guard = logging::init("qfs-chunkserver", &common);

    let service = Arc::new(ChunkService::new(&addr, &chunkserver_config, common));
    Arc::clone(&service).start_heartbeat_loop(master_addrs.clone());

    info!(%addr, masters = ?master_addrs, "qfs-chunkserver listening");

    Server::builder()
        .add_service(ChunkServer::new((*service).clone()))
        .serve(socket_addr)
        .await?;

    Ok(())
}
