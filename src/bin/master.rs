//! Master node entry point (C7 bootstrap): wires the replicated log (C1),
//! the namespace/lease state machine (C2), membership tracking (C3), the
//! lease manager (C5), the repair loop (C6), and the client-facing `Master`
//! service (C7) into one tonic server, plus the peer-facing `Consensus`
//! service raft uses for RequestVote/AppendEntries.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tonic::transport::Server;
use tracing::info;

use quorumfs::config::{load_config, CommonConfig, MasterConfig};
use quorumfs::lease::LeaseManager;
use quorumfs::logging;
use quorumfs::master_service::MasterService;
use quorumfs::membership::Membership;
use quorumfs::proto::master::master_server::MasterServer;
use quorumfs::proto::raft::consensus_server::ConsensusServer;
use quorumfs::raft::{ConsensusService, RaftConfig, RaftNode};
use quorumfs::repair::RepairLoop;
use quorumfs::state_machine::MasterState;

/// `qfs-master <port> [peer_host peer_port]...`, or the flag-based
/// equivalent - the drop-in argv contract the original prototype's binaries
/// offered, plus named flags for what doesn't map onto bare positions.
#[derive(Parser, Debug)]
#[command(name = "qfs-master", about = "Starts a quorumfs master node")]
struct Args {
    /// Path to a TOML config file; built-in defaults apply if it's absent.
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Bind address (host:port). Overrides the positional port.
    #[arg(long)]
    addr: Option<String>,

    /// Peer master address (host:port); may be repeated.
    #[arg(long = "peer", value_name = "HOST:PORT")]
    peer: Vec<String>,

    /// Legacy positional form: `<port> [peer_host peer_port]...`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    positional: Vec<String>,
}

fn legacy_peers(positional: &[String]) -> Vec<String> {
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
    let master_config: MasterConfig = config.master;

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

    let mut peers = master_config.peers.clone();
    peers.extend(args.peer.clone());
    peers.extend(legacy_peers(&args.positional));
    peers.retain(|peer| peer != &addr);
    peers.sort();
    peers.dedup();

    let _guard = logging::init("qfs-master", &common);

    let state = Arc::new(tokio::sync::RwLock::new(MasterState::new()));

    // Raft applies committed commands synchronously from inside its own
    // tick loop; it hands them off over a channel rather than locking
    // `state` itself, so the apply callback never awaits.
    let (apply_tx, mut apply_rx) = tokio::sync::mpsc::unbounded_channel();
    let apply_state = Arc::clone(&state);
    tokio::spawn(async move {
        while let Some(command) = apply_rx.recv().await {
            apply_state.write().await.apply(&command);
        }
    });

    let raft_config = RaftConfig {
        id: addr.clone(),
        peers: peers.clone(),
        data_dir: PathBuf::from(&master_config.data_dir),
        election_timeout_min: Duration::from_millis(master_config.election_timeout_min_ms),
        election_timeout_max: Duration::from_millis(master_config.election_timeout_max_ms),
        heartbeat_interval: Duration::from_millis(50),
        commit_timeout: Duration::from_secs(master_config.commit_timeout_secs),
    };
    let raft = RaftNode::new(raft_config, move |command| {
        let _ = apply_tx.send(command.clone());
    });

    let membership = Arc::new(Membership::new(Duration::from_secs(
        common.liveness_window_secs,
    )));
    let leases = LeaseManager::new(
        Arc::clone(&raft),
        Arc::clone(&state),
        common.lease_duration_secs,
        Duration::from_secs(common.lease_sweep_period_secs),
    );
    let repair = RepairLoop::new(
        Arc::clone(&raft),
        Arc::clone(&state),
        Arc::clone(&membership),
        common.replication_factor,
        Duration::from_secs(common.repair_period_secs),
    );

    let master_service = MasterService::new(
        Arc::clone(&raft),
        Arc::clone(&state),
        Arc::clone(&membership),
        Arc::clone(&leases),
        Arc::clone(&repair),
        common.clone(),
    );
    master_service.start_background_tasks();

    let consensus_service = ConsensusService::new(Arc::clone(&raft));

    info!(%addr, ?peers, "qfs-master listening");

    Server::builder()
        .add_service(MasterServer::new(master_service))
        .add_service(ConsensusServer::new(consensus_service))
        .serve(socket_addr)
        .await?;

    Ok(())
}
