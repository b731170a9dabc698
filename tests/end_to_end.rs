//! End-to-end scenarios driving real master/chunk-server nodes over gRPC,
//! in-process rather than as subprocesses (the binaries in `src/bin/` are
//! thin wiring over the same library types used here).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tonic::transport::{Channel, Server};

use quorumfs::chunkserver_service::ChunkService;
use quorumfs::client_lib;
use quorumfs::config::{ChunkServerConfig, CommonConfig};
use quorumfs::lease::LeaseManager;
use quorumfs::master_service::MasterService;
use quorumfs::membership::Membership;
use quorumfs::proto::chunk::chunk_server::ChunkServer;
use quorumfs::proto::master::master_client::MasterClient;
use quorumfs::proto::master::master_server::MasterServer;
use quorumfs::proto::master::{
    DownloadRequest, ListFilesRequest, Status as WireStatus, UploadRequest,
};
use quorumfs::proto::raft::consensus_server::ConsensusServer;
use quorumfs::raft::{ConsensusService, RaftConfig, RaftNode};
use quorumfs::repair::RepairLoop;
use quorumfs::state_machine::MasterState;

fn test_common() -> CommonConfig {
    CommonConfig {
        chunk_size: 2048,
        replication_factor: 2,
        heartbeat_interval_secs: 1,
        liveness_window_secs: 3,
        lease_duration_secs: 2,
        repair_period_secs: 1,
        lease_sweep_period_secs: 1,
        ..Default::default()
    }
}

struct MasterNode {
    addr: String,
    _data_dir: tempfile::TempDir,
    server: JoinHandle<()>,
}

async fn spawn_master(addr: &str, peers: Vec<String>, common: CommonConfig) -> MasterNode {
    let data_dir = tempfile::tempdir().unwrap();
    let state = Arc::new(tokio::sync::RwLock::new(MasterState::new()));

    let (apply_tx, mut apply_rx) = tokio::sync::mpsc::unbounded_channel();
    let apply_state = Arc::clone(&state);
    tokio::spawn(async move {
        while let Some(command) = apply_rx.recv().await {
            apply_state.write().await.apply(&command);
        }
    });

    let raft_config = RaftConfig {
        id: addr.to_string(),
        peers,
        data_dir: data_dir.path().to_path_buf(),
        election_timeout_min: Duration::from_millis(100),
        election_timeout_max: Duration::from_millis(200),
        heartbeat_interval: Duration::from_millis(30),
        commit_timeout: Duration::from_secs(5),
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

    let service = MasterService::new(
        Arc::clone(&raft),
        Arc::clone(&state),
        Arc::clone(&membership),
        Arc::clone(&leases),
        Arc::clone(&repair),
        common,
    );
    service.start_background_tasks();
    let consensus = ConsensusService::new(Arc::clone(&raft));

    let socket_addr: SocketAddr = addr.parse().unwrap();
    let server = tokio::spawn(async move {
        let _ = Server::builder()
            .add_service(MasterServer::new(service))
            .add_service(ConsensusServer::new(consensus))
            .serve(socket_addr)
            .await;
    });

    MasterNode {
        addr: addr.to_string(),
        _data_dir: data_dir,
        server,
    }
}

struct ChunkNode {
    addr: String,
    _data_dir: tempfile::TempDir,
    server: JoinHandle<()>,
}

async fn spawn_chunkserver(addr: &str, master_addrs: Vec<String>, common: CommonConfig) -> ChunkNode {
    let data_dir = tempfile::tempdir().unwrap();
    let config = ChunkServerConfig {
        data_dir: data_dir.path().to_string_lossy().to_string(),
        master_addrs: master_addrs.clone(),
    };
    let service = Arc::new(ChunkService::new(addr, &config, common));
    Arc::clone(&service).start_heartbeat_loop(master_addrs);

    let socket_addr: SocketAddr = addr.parse().unwrap();
    let grpc_service = (*service).clone();
    let server = tokio::spawn(async move {
        let _ = Server::builder()
            .add_service(ChunkServer::new(grpc_service))
            .serve(socket_addr)
            .await;
    });

    ChunkNode {
        addr: addr.to_string(),
        _data_dir: data_dir,
        server,
    }
}

async fn connect_retry(addr: &str) -> MasterClient<Channel> {
    for _ in 0..200 {
        if let Ok(client) = MasterClient::connect(format!("http://{}", addr)).await {
            return client;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("could not connect to master at {}", addr);
}

/// Polls every address until one answers `list_files` with `Success`,
/// returning a connected client to that (the current leader).
async fn wait_for_leader(addrs: &[&str]) -> (String, MasterClient<Channel>) {
    for _ in 0..200 {
        for addr in addrs {
            if let Ok(mut client) = MasterClient::connect(format!("http://{}", addr)).await {
                if let Ok(resp) = client.list_files(ListFilesRequest {}).await {
                    if resp.into_inner().status == WireStatus::Success as i32 {
                        return (addr.to_string(), client);
                    }
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("no leader elected among {:?}", addrs);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upload_download_round_trip() {
    let common = test_common();
    let master = spawn_master("127.0.0.1:47101", Vec::new(), common.clone()).await;
    let masters = vec![master.addr.clone()];
    let _c1 = spawn_chunkserver("127.0.0.1:47111", masters.clone(), common.clone()).await;
    let _c2 = spawn_chunkserver("127.0.0.1:47112", masters.clone(), common.clone()).await;

    // Give both chunk servers time to heartbeat into the master's membership.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut client = connect_retry(&master.addr).await;
    let read_timeout = Duration::from_secs(common.client_read_timeout_secs);

    let data: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
    client_lib::upload_file(&mut client, "foo", &data, common.chunk_size, read_timeout)
        .await
        .expect("upload should succeed");

    let downloaded = client_lib::download_file(&mut client, "foo", read_timeout)
        .await
        .expect("download should succeed");
    assert_eq!(downloaded, data);

    let resp = client
        .download(DownloadRequest {
            filename: "foo".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(resp.chunk_ids.len(), 3); // ceil(5000 / 2048)
    for locations in resp.chunk_locations.values() {
        assert_eq!(locations.servers.len(), 2); // RF=2 with exactly 2 live servers
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_failover_preserves_uploaded_file() {
    let common = test_common();
    let addrs = ["127.0.0.1:47121", "127.0.0.1:47122", "127.0.0.1:47123"];
    let mut masters = Vec::new();
    for addr in &addrs {
        let peers: Vec<String> = addrs
            .iter()
            .filter(|a| *a != addr)
            .map(|a| a.to_string())
            .collect();
        masters.push(spawn_master(addr, peers, common.clone()).await);
    }
    let master_addrs: Vec<String> = addrs.iter().map(|a| a.to_string()).collect();
    let _c1 = spawn_chunkserver("127.0.0.1:47141", master_addrs.clone(), common.clone()).await;
    let _c2 = spawn_chunkserver("127.0.0.1:47142", master_addrs.clone(), common.clone()).await;

    tokio::time::sleep(Duration::from_millis(300)).await;

    let (leader_addr, mut client) = wait_for_leader(&addrs).await;
    let read_timeout = Duration::from_secs(common.client_read_timeout_secs);
    let data: Vec<u8> = (0..8000u32).map(|i| (i % 256) as u8).collect();
    client_lib::upload_file(&mut client, "bar", &data, common.chunk_size, read_timeout)
        .await
        .expect("upload should succeed against the leader");

    // Kill the leader.
    let dead = masters
        .iter()
        .position(|m| m.addr == leader_addr)
        .expect("leader must be one of the spawned masters");
    masters[dead].server.abort();

    let remaining: Vec<&str> = addrs.iter().filter(|a| **a != leader_addr).copied().collect();
    let (_new_leader_addr, mut new_client) = wait_for_leader(&remaining).await;

    let files = client_lib::list_files(&mut new_client).await.unwrap();
    assert!(files.contains(&"bar".to_string()));

    let downloaded = client_lib::download_file(&mut new_client, "bar", read_timeout)
        .await
        .expect("new leader should still serve the file");
    assert_eq!(downloaded, data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chunkserver_failure_triggers_repair() {
    let common = test_common();
    let master = spawn_master("127.0.0.1:47131", Vec::new(), common.clone()).await;
    let masters = vec![master.addr.clone()];
    let c1 = spawn_chunkserver("127.0.0.1:47151", masters.clone(), common.clone()).await;
    let c2 = spawn_chunkserver("127.0.0.1:47152", masters.clone(), common.clone()).await;
    let _c3 = spawn_chunkserver("127.0.0.1:47153", masters.clone(), common.clone()).await;

    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut client = connect_retry(&master.addr).await;
    let read_timeout = Duration::from_secs(common.client_read_timeout_secs);
    let data: Vec<u8> = (0..2048u32).map(|i| (i % 256) as u8).collect();
    client_lib::upload_file(&mut client, "baz", &data, common.chunk_size, read_timeout)
        .await
        .unwrap();

    let resp = client
        .download(DownloadRequest {
            filename: "baz".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    let chunk_id = resp.chunk_ids[0].clone();
    let holders = resp.chunk_locations[&chunk_id].servers.clone();
    assert_eq!(holders.len(), 2);

    // Kill one of the two holders.
    if holders.contains(&c1.addr) {
        c1.server.abort();
    } else {
        c2.server.abort();
    }

    // Wait past the liveness window plus a repair period.
    tokio::time::sleep(Duration::from_secs(
        common.liveness_window_secs + common.repair_period_secs + 2,
    ))
    .await;

    let resp = client
        .download(DownloadRequest {
            filename: "baz".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    let repaired = resp.chunk_locations[&chunk_id].servers.clone();
    assert_eq!(repaired.len(), 2);
    assert!(repaired.contains(&"127.0.0.1:47153".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lease_collision_then_expiry() {
    let common = test_common();
    let master = spawn_master("127.0.0.1:47161", Vec::new(), common.clone()).await;
    let mut client = connect_retry(&master.addr).await;

    let expires_at = client_lib::lease(&mut client, "quux", "client-a")
        .await
        .expect("first lease should succeed");
    assert!(expires_at > 0);

    let err = client_lib::lease(&mut client, "quux", "client-b")
        .await
        .expect_err("second holder should be rejected while the lease is live");
    assert!(err.to_string().contains("AlreadyLeased") || err.to_string().contains("leased"));

    tokio::time::sleep(Duration::from_secs(
        common.lease_duration_secs + common.lease_sweep_period_secs + 2,
    ))
    .await;

    client_lib::lease(&mut client, "quux", "client-b")
        .await
        .expect("lease should succeed once the prior holder's lease expires");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn non_leader_redirects_to_the_leader() {
    let common = test_common();
    let addrs = ["127.0.0.1:47171", "127.0.0.1:47172"];
    let mut masters = Vec::new();
    for addr in &addrs {
        let peers: Vec<String> = addrs
            .iter()
            .filter(|a| *a != addr)
            .map(|a| a.to_string())
            .collect();
        masters.push(spawn_master(addr, peers, common.clone()).await);
    }
    let master_addrs: Vec<String> = addrs.iter().map(|a| a.to_string()).collect();
    let _c1 = spawn_chunkserver("127.0.0.1:47181", master_addrs.clone(), common.clone()).await;
    let _c2 = spawn_chunkserver("127.0.0.1:47182", master_addrs.clone(), common.clone()).await;

    tokio::time::sleep(Duration::from_millis(300)).await;

    let (leader_addr, _) = wait_for_leader(&addrs).await;
    let follower_addr = addrs.iter().find(|a| **a != leader_addr).unwrap();

    let mut follower_client = connect_retry(follower_addr).await;
    let data = b"redirect-me".to_vec();
    let resp = follower_client
        .upload(UploadRequest {
            filename: "needs-leader".to_string(),
            file_size: data.len() as u64,
        })
        .await
        .unwrap()
        .into_inner();

    assert_eq!(resp.status, WireStatus::Redirect as i32);
    let redirect = resp.redirect.expect("redirect response must carry a leader hint");
    let redirect_addr = format!("{}:{}", redirect.leader_host, redirect.leader_port);
    assert_eq!(redirect_addr, leader_addr);

    let mut leader_client = connect_retry(&redirect_addr).await;
    let read_timeout = Duration::from_secs(common.client_read_timeout_secs);
    client_lib::upload_file(
        &mut leader_client,
        "needs-leader",
        &data,
        common.chunk_size,
        read_timeout,
    )
    .await
    .expect("re-issuing against the leader should succeed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_upload_is_rejected_and_state_is_unchanged() {
    let common = test_common();
    let master = spawn_master("127.0.0.1:47191", Vec::new(), common.clone()).await;
    let masters = vec![master.addr.clone()];
    let _c1 = spawn_chunkserver("127.0.0.1:47192", masters.clone(), common.clone()).await;
    let _c2 = spawn_chunkserver("127.0.0.1:47193", masters.clone(), common.clone()).await;

    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut client = connect_retry(&master.addr).await;
    let read_timeout = Duration::from_secs(common.client_read_timeout_secs);
    let data = b"hello world".to_vec();
    client_lib::upload_file(&mut client, "foo", &data, common.chunk_size, read_timeout)
        .await
        .unwrap();

    let before = client
        .download(DownloadRequest {
            filename: "foo".to_string(),
        })
        .await
        .unwrap()
        .into_inner();

    let status = client
        .upload(UploadRequest {
            filename: "foo".to_string(),
            file_size: data.len() as u64,
        })
        .await
        .expect_err("uploading an existing filename must be rejected");
    assert_eq!(status.code(), tonic::Code::AlreadyExists);

    let after = client
        .download(DownloadRequest {
            filename: "foo".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(before.chunk_ids, after.chunk_ids);
}
