use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tonic::transport::{Channel, Endpoint};
use tracing::{info, warn};

use crate::proto::master::master_client::MasterClient;

/// Dials `addr`, bounding the connection attempt and every subsequent read
/// on the resulting channel by `read_timeout` (the client's
/// `CLIENT_READ_TIMEOUT` knob - a stalled peer must not hang a caller
/// forever).
pub async fn dial(addr: &str, read_timeout: Duration) -> Result<Channel, tonic::transport::Error> {
    Endpoint::from_shared(format!("http://{}", addr))?
        .timeout(read_timeout)
        .connect()
        .await
}

/// Tries every address in `master_addrs` in order and connects to the first
/// one that accepts, the same fan-out chunk servers use when heartbeating
/// and the CLI client uses to find an entry point. Unlike a bare
/// first-success loop, every individual dial failure is retained and folded
/// into the final error so a caller sees why each candidate was rejected
/// rather than just "none worked".
pub async fn connect_to_master(
    master_addrs: &[String],
    read_timeout: Duration,
) -> Result<MasterClient<Channel>, Box<dyn std::error::Error>> {
    let mut failures = Vec::with_capacity(master_addrs.len());

    for addr in master_addrs {
        match dial(addr, read_timeout).await {
            Ok(channel) => {
                info!(%addr, "connected to master");
                return Ok(MasterClient::new(channel));
            }
            Err(e) => {
                warn!(%addr, error = %e, "failed to connect to master");
                failures.push(format!("{addr}: {e}"));
            }
        }
    }

    Err(format!(
        "no master servers are connectable out of {}: [{}]",
        master_addrs.len(),
        failures.join(", ")
    )
    .into())
}

/// `sha256(data)` as a lowercase hex string, the checksum format the chunk
/// server's wire contract requires for `store`/`replicate`/`download`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Seconds since the Unix epoch, used for lease expiry timestamps. Only ever
/// called by a proposer (leader), never from inside the deterministic apply
/// step - see the state machine's determinism invariant.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}

/// Splits a `host:port` pair into its components, used when building
/// redirect responses from a leader hint string.
pub fn split_host_port(addr: &str) -> Option<(String, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    Some((host.to_string(), port))
}
