//! Layered TOML configuration, split into per-component sub-structs the way
//! the upstream prototype split its `MasterConfig`/`ChunkServerConfig`/
//! `ClientConfig`/`CommonConfig` groups. Every field has a sane default so a
//! node can boot from bare CLI flags with no `config.toml` on disk at all.

use serde::Deserialize;
use std::fs;
use std::path::Path;

fn default_chunk_size() -> u64 {
    2048
}
fn default_replication_factor() -> usize {
    2
}
fn default_heartbeat_interval_secs() -> u64 {
    5
}
fn default_liveness_window_secs() -> u64 {
    15
}
fn default_lease_duration_secs() -> u64 {
    30
}
fn default_repair_period_secs() -> u64 {
    15
}
fn default_lease_sweep_period_secs() -> u64 {
    5
}
fn default_client_read_timeout_secs() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_output() -> String {
    "stdout".to_string()
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CommonConfig {
    pub chunk_size: u64,
    pub replication_factor: usize,
    pub heartbeat_interval_secs: u64,
    pub liveness_window_secs: u64,
    pub lease_duration_secs: u64,
    pub repair_period_secs: u64,
    pub lease_sweep_period_secs: u64,
    /// Socket read timeout applied to outbound connections made by clients
    /// (the CLI client dialing a master, and the master/chunk-server
    /// dialing each other on the client's behalf to move chunk bytes).
    pub client_read_timeout_secs: u64,
    pub log_level: String,
    pub log_output: String,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            replication_factor: default_replication_factor(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            liveness_window_secs: default_liveness_window_secs(),
            lease_duration_secs: default_lease_duration_secs(),
            repair_period_secs: default_repair_period_secs(),
            lease_sweep_period_secs: default_lease_sweep_period_secs(),
            client_read_timeout_secs: default_client_read_timeout_secs(),
            log_level: default_log_level(),
            log_output: default_log_output(),
        }
    }
}

fn default_election_timeout_min_ms() -> u64 {
    300
}
fn default_election_timeout_max_ms() -> u64 {
    600
}
fn default_commit_timeout_secs() -> u64 {
    5
}
fn default_data_dir() -> String {
    "data/master".to_string()
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub data_dir: String,
    pub peers: Vec<String>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub commit_timeout_secs: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            peers: Vec::new(),
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
            commit_timeout_secs: default_commit_timeout_secs(),
        }
    }
}

fn default_chunkserver_data_dir() -> String {
    "data/chunkserver".to_string()
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ChunkServerConfig {
    pub data_dir: String,
    pub master_addrs: Vec<String>,
}

impl Default for ChunkServerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_chunkserver_data_dir(),
            master_addrs: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct ClientConfig {
    pub master_addrs: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub master: MasterConfig,
    pub chunkserver: ChunkServerConfig,
    pub client: ClientConfig,
    pub common: CommonConfig,
}

/// Loads configuration from `path` if it exists, falling back to built-in
/// defaults otherwise (the CLI surface is expected to supply the knobs that
/// matter most - bind address and peer list - directly).
pub fn load_config(path: &str) -> Result<Config, Box<dyn std::error::Error>> {
    if !Path::new(path).exists() {
        return Ok(Config::default());
    }
    let config_content = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&config_content)?;
    Ok(config)
}
