pub mod config;
pub mod errors;
pub mod lease;
pub mod logging;
pub mod master_service;
pub mod membership;
pub mod placement;
pub mod raft;
pub mod repair;
pub mod state_machine;

pub mod chunkserver_impl;
pub mod chunkserver_service;
pub mod client_lib;
pub mod util;

pub mod proto {
    pub mod master {
        tonic::include_proto!("master");
    }
    pub mod raft {
        tonic::include_proto!("raft");
    }
    pub mod chunk {
        tonic::include_proto!("chunk");
    }
}
