//! Membership tracker (C3): aggregates chunk-server heartbeats into a live
//! set with timeouts. This is deliberately volatile, non-replicated local
//! state - it must never be read from inside the state machine's apply
//! step, only by the proposer when it decides placement.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

pub struct Membership {
    last_seen: RwLock<HashMap<String, Instant>>,
    liveness_window: Duration,
}

impl Membership {
    pub fn new(liveness_window: Duration) -> Self {
        Self {
            last_seen: RwLock::new(HashMap::new()),
            liveness_window,
        }
    }

    /// Records a heartbeat from `addr`, observed at the current instant.
    pub async fn record_heartbeat(&self, addr: &str) {
        let mut last_seen = self.last_seen.write().await;
        last_seen.insert(addr.to_string(), Instant::now());
    }

    /// Servers whose last heartbeat fell within the liveness window.
    pub async fn live_set(&self) -> HashSet<String> {
        let last_seen = self.last_seen.read().await;
        let now = Instant::now();
        last_seen
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) < self.liveness_window)
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    /// Every server that has ever heartbeated, live or not - the "statically
    /// configured server universe" invariant (I3) is interpreted as "has
    /// announced itself at least once", since nothing else registers
    /// identity in this design.
    pub async fn known_servers(&self) -> HashSet<String> {
        self.last_seen.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[tokio::test]
    async fn fresh_heartbeat_is_live() {
        let membership = Membership::new(Duration::from_secs(15));
        membership.record_heartbeat("a:1").await;
        let live = membership.live_set().await;
        assert!(live.contains("a:1"));
    }

    #[tokio::test]
    async fn stale_heartbeat_falls_out_of_the_live_set() {
        let membership = Membership::new(Duration::from_millis(20));
        membership.record_heartbeat("a:1").await;
        sleep(Duration::from_millis(40));
        let live = membership.live_set().await;
        assert!(!live.contains("a:1"));
        assert!(membership.known_servers().await.contains("a:1"));
    }
}
