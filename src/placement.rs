//! Placement engine (C4). Mirrors the upstream prototype's load-ranked
//! selection (a min-heap over replica count per server) but operates purely
//! over a snapshot of live servers and current replica counts, with no
//! shared-state side effects - callers own proposing the result.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashSet};

/// Number of chunks a file of `file_size` bytes splits into, given
/// `chunk_size` bytes per chunk - `ceil(file_size / chunk_size)`, so a
/// zero-byte file is zero chunks.
pub fn num_chunks(file_size: u64, chunk_size: u64) -> u64 {
    (file_size + chunk_size - 1) / chunk_size
}

/// Selects up to `k` servers to host a replica, drawn from `live` minus
/// `exclude`, ranked ascending by current replica count (ties broken by
/// server id for determinism) - least loaded first.
pub fn select_targets(
    k: usize,
    exclude: &HashSet<String>,
    live: &HashSet<String>,
    chunk_locations: &BTreeMap<String, BTreeSet<String>>,
) -> Vec<String> {
    let mut load: BTreeMap<&str, usize> = BTreeMap::new();
    for addr in live {
        if !exclude.contains(addr) {
            load.insert(addr.as_str(), 0);
        }
    }
    for replicas in chunk_locations.values() {
        for addr in replicas {
            if let Some(count) = load.get_mut(addr.as_str()) {
                *count += 1;
            }
        }
    }

    let mut heap: BinaryHeap<Reverse<(usize, &str)>> =
        load.into_iter().map(|(addr, count)| Reverse((count, addr))).collect();

    let mut selected = Vec::with_capacity(k);
    while selected.len() < k {
        match heap.pop() {
            Some(Reverse((count, addr))) => {
                selected.push(addr.to_string());
                heap.push(Reverse((count + 1, addr)));
            }
            None => break,
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn num_chunks_rounds_up() {
        assert_eq!(num_chunks(5000, 2048), 3);
        assert_eq!(num_chunks(2048, 2048), 1);
        assert_eq!(num_chunks(2049, 2048), 2);
        assert_eq!(num_chunks(1, 2048), 1);
        assert_eq!(num_chunks(0, 2048), 0);
    }

    #[test]
    fn select_targets_prefers_least_loaded_and_breaks_ties_by_id() {
        let live = set(&["s1:1", "s2:2", "s3:3"]);
        let mut locations = BTreeMap::new();
        locations.insert("x_chunk_0".to_string(), set(&["s1:1"]).into_iter().collect());

        let chosen = select_targets(2, &HashSet::new(), &live, &locations);
        assert_eq!(chosen, vec!["s2:2".to_string(), "s3:3".to_string()]);
    }

    #[test]
    fn select_targets_excludes_requested_servers() {
        let live = set(&["s1:1", "s2:2"]);
        let locations = BTreeMap::new();
        let exclude = set(&["s1:1"]);

        let chosen = select_targets(2, &exclude, &live, &locations);
        assert_eq!(chosen, vec!["s2:2".to_string()]);
    }

    #[test]
    fn select_targets_returns_fewer_than_k_when_undersupplied() {
        let live = set(&["s1:1"]);
        let locations = BTreeMap::new();
        let chosen = select_targets(2, &HashSet::new(), &live, &locations);
        assert_eq!(chosen, vec!["s1:1".to_string()]);
    }
}

#[cfg(test)]
mod proptests {
    use super::num_chunks;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn chunk_count_matches_ceiling_division(file_size in 0u64..10_000_000, chunk_size in 1u64..100_000) {
            let expected = (file_size + chunk_size - 1) / chunk_size;
            prop_assert_eq!(num_chunks(file_size, chunk_size), expected);
        }

        #[test]
        fn zero_size_file_is_zero_chunks(chunk_size in 1u64..100_000) {
            prop_assert_eq!(num_chunks(0, chunk_size), 0);
        }
    }
}
