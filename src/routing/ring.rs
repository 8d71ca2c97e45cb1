//! Consistent-hash ring over backend addresses
//!
//! Each backend is placed on the ring at `virtual_nodes` positions derived
//! from BLAKE3 hashes of `"<backend>:<index>"`. A key belongs to the first
//! position at or after its own hash, wrapping around. Adding one backend to
//! a ring of N moves roughly 1/(N+1) of keys.

use std::collections::{BTreeMap, BTreeSet};

use blake3::hash;
use thiserror::Error;

/// Default virtual nodes per backend
pub const DEFAULT_VIRTUAL_NODES: usize = 150;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("Sharding ring needs at least one backend")]
    NoBackends,

    #[error("Virtual node count must be greater than zero")]
    NoVirtualNodes,
}

/// Immutable ring built once from a static backend list
#[derive(Debug, Clone)]
pub struct ShardingRing {
    ring: BTreeMap<u64, String>,
    backends: Vec<String>,
    virtual_nodes: usize,
}

impl ShardingRing {
    pub fn new(backends: &[String], virtual_nodes: usize) -> Result<Self, RoutingError> {
        if virtual_nodes == 0 {
            return Err(RoutingError::NoVirtualNodes);
        }

        let unique: BTreeSet<&String> = backends.iter().collect();
        if unique.is_empty() {
            return Err(RoutingError::NoBackends);
        }

        let mut ring = BTreeMap::new();
        for backend in &unique {
            for i in 0..virtual_nodes {
                ring.insert(Self::hash_vnode(backend, i), (*backend).clone());
            }
        }

        Ok(Self {
            ring,
            backends: unique.into_iter().cloned().collect(),
            virtual_nodes,
        })
    }

    pub fn with_defaults(backends: &[String]) -> Result<Self, RoutingError> {
        Self::new(backends, DEFAULT_VIRTUAL_NODES)
    }

    /// Backend responsible for `key`. Pure function of the key for a given
    /// backend set.
    pub fn get_node(&self, key: &str) -> &str {
        let position = Self::hash_key(key);
        self.ring
            .range(position..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, backend)| backend.as_str())
            // the ring is never empty after construction
            .unwrap_or_default()
    }

    /// Distinct backends, sorted
    pub fn backends(&self) -> &[String] {
        &self.backends
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    fn hash_key(key: &str) -> u64 {
        position(hash(key.as_bytes()))
    }

    fn hash_vnode(backend: &str, index: usize) -> u64 {
        position(hash(format!("{}:{}", backend, index).as_bytes()))
    }
}

fn position(h: blake3::Hash) -> u64 {
    let mut head = [0u8; 8];
    head.copy_from_slice(&h.as_bytes()[..8]);
    u64::from_be_bytes(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn backends(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("http://10.0.0.{}:8080", i + 1)).collect()
    }

    fn keys(n: usize) -> Vec<String> {
        (0..n)
            .map(|i| format!("2024-01-01T10:{:02}:{:02}+00:00-message {}", i % 60, i % 59, i))
            .collect()
    }

    #[test]
    fn test_empty_backend_list_is_rejected() {
        assert_eq!(ShardingRing::with_defaults(&[]).unwrap_err(), RoutingError::NoBackends);
        assert_eq!(
            ShardingRing::new(&backends(2), 0).unwrap_err(),
            RoutingError::NoVirtualNodes
        );
    }

    #[test]
    fn test_single_backend_gets_everything() {
        let ring = ShardingRing::with_defaults(&backends(1)).unwrap();
        for key in keys(100) {
            assert_eq!(ring.get_node(&key), "http://10.0.0.1:8080");
        }
    }

    #[test]
    fn test_routing_is_deterministic() {
        let a = ShardingRing::with_defaults(&backends(3)).unwrap();
        let b = ShardingRing::with_defaults(&backends(3)).unwrap();
        for key in keys(500) {
            assert_eq!(a.get_node(&key), a.get_node(&key));
            assert_eq!(a.get_node(&key), b.get_node(&key));
        }
    }

    #[test]
    fn test_duplicate_backends_are_collapsed() {
        let mut list = backends(2);
        list.push(list[0].clone());
        let ring = ShardingRing::with_defaults(&list).unwrap();
        assert_eq!(ring.backends().len(), 2);
    }

    #[test]
    fn test_load_is_spread() {
        let ring = ShardingRing::with_defaults(&backends(4)).unwrap();
        let mut counts: HashMap<&str, usize> = HashMap::new();
        let keys = keys(10_000);
        for key in &keys {
            *counts.entry(ring.get_node(key)).or_default() += 1;
        }

        assert_eq!(counts.len(), 4);
        for (backend, count) in counts {
            assert!(
                (1_500..=3_500).contains(&count),
                "{backend} received {count} of 10000 keys"
            );
        }
    }

    #[test]
    fn test_adding_backend_bounds_churn() {
        let before = ShardingRing::with_defaults(&backends(4)).unwrap();
        let after = ShardingRing::with_defaults(&backends(5)).unwrap();
        let keys = keys(10_000);

        let moved = keys
            .iter()
            .filter(|k| before.get_node(k) != after.get_node(k))
            .count();

        // Ideal is 1/5 of keys; allow generous slack for hash variance
        assert!(moved < 3_000, "{moved} of 10000 keys remapped");
        // every moved key must land on the new backend
        for key in &keys {
            if before.get_node(key) != after.get_node(key) {
                assert_eq!(after.get_node(key), "http://10.0.0.5:8080");
            }
        }
    }
}
