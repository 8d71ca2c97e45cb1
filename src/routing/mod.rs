//! Deterministic request routing for the sharding proxy

mod ring;

pub use ring::{RoutingError, ShardingRing, DEFAULT_VIRTUAL_NODES};
