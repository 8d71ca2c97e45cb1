//! Sharding proxy
//!
//! Sits in front of several logfed instances. Each ingested record is sent
//! to exactly one backend chosen by the consistent-hash ring; searches go to
//! every backend and the answers are merged (or concatenated, when
//! configured).

mod forward;
mod server;

pub use forward::{
    BackendResponse, ForwardRequest, ProxyError, ProxySearchResults, SearchOutcome, ShardingProxy,
};
pub use server::{create_router, ProxyServer};
