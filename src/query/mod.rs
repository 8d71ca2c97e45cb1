//! Search over the federation of live shards

mod search;

pub use search::{SearchFederation, SearchScope};
