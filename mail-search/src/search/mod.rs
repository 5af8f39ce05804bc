//! Keyword search over the cache and the encrypted index

pub mod executor;
pub mod query;
pub mod types;

pub use executor::SearchExecutor;
pub use query::SearchQuery;
pub use types::{HitSource, SearchEvent, SearchHit, SearchPage, SearchState};
