//! mail-search: client-side encrypted search over a mailbox
//!
//! Messages are downloaded page by page, their bodies decrypted, reduced to
//! plain text and re-encrypted into a per-user SQLite index. Searches run
//! over an in-memory cache of decrypted records first and fall back to
//! decrypting the index in recency order.
//!
//! # Example
//!
//! ```no_run
//! use mail_search::config::SearchConfig;
//! use mail_search::crypto::MemoryKeyStorage;
//! use mail_search::engine::{Collaborators, EncryptedSearch};
//! use mail_search::remote::{MemoryTransport, PlaintextDecrypter};
//! use mail_search::search::SearchState;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(MemoryTransport::from_json_file("mailbox.json")?);
//!     let search = EncryptedSearch::new(
//!         SearchConfig::default(),
//!         Collaborators::new(
//!             transport,
//!             Arc::new(PlaintextDecrypter),
//!             Arc::new(MemoryKeyStorage::new()),
//!         ),
//!     )?;
//!
//!     search.open_user("alice").await?;
//!     search.enable().await?;
//!     search.wait_for_build().await;
//!
//!     let mut state = SearchState::new("alice", "invoice");
//!     let page = search.search(&mut state, None).await?;
//!     println!("{} hits", page.hits.len());
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`engine`]: the service tying everything together
//! - [`indexing`]: paged index build
//! - [`index`]: encrypted SQLite store
//! - [`cache`]: in-memory search cache
//! - [`search`]: query parsing and execution
//! - [`state`]: indexing lifecycle
//! - [`crypto`]: index encryption keys

pub mod cache;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod index;
pub mod indexing;
pub mod remote;
pub mod resources;
pub mod search;
pub mod state;
pub mod telemetry;

// Re-export commonly used types
pub use config::SearchConfig;
pub use engine::{Collaborators, EncryptedSearch, IndexStatus};
pub use error::{Result, SearchError};
