//! Per-user orchestration of indexing and search

pub mod context;
pub mod service;
pub mod status;

pub use context::UserContext;
pub use service::{Collaborators, EncryptedSearch, MutationOutcome};
pub use status::IndexStatus;
