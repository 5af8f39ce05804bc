//! Indexing lifecycle

pub mod machine;
pub mod types;

pub use machine::IndexingStateMachine;
pub use types::{BuildAction, IndexingState, MessageMutation, PauseReasons, Transition};
