use serde::Serialize;

use crate::state::IndexingState;

/// Snapshot of the indexing status shown to the user
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStatus {
    pub user_id: Option<String>,
    pub state: IndexingState,
    pub processed: usize,
    pub total: usize,
    /// Percentage, only while messages are downloaded
    pub progress: Option<u8>,
    pub eta: Option<String>,
    pub pause_reason: Option<String>,
    pub pause_advice: Option<String>,
    pub index_size: u64,
    pub entries: usize,
    pub last_error: Option<String>,
}

impl IndexStatus {
    /// Status before any user is opened
    pub fn idle() -> Self {
        Self {
            user_id: None,
            state: IndexingState::Disabled,
            processed: 0,
            total: 0,
            progress: None,
            eta: None,
            pause_reason: None,
            pause_advice: None,
            index_size: 0,
            entries: 0,
            last_error: None,
        }
    }
}

impl std::fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}/{} indexed", self.state, self.processed, self.total)?;
        if let Some(progress) = self.progress {
            write!(f, " ({}%)", progress)?;
        }
        if let Some(eta) = &self.eta {
            write!(f, ", {}", eta)?;
        }
        if let Some(reason) = &self.pause_reason {
            write!(f, ", {}", reason)?;
        }
        Ok(())
    }
}
