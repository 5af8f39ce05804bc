use thiserror::Error;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Search index unavailable: {0}")]
    StoreOpen(String),

    #[error("Search index write failed: {0}")]
    StoreWrite(String),

    #[error("Search index read failed: {0}")]
    StoreRead(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Search index key unavailable: {0}")]
    KeyProvisioning(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("No active user")]
    MissingUser,

    #[error("Invalid user id: {0:?}")]
    InvalidUser(String),

    #[error("Encrypted search is disabled for user {0}")]
    Disabled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SearchError {
    /// Store and key failures leave the index unusable for the user
    pub fn is_fatal_for_user(&self) -> bool {
        matches!(
            self,
            SearchError::StoreOpen(_) | SearchError::KeyProvisioning(_) | SearchError::Database(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SearchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(SearchError::StoreOpen("gone".to_string()).is_fatal_for_user());
        assert!(SearchError::KeyProvisioning("locked".to_string()).is_fatal_for_user());
        assert!(!SearchError::Decryption("bad tag".to_string()).is_fatal_for_user());
        assert!(!SearchError::RateLimited { retry_after: 3 }.is_fatal_for_user());
    }

    #[test]
    fn test_rate_limited_message() {
        let err = SearchError::RateLimited { retry_after: 12 };
        assert_eq!(err.to_string(), "Rate limited, retry after 12s");
    }
}
