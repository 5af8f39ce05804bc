//! Transient state of one user's build

use chrono::{DateTime, Utc};

/// Where the next page request starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageCursor {
    /// Messages newer than the index, walked down until `floor` is reached
    Newer { end_time: Option<i64>, floor: i64 },
    /// Messages older than everything fetched so far
    Older { end_time: Option<i64> },
}

impl PageCursor {
    pub fn end_time(&self) -> Option<i64> {
        match self {
            PageCursor::Newer { end_time, .. } | PageCursor::Older { end_time } => *end_time,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexingSession {
    pub user_id: String,
    pub total: usize,
    pub processed: usize,
    /// Newest indexed message time; never moves backwards
    pub last_indexed_time: Option<i64>,
    /// `None` until the first page of this session is requested
    pub cursor: Option<PageCursor>,
    pub refresh: bool,
    pub started_at: DateTime<Utc>,
    pub rate_limit_retries: u32,
    pub failed_messages: usize,
}

impl IndexingSession {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            total: 0,
            processed: 0,
            last_indexed_time: None,
            cursor: None,
            refresh: false,
            started_at: Utc::now(),
            rate_limit_retries: 0,
            failed_messages: 0,
        }
    }

    pub fn observe_indexed_time(&mut self, newest: Option<i64>) {
        if let Some(newest) = newest {
            self.last_indexed_time = Some(self.last_indexed_time.map_or(newest, |t| t.max(newest)));
        }
    }

    pub fn is_complete(&self) -> bool {
        self.processed >= self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_indexed_time_never_decreases() {
        let mut session = IndexingSession::new("user-1");
        session.observe_indexed_time(Some(50));
        session.observe_indexed_time(Some(20));
        session.observe_indexed_time(None);
        assert_eq!(session.last_indexed_time, Some(50));
        session.observe_indexed_time(Some(70));
        assert_eq!(session.last_indexed_time, Some(70));
    }
}
