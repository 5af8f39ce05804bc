//! Collaborators outside the search engine
//!
//! The engine never talks to the network, the PGP keyring or the host OS
//! directly. Everything it needs from them goes through the traits below.

pub mod memory;
pub mod types;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

pub use memory::{MemoryTransport, PageGate, PlaintextDecrypter};
pub use types::{DetailResponse, MessageDetail, MessageHeader, Recipient};

/// Remote mail API
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Messages of `label` with `time <= end_time`, newest first
    async fn fetch_message_page(
        &self,
        label: &str,
        end_time: Option<i64>,
        page_size: usize,
    ) -> Result<Vec<MessageHeader>>;

    async fn fetch_message_detail(&self, message_id: &str) -> Result<DetailResponse>;

    async fn fetch_total_count(&self, label: &str) -> Result<usize>;
}

/// Decrypts message bodies with the user's mail keys
pub trait MessageDecrypter: Send + Sync {
    fn decrypt_body(&self, user_id: &str, detail: &MessageDetail) -> Result<String>;
}

/// Host extended-execution support
#[async_trait]
pub trait BackgroundExecution: Send + Sync {
    /// Ask for a (new) execution window; `None` when the host refuses
    async fn request_window(&self) -> Option<Duration>;
}

/// Host without any background execution support
pub struct NoBackgroundExecution;

#[async_trait]
impl BackgroundExecution for NoBackgroundExecution {
    async fn request_window(&self) -> Option<Duration> {
        None
    }
}
