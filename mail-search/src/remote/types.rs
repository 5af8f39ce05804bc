//! Message shapes exchanged with the mail API

use serde::{Deserialize, Serialize};

/// Name and address of a message participant
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Recipient {
    pub name: String,
    pub address: String,
}

impl Recipient {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

/// Message metadata as listed by the mail API
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageHeader {
    pub id: String,
    /// Unix timestamp in seconds
    pub time: i64,
    pub order: i64,
    pub label_ids: Vec<String>,
    pub location: i64,
    pub subject: String,
    pub sender: Recipient,
    pub to_list: Vec<Recipient>,
    pub cc_list: Vec<Recipient>,
    pub bcc_list: Vec<Recipient>,
    pub address_id: String,
    pub conversation_id: String,
    pub flags: i64,
    pub unread: bool,
    /// `None` when the API did not report the starred label
    pub starred: Option<bool>,
    pub replied: bool,
    pub replied_all: bool,
    pub forwarded: bool,
    pub num_attachments: u32,
    pub expiration_time: i64,
    /// Full detail already present locally, no detail fetch needed
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

impl MessageHeader {
    pub fn is_details_downloaded(&self) -> bool {
        self.body.is_some()
    }
}

/// Message with its (still encrypted) body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageDetail {
    pub header: MessageHeader,
    /// Armored PGP body as delivered by the API
    pub body: String,
    pub mime_type: String,
}

impl MessageDetail {
    /// Build a detail from a header whose body was already downloaded
    pub fn from_downloaded(header: MessageHeader) -> Option<Self> {
        let body = header.body.clone()?;
        let mime_type = header
            .mime_type
            .clone()
            .unwrap_or_else(|| "text/html".to_string());
        Some(Self {
            header,
            body,
            mime_type,
        })
    }

    pub fn id(&self) -> &str {
        &self.header.id
    }
}

/// Outcome of a single message detail request
#[derive(Debug, Clone)]
pub enum DetailResponse {
    Detail(MessageDetail),
    /// HTTP 429 with the server's `retry-after` in seconds, if provided
    RateLimited { retry_after: Option<u64> },
}
