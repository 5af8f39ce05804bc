//! Index record types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::remote::{MessageHeader, Recipient};

/// One indexed message as persisted in the user's store
#[derive(Debug, Clone, PartialEq)]
pub struct SearchIndexEntry {
    pub message_id: String,
    pub time: i64,
    pub order: i64,
    pub label_ids: Vec<String>,
    /// `None` when the starred state is unknown
    pub starred: Option<bool>,
    pub unread: bool,
    pub location: i64,
    pub has_body: bool,
    pub decryption_failed: bool,
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
    /// Side file holding the ciphertext when it was too large for the row
    pub ciphertext_file: Option<PathBuf>,
    pub ciphertext_size: usize,
}

impl SearchIndexEntry {
    pub fn new(
        header: &MessageHeader,
        has_body: bool,
        decryption_failed: bool,
        iv: Vec<u8>,
        ciphertext: Vec<u8>,
    ) -> Self {
        let mut label_ids = Vec::with_capacity(header.label_ids.len());
        for label in &header.label_ids {
            if !label_ids.contains(label) {
                label_ids.push(label.clone());
            }
        }

        Self {
            message_id: header.id.clone(),
            time: header.time,
            order: header.order,
            label_ids,
            starred: header.starred,
            unread: header.unread,
            location: header.location,
            has_body,
            decryption_failed,
            ciphertext_size: ciphertext.len(),
            iv,
            ciphertext,
            ciphertext_file: None,
        }
    }

    pub fn recency_key(&self) -> RecencyCursor {
        RecencyCursor {
            time: self.time,
            order: self.order,
            message_id: self.message_id.clone(),
        }
    }
}

/// Position in the (time desc, order desc, id desc) traversal of the index
///
/// Orders ascending field by field, so the newest entry is the greatest.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecencyCursor {
    pub time: i64,
    pub order: i64,
    pub message_id: String,
}

/// Plaintext sealed into each entry's ciphertext
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecryptedContent {
    pub subject: String,
    pub sender: Recipient,
    #[serde(default)]
    pub to_list: Vec<Recipient>,
    #[serde(default)]
    pub cc_list: Vec<Recipient>,
    #[serde(default)]
    pub bcc_list: Vec<Recipient>,
    /// Cleaned plaintext body, `None` for metadata-only records
    #[serde(default)]
    pub body: Option<String>,
    pub address_id: String,
    pub conversation_id: String,
    pub flags: i64,
    pub unread: bool,
    pub starred: Option<bool>,
    pub replied: bool,
    pub replied_all: bool,
    pub forwarded: bool,
    pub num_attachments: u32,
    pub expiration_time: i64,
}

impl DecryptedContent {
    /// Full record with recipients and the cleaned body
    pub fn with_body(header: &MessageHeader, body: String) -> Self {
        Self {
            to_list: header.to_list.clone(),
            cc_list: header.cc_list.clone(),
            bcc_list: header.bcc_list.clone(),
            body: Some(body),
            ..Self::metadata_only(header)
        }
    }

    /// Record for messages whose body could not be decrypted
    pub fn metadata_only(header: &MessageHeader) -> Self {
        Self {
            subject: header.subject.clone(),
            sender: header.sender.clone(),
            to_list: Vec::new(),
            cc_list: Vec::new(),
            bcc_list: Vec::new(),
            body: None,
            address_id: header.address_id.clone(),
            conversation_id: header.conversation_id.clone(),
            flags: header.flags,
            unread: header.unread,
            starred: header.starred,
            replied: header.replied,
            replied_all: header.replied_all,
            forwarded: header.forwarded,
            num_attachments: header.num_attachments,
            expiration_time: header.expiration_time,
        }
    }

    /// Lowercased text searched by keyword matching
    pub fn searchable_text(&self) -> String {
        let mut text = String::new();
        text.push_str(&self.subject);
        text.push('\n');
        for recipient in std::iter::once(&self.sender)
            .chain(&self.to_list)
            .chain(&self.cc_list)
            .chain(&self.bcc_list)
        {
            text.push_str(&recipient.name);
            text.push(' ');
            text.push_str(&recipient.address);
            text.push('\n');
        }
        if let Some(body) = &self.body {
            text.push_str(body);
        }
        text.to_lowercase()
    }
}
