//! In-process mail API backed by a message list
//!
//! Serves exported mailboxes to the CLI and doubles as the transport used by
//! the integration tests, which is why it can inject rate limiting, failing
//! detail requests and hold a page request until the test releases it.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, RwLock};
use tracing::debug;

use super::types::{DetailResponse, MessageDetail, MessageHeader};
use super::{MailTransport, MessageDecrypter};
use crate::error::{Result, SearchError};

/// Handle on a held page request
///
/// `reached` fires once the request arrives, the request then waits for
/// `release`. A request dropped while held is never recorded.
#[derive(Clone, Default)]
pub struct PageGate {
    pub reached: Arc<Notify>,
    pub release: Arc<Notify>,
}

pub struct MemoryTransport {
    messages: RwLock<Vec<MessageDetail>>,
    bodies_downloaded: bool,
    page_requests: Mutex<Vec<Option<i64>>>,
    rate_limited: Mutex<HashMap<String, (u32, Option<u64>)>>,
    failing: Mutex<HashSet<String>>,
    detail_fetches: AtomicUsize,
    page_calls: AtomicUsize,
    gates: Mutex<HashMap<usize, PageGate>>,
}

impl MemoryTransport {
    pub fn new(messages: Vec<MessageDetail>) -> Self {
        Self {
            messages: RwLock::new(messages),
            bodies_downloaded: false,
            page_requests: Mutex::new(Vec::new()),
            rate_limited: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            detail_fetches: AtomicUsize::new(0),
            page_calls: AtomicUsize::new(0),
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Load a JSON array of messages exported from a mailbox
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let messages: Vec<MessageDetail> = serde_json::from_str(&content)?;
        Ok(Self::new(messages).with_downloaded_bodies(true))
    }

    /// Listed headers carry their bodies, so no detail request is needed
    pub fn with_downloaded_bodies(mut self, downloaded: bool) -> Self {
        self.bodies_downloaded = downloaded;
        self
    }

    pub async fn push(&self, message: MessageDetail) {
        self.messages.write().await.push(message);
    }

    pub async fn remove(&self, message_id: &str) {
        self.messages.write().await.retain(|m| m.id() != message_id);
    }

    /// Answer the next `times` detail requests for `message_id` with HTTP 429
    pub fn rate_limit(&self, message_id: &str, times: u32, retry_after: Option<u64>) {
        if let Ok(mut limits) = self.rate_limited.lock() {
            limits.insert(message_id.to_string(), (times, retry_after));
        }
    }

    /// Make every detail request for `message_id` fail
    pub fn fail_detail(&self, message_id: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(message_id.to_string());
        }
    }

    /// Hold the `call`-th page request (1-based) until released
    pub fn hold_page(&self, call: usize) -> PageGate {
        let gate = PageGate::default();
        if let Ok(mut gates) = self.gates.lock() {
            gates.insert(call, gate.clone());
        }
        gate
    }

    /// `end_time` arguments of every page request so far
    pub fn page_requests(&self) -> Vec<Option<i64>> {
        self.page_requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    pub fn detail_fetches(&self) -> usize {
        self.detail_fetches.load(Ordering::SeqCst)
    }

    fn in_label(header: &MessageHeader, label: &str) -> bool {
        header.label_ids.is_empty() || header.label_ids.iter().any(|l| l == label)
    }
}

#[async_trait]
impl MailTransport for MemoryTransport {
    async fn fetch_message_page(
        &self,
        label: &str,
        end_time: Option<i64>,
        page_size: usize,
    ) -> Result<Vec<MessageHeader>> {
        let call = self.page_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let gate = self.gates.lock().ok().and_then(|mut gates| gates.remove(&call));
        if let Some(gate) = gate {
            gate.reached.notify_one();
            gate.release.notified().await;
        }

        let page_number = {
            let mut requests = self
                .page_requests
                .lock()
                .map_err(|_| SearchError::Transport("request log poisoned".to_string()))?;
            requests.push(end_time);
            requests.len()
        };

        let mut headers: Vec<MessageHeader> = self
            .messages
            .read()
            .await
            .iter()
            .filter(|m| Self::in_label(&m.header, label))
            .filter(|m| end_time.map_or(true, |end| m.header.time <= end))
            .map(|m| {
                let mut header = m.header.clone();
                if self.bodies_downloaded {
                    header.body = Some(m.body.clone());
                    header.mime_type = Some(m.mime_type.clone());
                } else {
                    header.body = None;
                }
                header
            })
            .collect();

        headers.sort_by(|a, b| {
            b.time
                .cmp(&a.time)
                .then(b.order.cmp(&a.order))
                .then(b.id.cmp(&a.id))
        });
        headers.truncate(page_size);

        debug!(
            "Serving page {} ({} messages, end={:?})",
            page_number,
            headers.len(),
            end_time
        );

        Ok(headers)
    }

    async fn fetch_message_detail(&self, message_id: &str) -> Result<DetailResponse> {
        self.detail_fetches.fetch_add(1, Ordering::SeqCst);

        if let Ok(mut limits) = self.rate_limited.lock() {
            if let Some((remaining, retry_after)) = limits.get_mut(message_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Ok(DetailResponse::RateLimited {
                        retry_after: *retry_after,
                    });
                }
            }
        }

        let failing = self
            .failing
            .lock()
            .map(|failing| failing.contains(message_id))
            .unwrap_or(false);
        if failing {
            return Err(SearchError::Transport(format!(
                "detail request for {} failed",
                message_id
            )));
        }

        self.messages
            .read()
            .await
            .iter()
            .find(|m| m.id() == message_id)
            .cloned()
            .map(DetailResponse::Detail)
            .ok_or_else(|| SearchError::Transport(format!("message {} not found", message_id)))
    }

    async fn fetch_total_count(&self, label: &str) -> Result<usize> {
        Ok(self
            .messages
            .read()
            .await
            .iter()
            .filter(|m| Self::in_label(&m.header, label))
            .count())
    }
}

/// Decrypter for bodies that are already plaintext, such as decrypted exports
pub struct PlaintextDecrypter;

impl MessageDecrypter for PlaintextDecrypter {
    fn decrypt_body(&self, _user_id: &str, detail: &MessageDetail) -> Result<String> {
        Ok(detail.body.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, time: i64) -> MessageDetail {
        MessageDetail {
            header: MessageHeader {
                id: id.to_string(),
                time,
                subject: format!("subject {}", id),
                ..Default::default()
            },
            body: format!("<p>body {}</p>", id),
            mime_type: "text/html".to_string(),
        }
    }

    #[tokio::test]
    async fn test_pages_are_newest_first_and_bounded() {
        let transport = MemoryTransport::new((1..=5).map(|i| message(&format!("m{}", i), i)).collect());

        let page = transport.fetch_message_page("5", None, 2).await.unwrap();
        let ids: Vec<_> = page.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["m5", "m4"]);
        assert!(page.iter().all(|h| !h.is_details_downloaded()));

        let page = transport.fetch_message_page("5", Some(3), 10).await.unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(transport.page_requests(), vec![None, Some(3)]);
    }

    #[tokio::test]
    async fn test_rate_limit_then_detail() {
        let transport = MemoryTransport::new(vec![message("m1", 1)]);
        transport.rate_limit("m1", 1, Some(0));

        assert!(matches!(
            transport.fetch_message_detail("m1").await.unwrap(),
            DetailResponse::RateLimited { retry_after: Some(0) }
        ));
        assert!(matches!(
            transport.fetch_message_detail("m1").await.unwrap(),
            DetailResponse::Detail(_)
        ));
        assert_eq!(transport.detail_fetches(), 2);
    }

    #[tokio::test]
    async fn test_label_filter() {
        let mut other = message("m2", 2);
        other.header.label_ids = vec!["3".to_string()];
        let transport = MemoryTransport::new(vec![message("m1", 1), other]);

        assert_eq!(transport.fetch_total_count("5").await.unwrap(), 1);
        assert_eq!(transport.fetch_total_count("3").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_held_page_waits_for_release() {
        let transport = Arc::new(MemoryTransport::new(vec![message("m1", 1)]));
        let gate = transport.hold_page(1);

        let task = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.fetch_message_page("5", None, 10).await })
        };
        gate.reached.notified().await;
        assert!(transport.page_requests().is_empty());

        gate.release.notify_one();
        let page = task.await.unwrap().unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(transport.page_requests(), vec![None]);
    }
}
