//! Fire-and-forget usage metrics

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexTelemetry {
    pub num_messages_indexed: usize,
    pub index_size: u64,
    /// Seconds spent building
    pub index_time: u64,
    /// First estimate of the build duration in seconds
    pub original_estimate: Option<u64>,
    pub num_pauses: u32,
    pub num_interruptions: u32,
    pub is_refreshed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchTelemetry {
    pub num_messages_indexed: usize,
    pub index_size: u64,
    pub cache_size: usize,
    pub is_first_search: bool,
    pub is_cache_limited: bool,
    /// Milliseconds until the first page was assembled
    pub search_time: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    Index(IndexTelemetry),
    Search(SearchTelemetry),
}

impl TelemetryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TelemetryEvent::Index(_) => "index",
            TelemetryEvent::Search(_) => "search",
        }
    }

    pub fn payload(&self) -> Result<serde_json::Value> {
        Ok(match self {
            TelemetryEvent::Index(data) => serde_json::to_value(data)?,
            TelemetryEvent::Search(data) => serde_json::to_value(data)?,
        })
    }
}

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn send(&self, event: &TelemetryEvent) -> Result<()>;
}

/// Writes events to the log
pub struct TracingTelemetry;

#[async_trait]
impl TelemetrySink for TracingTelemetry {
    async fn send(&self, event: &TelemetryEvent) -> Result<()> {
        info!("Telemetry {}: {}", event.name(), event.payload()?);
        Ok(())
    }
}

pub struct NoopTelemetry;

#[async_trait]
impl TelemetrySink for NoopTelemetry {
    async fn send(&self, _event: &TelemetryEvent) -> Result<()> {
        Ok(())
    }
}

/// Send `event` on a background task; failures are only logged
pub fn dispatch(sink: &Arc<dyn TelemetrySink>, event: TelemetryEvent) {
    let sink = Arc::clone(sink);
    tokio::spawn(async move {
        if let Err(e) = sink.send(&event).await {
            warn!("Failed to send {} telemetry: {}", event.name(), e);
        }
    });
}
