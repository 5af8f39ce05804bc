//! Indexing state types

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::remote::MessageDetail;

/// Lifecycle state of a user's index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IndexingState {
    Disabled,
    Undetermined,
    Partial,
    LowStorage,
    Downloading,
    Paused,
    Refresh,
    Background,
    BackgroundStopped,
    Complete,
}

impl IndexingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexingState::Disabled => "disabled",
            IndexingState::Undetermined => "undetermined",
            IndexingState::Partial => "partial",
            IndexingState::LowStorage => "lowStorage",
            IndexingState::Downloading => "downloading",
            IndexingState::Paused => "paused",
            IndexingState::Refresh => "refresh",
            IndexingState::Background => "background",
            IndexingState::BackgroundStopped => "backgroundStopped",
            IndexingState::Complete => "complete",
        }
    }

    /// A build task is expected to be running
    pub fn is_building(&self) -> bool {
        matches!(
            self,
            IndexingState::Downloading | IndexingState::Refresh | IndexingState::Background
        )
    }

    /// Building was interrupted and will resume
    pub fn is_paused(&self) -> bool {
        matches!(
            self,
            IndexingState::Paused | IndexingState::BackgroundStopped | IndexingState::LowStorage
        )
    }

    /// Mutations arriving in this state wait for the build to finish
    pub fn buffers_mutations(&self) -> bool {
        matches!(
            self,
            IndexingState::Downloading
                | IndexingState::Paused
                | IndexingState::Background
                | IndexingState::BackgroundStopped
        )
    }

    /// Progress and ETA are only reported while messages are downloaded
    pub fn reports_progress(&self) -> bool {
        matches!(
            self,
            IndexingState::Downloading | IndexingState::Background | IndexingState::Refresh
        )
    }
}

impl fmt::Display for IndexingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Independent reasons for holding the build
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseReasons {
    pub network: bool,
    /// Connection is metered while only Wi-Fi may be used
    pub wifi: bool,
    pub battery: bool,
    pub thermal: bool,
    pub storage: bool,
    pub user: bool,
}

impl PauseReasons {
    pub fn any(&self) -> bool {
        self.network || self.wifi || self.battery || self.thermal || self.storage || self.user
    }

    /// Message and remediation advice for the most relevant reason
    pub fn describe(&self) -> Option<(&'static str, &'static str)> {
        if self.user {
            Some(("Indexing paused", "Resume indexing to continue building the search index."))
        } else if self.network {
            Some((
                "Indexing paused: no internet connection",
                "Indexing will resume automatically once you are back online.",
            ))
        } else if self.wifi {
            Some((
                "Indexing paused: no Wi-Fi connection",
                "Connect to Wi-Fi or allow indexing over mobile data.",
            ))
        } else if self.storage {
            Some((
                "Indexing paused: device storage is low",
                "Free up space on this device to continue.",
            ))
        } else if self.battery {
            Some((
                "Indexing paused: low battery",
                "Charge your device or turn off low power mode.",
            ))
        } else if self.thermal {
            Some((
                "Indexing paused: device is overheating",
                "Indexing will resume once the device has cooled down.",
            ))
        } else {
            None
        }
    }
}

/// Change to a message already known to the mail app
#[derive(Debug, Clone)]
pub enum MessageMutation {
    Insert(MessageDetail),
    Update(MessageDetail),
    Move {
        message_id: String,
        label_ids: Vec<String>,
        location: i64,
    },
    Delete(String),
}

impl MessageMutation {
    pub fn message_id(&self) -> &str {
        match self {
            MessageMutation::Insert(detail) | MessageMutation::Update(detail) => detail.id(),
            MessageMutation::Move { message_id, .. } => message_id,
            MessageMutation::Delete(message_id) => message_id,
        }
    }
}

/// What the build task has to do after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildAction {
    None,
    Start,
    Stop,
}

/// Result of feeding an event to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: IndexingState,
    pub to: IndexingState,
    pub action: BuildAction,
}
