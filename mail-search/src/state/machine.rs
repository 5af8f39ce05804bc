use std::collections::VecDeque;
use tracing::{debug, info};

use super::types::{BuildAction, IndexingState, MessageMutation, PauseReasons, Transition};
use crate::error::{Result, SearchError};
use crate::indexing::BuildOutcome;

/// Indexing lifecycle of one user
///
/// Pure bookkeeping: it decides states and tells the caller whether the build
/// task has to be started or stopped, it never touches the task itself.
#[derive(Debug)]
pub struct IndexingStateMachine {
    state: IndexingState,
    reasons: PauseReasons,
    foreground: bool,
    background_window: bool,
    /// Active state to return to once the pause ends
    resume_to: IndexingState,
    pauses: u32,
    interruptions: u32,
    pending: VecDeque<MessageMutation>,
}

impl IndexingStateMachine {
    pub fn new(initial: IndexingState) -> Self {
        Self {
            state: initial,
            reasons: PauseReasons::default(),
            foreground: true,
            background_window: false,
            resume_to: IndexingState::Downloading,
            pauses: 0,
            interruptions: 0,
            pending: VecDeque::new(),
        }
    }

    pub fn state(&self) -> IndexingState {
        self.state
    }

    pub fn reasons(&self) -> PauseReasons {
        self.reasons
    }

    pub fn pauses(&self) -> u32 {
        self.pauses
    }

    pub fn interruptions(&self) -> u32 {
        self.interruptions
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground
    }

    fn go(&mut self, to: IndexingState, action: BuildAction) -> Transition {
        let from = self.state;
        if from != to {
            info!("Indexing state {} -> {}", from, to);
        }
        self.state = to;
        Transition { from, to, action }
    }

    fn stay(&self) -> Transition {
        Transition {
            from: self.state,
            to: self.state,
            action: BuildAction::None,
        }
    }

    fn paused_state(&self) -> IndexingState {
        if self.reasons.storage {
            IndexingState::LowStorage
        } else if !self.foreground {
            IndexingState::BackgroundStopped
        } else {
            IndexingState::Paused
        }
    }

    /// Where building continues, `None` when the host gives no time for it
    fn active_state(&self) -> Option<IndexingState> {
        if !self.foreground {
            self.background_window.then_some(IndexingState::Background)
        } else if self.resume_to == IndexingState::Refresh {
            Some(IndexingState::Refresh)
        } else {
            Some(IndexingState::Downloading)
        }
    }

    /// User turned encrypted search on
    pub fn enable(&mut self) -> Result<Transition> {
        if self.state != IndexingState::Disabled {
            return Err(SearchError::InvalidState(format!(
                "cannot enable from {}",
                self.state
            )));
        }
        Ok(self.start_build(false))
    }

    /// Begin building; `refresh` when the store already holds entries
    pub fn start_build(&mut self, refresh: bool) -> Transition {
        if self.state.is_building() {
            return self.stay();
        }

        self.resume_to = if refresh {
            IndexingState::Refresh
        } else {
            IndexingState::Downloading
        };

        if self.reasons.any() {
            self.pauses += 1;
            let to = self.paused_state();
            return self.go(to, BuildAction::None);
        }

        match self.active_state() {
            Some(to) => self.go(to, BuildAction::Start),
            None => self.go(IndexingState::BackgroundStopped, BuildAction::None),
        }
    }

    pub fn disable(&mut self) -> Transition {
        let action = if self.state.is_building() {
            BuildAction::Stop
        } else {
            BuildAction::None
        };
        self.pending.clear();
        self.reasons.user = false;
        self.go(IndexingState::Disabled, action)
    }

    /// Store or key failure: the index can no longer be trusted
    pub fn fail(&mut self) -> Transition {
        self.interruptions += 1;
        let action = if self.state.is_building() {
            BuildAction::Stop
        } else {
            BuildAction::None
        };
        self.go(IndexingState::Undetermined, action)
    }

    /// Apply the current set of pause reasons
    pub fn update_reasons(&mut self, reasons: PauseReasons) -> Transition {
        self.reasons = reasons;

        if self.state.is_building() && reasons.any() {
            self.pauses += 1;
            if self.state != IndexingState::Background {
                self.resume_to = self.state;
            }
            let to = self.paused_state();
            return self.go(to, BuildAction::Stop);
        }

        if self.state.is_paused() {
            if reasons.any() {
                let to = self.paused_state();
                return self.go(to, BuildAction::None);
            }
            return match self.active_state() {
                Some(to) => self.go(to, BuildAction::Start),
                None => self.go(IndexingState::BackgroundStopped, BuildAction::None),
            };
        }

        self.stay()
    }

    pub fn set_user_paused(&mut self, paused: bool) -> Transition {
        let reasons = PauseReasons {
            user: paused,
            ..self.reasons
        };
        self.update_reasons(reasons)
    }

    /// App left the foreground; `window` tells whether extended execution
    /// was granted
    pub fn enter_background(&mut self, window: bool) -> Transition {
        self.foreground = false;
        self.background_window = window;

        match self.state {
            IndexingState::Downloading | IndexingState::Refresh => {
                self.resume_to = self.state;
                if window {
                    self.go(IndexingState::Background, BuildAction::None)
                } else {
                    self.interruptions += 1;
                    self.go(IndexingState::BackgroundStopped, BuildAction::Stop)
                }
            }
            IndexingState::Paused => {
                let to = self.paused_state();
                self.go(to, BuildAction::None)
            }
            _ => self.stay(),
        }
    }

    /// The host withdrew the execution window
    pub fn window_expired(&mut self) -> Transition {
        self.background_window = false;
        if self.state == IndexingState::Background {
            self.interruptions += 1;
            return self.go(IndexingState::BackgroundStopped, BuildAction::Stop);
        }
        self.stay()
    }

    /// A follow-up execution window was granted
    pub fn window_granted(&mut self) -> Transition {
        if self.foreground {
            return self.stay();
        }
        self.background_window = true;
        if self.state == IndexingState::BackgroundStopped && !self.reasons.any() {
            return self.go(IndexingState::Background, BuildAction::Start);
        }
        self.stay()
    }

    pub fn enter_foreground(&mut self) -> Transition {
        self.foreground = true;
        self.background_window = false;

        match self.state {
            IndexingState::Background => {
                let to = self.active_state().unwrap_or(IndexingState::Downloading);
                self.go(to, BuildAction::None)
            }
            IndexingState::BackgroundStopped => {
                if self.reasons.any() {
                    let to = self.paused_state();
                    self.go(to, BuildAction::None)
                } else {
                    let to = self.active_state().unwrap_or(IndexingState::Downloading);
                    self.go(to, BuildAction::Start)
                }
            }
            _ => self.stay(),
        }
    }

    /// The build task returned
    pub fn finish_build(&mut self, outcome: BuildOutcome) -> Transition {
        if !self.state.is_building() {
            debug!("Ignoring build outcome {:?} in state {}", outcome, self.state);
            return self.stay();
        }

        match outcome {
            BuildOutcome::Complete => self.go(IndexingState::Complete, BuildAction::None),
            BuildOutcome::RemoteExhausted | BuildOutcome::Stalled | BuildOutcome::StorageLimit => {
                self.go(IndexingState::Partial, BuildAction::None)
            }
            BuildOutcome::Cancelled => self.stay(),
        }
    }

    /// Entries were evicted, the index no longer covers the whole mailbox
    pub fn mark_partial(&mut self) -> Transition {
        if self.state == IndexingState::Complete {
            return self.go(IndexingState::Partial, BuildAction::None);
        }
        self.stay()
    }

    /// Changes queue up while building, and behind changes already queued
    /// for a build that will resume
    pub fn should_buffer(&self) -> bool {
        self.state.buffers_mutations()
            || (!self.pending.is_empty() && (self.state.is_building() || self.state.is_paused()))
    }

    pub fn buffer(&mut self, mutation: MessageMutation) {
        debug!("Buffering mutation of {} while {}", mutation.message_id(), self.state);
        self.pending.push_back(mutation);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Enter replay of buffered mutations after completion
    pub fn begin_replay(&mut self) -> Transition {
        if self.state == IndexingState::Complete && !self.pending.is_empty() {
            return self.go(IndexingState::Refresh, BuildAction::None);
        }
        self.stay()
    }

    pub fn next_buffered(&mut self) -> Option<MessageMutation> {
        self.pending.pop_front()
    }

    pub fn end_replay(&mut self) -> Transition {
        if self.state == IndexingState::Refresh && self.pending.is_empty() {
            return self.go(IndexingState::Complete, BuildAction::None);
        }
        self.stay()
    }
}
