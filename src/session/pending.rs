//! Deferred stop/pause requests.
//!
//! A stop or pause requested while the model is mid-turn or still speaking
//! would cut it off mid-sentence. The coordinator parks such a request
//! until the lifecycle manager reports quiescence (turn ended and playback
//! silent). At most one action is held; a newer request replaces it.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// A user action waiting for the current turn to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    Stop,
    Pause { duration: Duration },
}

/// Kind of a [`PendingAction`], for status snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingActionKind {
    Stop,
    Pause,
}

impl PendingAction {
    pub fn kind(&self) -> PendingActionKind {
        match self {
            Self::Stop => PendingActionKind::Stop,
            Self::Pause { .. } => PendingActionKind::Pause,
        }
    }
}

/// Holds the single outstanding deferred action.
#[derive(Debug, Default)]
pub struct PendingActionCoordinator {
    pending: Option<PendingAction>,
}

impl PendingActionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. Returns the action when it should run right away.
    pub fn request_stop(&mut self, busy: bool) -> Option<PendingAction> {
        self.request(PendingAction::Stop, busy)
    }

    /// Request a pause. Returns the action when it should run right away.
    pub fn request_pause(&mut self, duration: Duration, busy: bool) -> Option<PendingAction> {
        self.request(PendingAction::Pause { duration }, busy)
    }

    fn request(&mut self, action: PendingAction, busy: bool) -> Option<PendingAction> {
        if !busy {
            self.pending = None;
            return Some(action);
        }
        if let Some(prev) = self.pending.replace(action) {
            debug!(?prev, ?action, "pending action replaced");
        } else {
            info!(?action, "action deferred until the turn ends");
        }
        None
    }

    /// The session just became quiescent; take the action to run, if any.
    pub fn on_quiescent(&mut self) -> Option<PendingAction> {
        self.pending.take()
    }

    pub fn is_stop_pending(&self) -> bool {
        matches!(self.pending, Some(PendingAction::Stop))
    }

    pub fn pending(&self) -> Option<PendingAction> {
        self.pending
    }

    pub fn clear(&mut self) {
        self.pending = None;
    }
}
