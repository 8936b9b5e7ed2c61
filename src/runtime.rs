//! Runtime events and status snapshots for UI and observability.
//!
//! Events are lightweight (no audio payloads) so the session actor can
//! broadcast them without blocking. A lagging subscriber only loses events;
//! it never slows the session down.

use crate::session::pending::PendingActionKind;
use serde::{Deserialize, Serialize};

/// Coarse connection state of the voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No call. The microphone may still be held if a stop is in flight.
    #[default]
    Idle,
    /// First connect of a manual start, including its retries.
    Connecting,
    Live,
    /// The channel dropped; waiting out backoff or reconnecting.
    Reconnecting,
    /// Channel retired by `pause`; reconnects when the pause elapses.
    Paused,
    /// Replacing the channel after a voice profile change.
    HotSwapping,
}

impl SessionState {
    /// Whether a call is active (anything but `Idle`).
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Idle)
    }
}

/// Point-in-time view of the session, published through a watch channel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub muted: bool,
    pub turn_in_progress: bool,
    /// Model audio is scheduled or playing.
    pub speaking: bool,
    pub pending_action: Option<PendingActionKind>,
    pub video_enabled: bool,
    pub voice_profile: String,
    /// Id of the live channel, if any.
    pub connection_id: Option<String>,
}

/// Events that describe what the session is doing "right now".
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    StateChanged(SessionState),
    MuteChanged { muted: bool },
    /// A new turn began; UIs can create a placeholder for it.
    TurnStarted { turn_id: u64 },
    /// Throttled live transcript of the turn so far.
    TranscriptUpdate {
        turn_id: u64,
        input: String,
        output: String,
    },
    /// The turn was written to conversation history.
    TurnCommitted {
        turn_id: u64,
        input: String,
        output: String,
        interrupted: bool,
    },
    ToolCall {
        id: String,
        name: String,
        input_json: String,
    },
    ToolResult {
        id: String,
        name: String,
        success: bool,
        /// Best-effort textual output for display (may be truncated).
        output_text: Option<String>,
    },
    /// Model audio started or stopped.
    AssistantSpeaking { active: bool },
    VideoFrameCaptured { bytes: usize },
    VideoStreaming { enabled: bool },
    /// A failure worth surfacing; transient ones are only logged.
    Error { message: String },
}
