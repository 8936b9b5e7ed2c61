//! Error types for the voice session engine.
//!
//! Each failure class has its own enum so the recovery policy can match on
//! it: permission and exhausted-connect failures end the session, while
//! decode, tool and protocol failures are recovered locally.

use std::time::Duration;

/// The capture device could not be acquired.
///
/// Terminal until the user performs a new explicit start.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PermissionError {
    /// The platform refused access to the microphone.
    #[error("microphone access denied: {0}")]
    Denied(String),

    /// No usable input device exists.
    #[error("no microphone available: {0}")]
    Unavailable(String),
}

/// Opening or keeping the duplex channel failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// The handshake with the remote endpoint failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The handshake did not complete in time.
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    /// The channel closed without a user-initiated stop.
    #[error("channel closed unexpectedly: {0}")]
    Closed(String),

    /// The remote endpoint reported a fatal error.
    #[error("remote error: {0}")]
    Remote(String),

    /// Too many malformed inbound events in a row.
    #[error("protocol failure: {0}")]
    Protocol(String),
}

/// A single inbound audio buffer could not be decoded; it is skipped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid base64 audio payload: {0}")]
    Base64(String),

    #[error("PCM16 payload has odd byte length {0}")]
    OddLength(usize),

    #[error("audio payload is empty")]
    Empty,
}

/// A tool invocation failed; converted into an error-kind tool result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolExecutionError {
    #[error("tool '{0}' is not registered")]
    NotFound(String),

    #[error("tool '{name}' failed: {message}")]
    Failed { name: String, message: String },

    #[error("tool '{name}' timed out after {timeout_ms}ms")]
    Timeout { name: String, timeout_ms: u64 },

    #[error("tool '{0}' panicked during execution")]
    Panicked(String),
}

/// A malformed inbound event; logged and dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The payload is not a recognized event.
    #[error("malformed inbound event: {0}")]
    Malformed(String),

    /// The payload parsed but violates a field constraint.
    #[error("invalid inbound event: {0}")]
    Invalid(String),

    /// A frame type the protocol does not use.
    #[error("unexpected {0} frame")]
    UnexpectedFrame(&'static str),
}

/// Why `start()` did not produce a live session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartError {
    #[error("a voice session is already active")]
    AlreadyActive,

    #[error("a stop is pending; wait for it to complete before starting again")]
    StopPending,

    #[error("no API credentials configured")]
    MissingCredentials,

    #[error(transparent)]
    PermissionDenied(#[from] PermissionError),

    #[error("could not connect after {attempts} attempt(s): {source}")]
    ConnectFailed {
        attempts: u32,
        #[source]
        source: ConnectError,
    },

    /// The session was stopped before the connection completed.
    #[error("start aborted by stop")]
    Aborted,

    /// The session engine task is no longer running.
    #[error("voice session engine is not running")]
    EngineGone,
}

/// Top-level error type for the voice session engine.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Tool(#[from] ToolExecutionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Start(#[from] StartError),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Audio device or stream error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Screen/camera frame could not be grabbed or encoded.
    #[error("frame capture failed: {0}")]
    Capture(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Whether this error ends the session rather than being recovered locally.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Permission(_) | Self::Config(_) | Self::Audio(_) | Self::Io(_) => true,
            Self::Start(e) => !matches!(e, StartError::AlreadyActive),
            Self::Connect(_) => true,
            Self::Decode(_) | Self::Tool(_) | Self::Protocol(_) | Self::Capture(_) => false,
        }
    }

    /// An actionable message suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            Self::Permission(PermissionError::Denied(_))
            | Self::Start(StartError::PermissionDenied(PermissionError::Denied(_))) => {
                "Microphone access was denied. Allow microphone access and press start again."
                    .to_owned()
            }
            Self::Permission(PermissionError::Unavailable(_))
            | Self::Start(StartError::PermissionDenied(PermissionError::Unavailable(_))) => {
                "No microphone was found. Connect one and press start again.".to_owned()
            }
            Self::Start(StartError::ConnectFailed { attempts, .. }) => format!(
                "Could not reach the voice service after {attempts} attempts. \
                 Check your network connection and press start to retry."
            ),
            Self::Connect(_) => "The voice connection was lost and could not be restored. \
                                 Press start to reconnect."
                .to_owned(),
            Self::Start(StartError::MissingCredentials) => {
                "No API key is configured. Add one in settings before starting a call.".to_owned()
            }
            other => other.to_string(),
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SessionError>;
