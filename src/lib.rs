//! livevoice: real-time voice session engine for conversational AI.
//!
//! The engine holds a duplex channel open to a conversational model,
//! streams microphone audio out, schedules model audio back in gaplessly,
//! runs tool calls alongside spoken turns, and survives reconnects,
//! muting, barge-in and mid-call voice changes.
//!
//! # Architecture
//!
//! One actor task owns all session state and reacts to messages:
//! - **Audio capture**: microphone via `cpal`, framed into fixed PCM16 chunks
//! - **Channel**: JSON envelopes over a WebSocket (or any connector)
//! - **Turn processing**: transcripts, tool calls and history commits
//! - **Audio playback**: gapless scheduling against the output clock
//! - **Control**: [`VoiceControl`], the synchronous public façade

pub mod audio;
pub mod channel;
pub mod config;
pub mod control;
pub mod error;
pub mod runtime;
pub mod session;
pub mod tools;

pub use config::SessionConfig;
pub use control::{ErrorCallback, SessionBuilder, VoiceControl};
pub use error::{Result, SessionError, StartError};
pub use runtime::{RuntimeEvent, SessionState, SessionStatus};
