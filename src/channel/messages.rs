//! Tagged message types exchanged with the remote conversation channel.
//!
//! Inbound payloads are validated here, at the boundary; nothing past this
//! module sees loosely-typed JSON except tool arguments and results.

use crate::audio::capture::AudioFrame;
use crate::audio::pcm::encode_pcm16_base64;
use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};

/// A single tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// Outcome of a tool invocation as reported to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    Result(serde_json::Value),
    Error(String),
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Result(_))
    }
}

/// Events emitted by the remote channel.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    /// Incremental transcript of what the user said.
    PartialInputTranscript { text: String },
    /// Incremental transcript of what the model is saying.
    PartialOutputTranscript { text: String },
    /// Base64 PCM16 model audio.
    AudioChunk {
        data: String,
        #[serde(default)]
        sample_rate: Option<u32>,
    },
    /// One or more tool invocations; each needs exactly one result.
    ToolCallRequest { calls: Vec<ToolCall> },
    TurnComplete,
    /// The model detected the user talking over it.
    Interrupted,
    FatalError { message: String },
}

impl InboundEvent {
    /// Parse and validate a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] for unknown tags, malformed JSON, or
    /// field constraint violations.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let event: Self =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Self::AudioChunk { data, sample_rate } => {
                if data.is_empty() {
                    return Err(ProtocolError::Invalid("audio_chunk with empty data".into()));
                }
                if *sample_rate == Some(0) {
                    return Err(ProtocolError::Invalid("audio_chunk with zero sample_rate".into()));
                }
            }
            Self::ToolCallRequest { calls } => {
                if calls.is_empty() {
                    return Err(ProtocolError::Invalid("tool_call_request with no calls".into()));
                }
                for call in calls {
                    if call.id.trim().is_empty() || call.name.trim().is_empty() {
                        return Err(ProtocolError::Invalid(format!(
                            "tool call missing id or name: {call:?}"
                        )));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PartialInputTranscript { .. } => "partial_input_transcript",
            Self::PartialOutputTranscript { .. } => "partial_output_transcript",
            Self::AudioChunk { .. } => "audio_chunk",
            Self::ToolCallRequest { .. } => "tool_call_request",
            Self::TurnComplete => "turn_complete",
            Self::Interrupted => "interrupted",
            Self::FatalError { .. } => "fatal_error",
        }
    }
}

/// Messages sent to the remote channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// First message on every connection.
    Setup {
        voice_profile: String,
        sample_rate_in: u32,
        sample_rate_out: u32,
    },
    /// Base64 PCM16 microphone audio.
    AudioFrame {
        pcm: String,
        sample_rate: u32,
        sequence: u64,
    },
    /// Supplementary still image.
    VideoFrame { mime_type: String, data: String },
    ToolResult {
        id: String,
        #[serde(flatten)]
        outcome: ToolOutcome,
    },
}

impl OutboundMessage {
    pub fn audio(frame: &AudioFrame) -> Self {
        Self::AudioFrame {
            pcm: encode_pcm16_base64(&frame.pcm),
            sample_rate: frame.sample_rate,
            sequence: frame.sequence,
        }
    }
}
