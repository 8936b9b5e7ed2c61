//! Configuration types for the voice session engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable consulted when the config file carries no API key.
pub const API_KEY_ENV: &str = "LIVEVOICE_API_KEY";

/// Top-level configuration for a voice session.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// WebSocket endpoint of the conversational model.
    pub endpoint_url: String,
    /// API key for the endpoint. Never written back to disk.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Voice the model speaks with. Changing it mid-call triggers a hot-swap.
    pub voice_profile: String,
    /// Start a call automatically when the voice view becomes visible.
    pub auto_start_on_view_enter: bool,
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Reconnect behavior.
    pub retry: RetryConfig,
    /// Periodic screen frames sent as supplementary context.
    pub visual: VisualConfig,
    /// Per-turn processing settings.
    pub turn: TurnConfig,
    /// Handshake timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Consecutive malformed inbound events tolerated before reconnecting.
    pub protocol_error_threshold: u32,
    /// Captured frames held while the channel is being replaced.
    pub reconnect_buffer_frames: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint_url: "wss://localhost:8443/v1/live".to_owned(),
            api_key: None,
            voice_profile: "default".to_owned(),
            auto_start_on_view_enter: false,
            audio: AudioConfig::default(),
            retry: RetryConfig::default(),
            visual: VisualConfig::default(),
            turn: TurnConfig::default(),
            connect_timeout_ms: 10_000,
            protocol_error_threshold: 5,
            reconnect_buffer_frames: 64,
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("endpoint_url", &self.endpoint_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("voice_profile", &self.voice_profile)
            .field("auto_start_on_view_enter", &self.auto_start_on_view_enter)
            .field("audio", &self.audio)
            .field("retry", &self.retry)
            .field("visual", &self.visual)
            .field("turn", &self.turn)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("protocol_error_threshold", &self.protocol_error_threshold)
            .field("reconnect_buffer_frames", &self.reconnect_buffer_frames)
            .finish()
    }
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate of frames sent to the model, in Hz.
    pub sample_rate_in: u32,
    /// Sample rate of audio received from the model, in Hz.
    pub sample_rate_out: u32,
    /// Samples per outbound PCM frame.
    ///
    /// 2048 samples at 16kHz is 128ms: small enough for responsive
    /// barge-in, large enough to keep per-message overhead low.
    pub chunk_frame_count: usize,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate_in: 16_000,
            sample_rate_out: 24_000,
            chunk_frame_count: 2048,
            input_device: None,
            output_device: None,
        }
    }
}

/// Reconnect backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Connect attempts before giving up.
    pub max_retries: u32,
    /// Delay before the first retry; doubled for each further attempt.
    pub base_backoff_ms: u64,
    /// Upper bound for a single backoff delay.
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

/// Visual context streaming configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualConfig {
    /// Interval between captured frames.
    pub visual_stream_interval_ms: u64,
    /// Streaming disables itself after this long.
    pub visual_stream_max_duration_ms: u64,
    /// Edge length of the square frame sent to the model.
    pub frame_size: u32,
    /// JPEG quality (1-100).
    pub jpeg_quality: u8,
}

impl Default for VisualConfig {
    fn default() -> Self {
        Self {
            visual_stream_interval_ms: 1_000,
            visual_stream_max_duration_ms: 5 * 60 * 1_000,
            frame_size: 512,
            jpeg_quality: 70,
        }
    }
}

/// Turn processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Minimum spacing of live transcript updates pushed to the UI.
    pub transcript_flush_interval_ms: u64,
    /// Per-invocation tool timeout (None = wait indefinitely).
    pub tool_timeout_ms: Option<u64>,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            transcript_flush_interval_ms: 100,
            tool_timeout_ms: Some(30_000),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// The API key is read from [`API_KEY_ENV`] when the file does not set one.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&content)
            .map_err(|e| crate::error::SessionError::Config(e.to_string()))?;
        if config.api_key.is_none() {
            config.api_key = std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty());
        }
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::SessionError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/livevoice/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("livevoice").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("livevoice")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/livevoice-config/config.toml")
        }
    }

    /// Whether credentials for the endpoint are configured.
    pub fn has_credentials(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }

    /// Check value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Config`](crate::error::SessionError::Config)
    /// naming the first offending field.
    pub fn validate(&self) -> crate::error::Result<()> {
        let fail = |msg: String| Err(crate::error::SessionError::Config(msg));

        match url::Url::parse(&self.endpoint_url) {
            Ok(u) if matches!(u.scheme(), "ws" | "wss") => {}
            Ok(u) => return fail(format!("endpoint_url must use ws or wss, got {}", u.scheme())),
            Err(e) => return fail(format!("endpoint_url is not a valid URL: {e}")),
        }
        if self.audio.sample_rate_in == 0 || self.audio.sample_rate_out == 0 {
            return fail("sample rates must be non-zero".to_owned());
        }
        if self.audio.chunk_frame_count == 0 {
            return fail("chunk_frame_count must be non-zero".to_owned());
        }
        if self.retry.max_retries == 0 {
            return fail("max_retries must be at least 1".to_owned());
        }
        if self.visual.visual_stream_interval_ms == 0 {
            return fail("visual_stream_interval_ms must be non-zero".to_owned());
        }
        if self.visual.frame_size == 0 {
            return fail("visual frame_size must be non-zero".to_owned());
        }
        if self.voice_profile.trim().is_empty() {
            return fail("voice_profile must not be empty".to_owned());
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
