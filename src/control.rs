//! Public control surface for the voice session.
//!
//! [`VoiceControl`] is the only handle the rest of an application needs.
//! Every method is synchronous: it validates cheap preconditions, queues a
//! [`ControlCommand`] for the session actor and returns. Outcomes are
//! observed through [`VoiceControl::status`], the runtime event stream, or
//! the error callback for failures the user must act on.
//!
//! [`VoiceControl::interrupt`] is the exception to "queue and return": it
//! flushes playback in place before notifying the actor, so barge-in takes
//! effect even while the actor is busy.
//!
//! ```rust,no_run
//! # async fn demo(
//! #     connector: std::sync::Arc<dyn livevoice::channel::ConversationConnector>,
//! #     mic: Box<dyn livevoice::audio::capture::CaptureDevice>,
//! #     speaker: Box<dyn livevoice::audio::playback::AudioOutput>,
//! #     clock: std::sync::Arc<dyn livevoice::audio::playback::PlaybackClock>,
//! # ) -> livevoice::Result<()> {
//! use livevoice::{SessionBuilder, SessionConfig};
//!
//! let (voice, engine) = SessionBuilder::new(SessionConfig::default())
//!     .connector(connector)
//!     .capture_device(mic)
//!     .audio_output(speaker, clock)
//!     .spawn()?;
//!
//! voice.start();
//! voice.toggle_mute();
//! voice.stop(false);
//! voice.shutdown();
//! let _ = engine.await;
//! # Ok(())
//! # }
//! ```

use crate::audio::capture::{CaptureDevice, CapturePipeline};
use crate::audio::playback::{AudioOutput, PlaybackClock, PlaybackScheduler};
use crate::channel::ConversationConnector;
use crate::config::{API_KEY_ENV, SessionConfig};
use crate::error::{SessionError, StartError};
use crate::runtime::{RuntimeEvent, SessionStatus};
use crate::session::lifecycle::{ControlCommand, EngineParts, SessionLifecycleManager};
use crate::session::pending::PendingActionKind;
use crate::session::turn::{ConversationHistory, SharedHistory};
use crate::session::visual::{FrameCapture, LastFrame, VisualContextStreamer};
use crate::tools::{EmptyToolRegistry, ToolRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Receives failures the user has to act on (permission, config,
/// exhausted retries).
pub type ErrorCallback = Arc<dyn Fn(&SessionError) + Send + Sync>;

/// Capacity of the runtime event broadcast.
const EVENT_CAPACITY: usize = 256;

/// Cloneable handle to a running voice session engine.
#[derive(Clone)]
pub struct VoiceControl {
    commands: mpsc::UnboundedSender<ControlCommand>,
    playback: PlaybackScheduler,
    status: watch::Receiver<SessionStatus>,
    events: broadcast::Sender<RuntimeEvent>,
    frames: watch::Receiver<LastFrame>,
    has_credentials: bool,
    auto_start: bool,
    on_error: Option<ErrorCallback>,
}

impl VoiceControl {
    /// Begin a call. Returns `false` if the request was rejected up front
    /// (no credentials, already active, stop pending, engine gone).
    pub fn start(&self) -> bool {
        if !self.precheck_start() {
            return false;
        }
        self.send(ControlCommand::Start { reply: None })
    }

    /// Begin a call and wait until it is live or has failed.
    ///
    /// # Errors
    ///
    /// Returns the [`StartError`] that prevented the session from going live.
    pub async fn start_and_wait(&self) -> Result<(), StartError> {
        if !self.has_credentials {
            self.report_missing_credentials();
            return Err(StartError::MissingCredentials);
        }
        let (tx, rx) = oneshot::channel();
        if !self.send(ControlCommand::Start { reply: Some(tx) }) {
            return Err(StartError::EngineGone);
        }
        rx.await.map_err(|_| StartError::EngineGone)?
    }

    /// End the call. Unless `immediate`, waits for the current turn to
    /// finish speaking.
    pub fn stop(&self, immediate: bool) {
        self.send(ControlCommand::Stop { immediate });
    }

    pub fn toggle_mute(&self) {
        self.send(ControlCommand::ToggleMute);
    }

    pub fn set_muted(&self, muted: bool) {
        self.send(ControlCommand::SetMuted(muted));
    }

    /// Suspend the call for `seconds`, then reconnect.
    pub fn pause(&self, seconds: u64) {
        self.pause_for(Duration::from_secs(seconds));
    }

    pub fn pause_for(&self, duration: Duration) {
        self.send(ControlCommand::Pause { duration });
    }

    /// Cut model audio off now. Returns the number of flushed buffers.
    pub fn interrupt(&self) -> usize {
        let flushed = self.playback.interrupt();
        self.send(ControlCommand::Interrupt { flushed });
        flushed
    }

    pub fn enable_video(&self) {
        if !self.status.borrow().state.is_active() {
            warn!("enable_video ignored: no active session");
            return;
        }
        self.send(ControlCommand::EnableVideo);
    }

    pub fn disable_video(&self) {
        self.send(ControlCommand::DisableVideo);
    }

    /// Change the voice; a live call is hot-swapped once it is quiet.
    pub fn set_voice_profile(&self, profile: impl Into<String>) {
        self.send(ControlCommand::SetVoiceProfile(profile.into()));
    }

    /// Hook for the hosting view becoming visible; starts a call when
    /// `auto_start_on_view_enter` is set.
    pub fn on_view_enter(&self) -> bool {
        if !self.auto_start || self.status.borrow().state.is_active() {
            return false;
        }
        self.start()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn is_active(&self) -> bool {
        self.status.borrow().state.is_active()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    /// The last frame sent by the visual streamer, if streaming.
    pub fn last_video_frame(&self) -> LastFrame {
        self.frames.borrow().clone()
    }

    /// Stop everything and end the engine task.
    pub fn shutdown(&self) {
        self.send(ControlCommand::Shutdown);
    }

    fn precheck_start(&self) -> bool {
        if !self.has_credentials {
            self.report_missing_credentials();
            return false;
        }
        let status = self.status.borrow();
        if status.pending_action == Some(PendingActionKind::Stop) {
            debug!("start rejected: a stop is pending");
            return false;
        }
        if status.state.is_active() {
            debug!("start ignored: session already active");
            return false;
        }
        true
    }

    fn report_missing_credentials(&self) {
        let err = SessionError::Config(format!(
            "no API key configured; set {API_KEY_ENV} or api_key in the config file"
        ));
        warn!(error = %err, "start rejected");
        if let Some(callback) = &self.on_error {
            callback(&err);
        }
    }

    fn send(&self, cmd: ControlCommand) -> bool {
        if self.commands.send(cmd).is_err() {
            warn!("voice session engine is not running");
            return false;
        }
        true
    }
}

impl std::fmt::Debug for VoiceControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceControl")
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

/// Wires collaborators into a [`VoiceControl`] and its engine.
pub struct SessionBuilder {
    config: SessionConfig,
    connector: Option<Arc<dyn ConversationConnector>>,
    capture: Option<Box<dyn CaptureDevice>>,
    output: Option<(Box<dyn AudioOutput>, Arc<dyn PlaybackClock>)>,
    tools: Arc<dyn ToolRegistry>,
    frame_capture: Option<Arc<dyn FrameCapture>>,
    history: Option<Box<dyn ConversationHistory>>,
    on_error: Option<ErrorCallback>,
}

impl SessionBuilder {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            connector: None,
            capture: None,
            output: None,
            tools: Arc::new(EmptyToolRegistry),
            frame_capture: None,
            history: None,
            on_error: None,
        }
    }

    pub fn connector(mut self, connector: Arc<dyn ConversationConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn capture_device(mut self, device: Box<dyn CaptureDevice>) -> Self {
        self.capture = Some(device);
        self
    }

    pub fn audio_output(
        mut self,
        output: Box<dyn AudioOutput>,
        clock: Arc<dyn PlaybackClock>,
    ) -> Self {
        self.output = Some((output, clock));
        self
    }

    pub fn tools(mut self, tools: Arc<dyn ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn frame_capture(mut self, capture: Arc<dyn FrameCapture>) -> Self {
        self.frame_capture = Some(capture);
        self
    }

    /// Where committed turns go. Defaults to an in-memory [`SharedHistory`].
    pub fn history(mut self, history: Box<dyn ConversationHistory>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&SessionError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Assemble the control handle and the engine without starting it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Config`] if the configuration is invalid or a
    /// required collaborator is missing.
    pub fn build(self) -> Result<(VoiceControl, SessionLifecycleManager), SessionError> {
        self.config.validate()?;
        let connector = self
            .connector
            .ok_or_else(|| SessionError::Config("no conversation connector configured".into()))?;
        let device = self
            .capture
            .ok_or_else(|| SessionError::Config("no capture device configured".into()))?;
        let (output, clock) = self
            .output
            .ok_or_else(|| SessionError::Config("no audio output configured".into()))?;

        let config = self.config;
        let capture = CapturePipeline::new(device, &config.audio);
        let (playback, playback_events) =
            PlaybackScheduler::new(output, clock, config.audio.sample_rate_out);
        let (visual, visual_results) =
            VisualContextStreamer::new(self.frame_capture, config.visual.clone());
        let frames = visual.subscribe_frames();

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (status_tx, status_rx) = watch::channel(SessionStatus {
            voice_profile: config.voice_profile.clone(),
            ..SessionStatus::default()
        });

        let control = VoiceControl {
            commands: commands_tx,
            playback: playback.clone(),
            status: status_rx,
            events: events.clone(),
            frames,
            has_credentials: config.has_credentials(),
            auto_start: config.auto_start_on_view_enter,
            on_error: self.on_error.clone(),
        };

        let manager = SessionLifecycleManager::new(EngineParts {
            config,
            connector,
            capture,
            playback,
            playback_events,
            history: self
                .history
                .unwrap_or_else(|| Box::new(SharedHistory::new())),
            tools: self.tools,
            visual,
            visual_results,
            commands,
            events,
            status: status_tx,
            on_error: self.on_error,
        });

        Ok((control, manager))
    }

    /// Build and spawn the engine on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// See [`build`](Self::build).
    pub fn spawn(self) -> Result<(VoiceControl, JoinHandle<()>), SessionError> {
        let (control, manager) = self.build()?;
        let handle = tokio::spawn(manager.run());
        Ok((control, handle))
    }
}
