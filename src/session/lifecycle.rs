//! The session actor.
//!
//! [`SessionLifecycleManager::run`] is one `select!` loop that owns every
//! piece of mutable session state: the channel handle, the capture
//! pipeline, the turn processor, the pending action, the visual streamer
//! and the retry policy. Capture callbacks, inbound channel frames, tool
//! completions, playback completions and timers all arrive here as
//! messages, so no two of them ever run concurrently.
//!
//! After every event the manager "settles": it runs a deferred stop/pause
//! once the session is quiescent, starts a queued hot-swap when it is
//! allowed, and publishes a fresh [`SessionStatus`].
//!
//! Work that can take long (opening the microphone, the channel handshake)
//! runs in its own task; the loop polls its `JoinHandle` like any other
//! event source.

use crate::audio::capture::{AcquireTask, AudioFrame, CapturePipeline};
use crate::audio::playback::{PlaybackEvent, PlaybackScheduler};
use crate::channel::messages::{InboundEvent, OutboundMessage, ToolCall};
use crate::channel::{ChannelHandle, ConnectParams, ConversationConnector, InboundFrame};
use crate::config::SessionConfig;
use crate::control::ErrorCallback;
use crate::error::{ConnectError, PermissionError, SessionError, StartError};
use crate::runtime::{RuntimeEvent, SessionState, SessionStatus};
use crate::session::pending::{PendingAction, PendingActionCoordinator};
use crate::session::retry::{RetryDecision, RetryPolicy};
use crate::session::turn::{ConversationHistory, ToolCompletion, TurnProcessor, TurnSignal};
use crate::session::visual::{GrabResult, VisualContextStreamer};
use crate::tools::{ToolRegistry, invoke};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Per-session state shared with the components the manager drives.
///
/// Components receive `&mut SessionContext` for the duration of one event;
/// nothing holds on to it.
pub struct SessionContext {
    pub config: SessionConfig,
    pub playback: PlaybackScheduler,
    connection: Option<ChannelHandle>,
    history: Box<dyn ConversationHistory>,
    events: broadcast::Sender<RuntimeEvent>,
    tools: Arc<dyn ToolRegistry>,
    tool_tx: mpsc::UnboundedSender<ToolCompletion>,
}

impl SessionContext {
    /// Build a context; the receiver yields finished tool calls.
    pub fn new(
        config: SessionConfig,
        playback: PlaybackScheduler,
        history: Box<dyn ConversationHistory>,
        tools: Arc<dyn ToolRegistry>,
        events: broadcast::Sender<RuntimeEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<ToolCompletion>) {
        let (tool_tx, tool_rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                playback,
                connection: None,
                history,
                events,
                tools,
                tool_tx,
            },
            tool_rx,
        )
    }

    /// Install a live channel, returning the one it replaces.
    pub fn attach(&mut self, handle: ChannelHandle) -> Option<ChannelHandle> {
        self.connection.replace(handle)
    }

    pub fn detach(&mut self) -> Option<ChannelHandle> {
        self.connection.take()
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection.as_ref().map(ChannelHandle::id)
    }

    /// Send on the live channel. Returns `false` when there is none.
    pub fn send(&self, msg: OutboundMessage) -> bool {
        self.connection.as_ref().is_some_and(|c| c.send(msg))
    }

    pub fn emit(&self, event: RuntimeEvent) {
        let _ = self.events.send(event);
    }

    pub fn history_mut(&mut self) -> &mut dyn ConversationHistory {
        self.history.as_mut()
    }

    /// Run a tool call in the background; its completion comes back through
    /// the receiver returned by [`new`](Self::new), tagged with the channel
    /// it was requested on.
    pub fn dispatch_tool(&self, call: ToolCall) {
        let tools = Arc::clone(&self.tools);
        let tx = self.tool_tx.clone();
        let connection_id = self.connection_id().map(str::to_owned);
        let timeout = self.config.turn.tool_timeout_ms.map(Duration::from_millis);
        tokio::spawn(async move {
            let call_id = call.id.clone();
            let name = call.name.clone();
            let outcome = invoke(tools, call, timeout).await;
            let _ = tx.send(ToolCompletion {
                connection_id,
                call_id,
                name,
                outcome,
            });
        });
    }
}

/// Requests from [`VoiceControl`](crate::control::VoiceControl).
#[derive(Debug)]
pub enum ControlCommand {
    Start {
        reply: Option<oneshot::Sender<Result<(), StartError>>>,
    },
    Stop {
        immediate: bool,
    },
    SetMuted(bool),
    ToggleMute,
    Pause {
        duration: Duration,
    },
    /// `flushed` counts buffers the caller already dropped from playback.
    Interrupt {
        flushed: usize,
    },
    EnableVideo,
    DisableVideo,
    SetVoiceProfile(String),
    Shutdown,
}

/// Everything the manager needs, assembled by
/// [`SessionBuilder`](crate::control::SessionBuilder).
pub struct EngineParts {
    pub config: SessionConfig,
    pub connector: Arc<dyn ConversationConnector>,
    pub capture: CapturePipeline,
    pub playback: PlaybackScheduler,
    pub playback_events: mpsc::UnboundedReceiver<PlaybackEvent>,
    pub history: Box<dyn ConversationHistory>,
    pub tools: Arc<dyn ToolRegistry>,
    pub visual: VisualContextStreamer,
    pub visual_results: mpsc::UnboundedReceiver<GrabResult>,
    pub commands: mpsc::UnboundedReceiver<ControlCommand>,
    pub events: broadcast::Sender<RuntimeEvent>,
    pub status: watch::Sender<SessionStatus>,
    pub on_error: Option<ErrorCallback>,
}

/// Owns the duplex channel and orchestrates every session component.
pub struct SessionLifecycleManager {
    ctx: SessionContext,
    connector: Arc<dyn ConversationConnector>,
    capture: CapturePipeline,
    turn: TurnProcessor,
    pending: PendingActionCoordinator,
    visual: VisualContextStreamer,
    retry: RetryPolicy,

    commands: mpsc::UnboundedReceiver<ControlCommand>,
    frames_tx: mpsc::UnboundedSender<AudioFrame>,
    frames_rx: mpsc::UnboundedReceiver<AudioFrame>,
    tool_rx: mpsc::UnboundedReceiver<ToolCompletion>,
    playback_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
    visual_rx: mpsc::UnboundedReceiver<GrabResult>,
    status_tx: watch::Sender<SessionStatus>,
    on_error: Option<ErrorCallback>,

    state: SessionState,
    /// The user's mute choice; survives pause and reconnects.
    muted: bool,
    acquiring: Option<AcquireTask>,
    connect: Option<JoinHandle<Result<ChannelHandle, ConnectError>>>,
    backoff_until: Option<Instant>,
    resume_at: Option<Instant>,
    /// Voice profile waiting for a hot-swap.
    swap_to: Option<String>,
    start_waiters: Vec<oneshot::Sender<Result<(), StartError>>>,
    /// Frames captured while no channel is live.
    backlog: VecDeque<AudioFrame>,
    protocol_errors: u32,
}

impl SessionLifecycleManager {
    pub fn new(parts: EngineParts) -> Self {
        let (ctx, tool_rx) = SessionContext::new(
            parts.config,
            parts.playback,
            parts.history,
            parts.tools,
            parts.events,
        );
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let turn = TurnProcessor::new(&ctx.config.turn);
        let retry = RetryPolicy::from_config(&ctx.config.retry);
        Self {
            ctx,
            connector: parts.connector,
            capture: parts.capture,
            turn,
            pending: PendingActionCoordinator::new(),
            visual: parts.visual,
            retry,
            commands: parts.commands,
            frames_tx,
            frames_rx,
            tool_rx,
            playback_rx: parts.playback_events,
            visual_rx: parts.visual_results,
            status_tx: parts.status,
            on_error: parts.on_error,
            state: SessionState::Idle,
            muted: false,
            acquiring: None,
            connect: None,
            backoff_until: None,
            resume_at: None,
            swap_to: None,
            start_waiters: Vec::new(),
            backlog: VecDeque::new(),
            protocol_errors: 0,
        }
    }

    /// Drive the session until [`ControlCommand::Shutdown`] or until every
    /// [`VoiceControl`](crate::control::VoiceControl) is dropped.
    pub async fn run(mut self) {
        info!("voice session engine started");
        self.publish_status();

        loop {
            let flush_at = self.turn.flush_deadline();
            let live = self.ctx.connection.is_some();
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(ControlCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                Some(frame) = self.frames_rx.recv() => self.forward_frame(frame),
                result = join_acquire(&mut self.acquiring), if self.acquiring.is_some() => {
                    self.acquiring = None;
                    self.on_acquired(result);
                }
                inbound = recv_inbound(&mut self.ctx.connection), if live => {
                    self.handle_inbound(inbound);
                }
                result = join_connect(&mut self.connect), if self.connect.is_some() => {
                    self.connect = None;
                    self.on_connect_result(result);
                }
                () = sleep_until_opt(self.backoff_until), if self.backoff_until.is_some() => {
                    self.backoff_until = None;
                    self.begin_connect();
                }
                () = sleep_until_opt(self.resume_at), if self.resume_at.is_some() => {
                    self.resume_at = None;
                    self.resume();
                }
                Some(done) = self.tool_rx.recv() => {
                    let signals = self.turn.on_tool_completed(done, &mut self.ctx);
                    log_signals(&signals);
                }
                Some(event) = self.playback_rx.recv() => {
                    if self.ctx.playback.complete(&event) {
                        self.ctx.emit(RuntimeEvent::AssistantSpeaking { active: false });
                    }
                }
                timer = self.visual.wait(), if self.visual.is_enabled() => {
                    self.visual.on_timer(timer);
                    if !self.visual.is_enabled() {
                        self.ctx.emit(RuntimeEvent::VideoStreaming { enabled: false });
                    }
                }
                Some(grab) = self.visual_rx.recv() => self.visual.on_result(grab, &self.ctx),
                () = sleep_until_opt(flush_at), if flush_at.is_some() => {
                    self.turn.flush_ui(&self.ctx);
                }
            }
            self.settle();
        }

        self.teardown("engine shutdown");
        if let Some(task) = self.acquiring.take()
            && let Ok(result) = task.await
            && self.capture.finish_acquire(result).is_ok()
        {
            self.capture.release();
        }
        self.capture.closed().await;
        self.publish_status();
        info!("voice session engine stopped");
    }

    fn handle_command(&mut self, cmd: ControlCommand) {
        match cmd {
            ControlCommand::Start { reply } => {
                let result = self.start();
                match (result, reply) {
                    (Ok(()), Some(reply)) => self.start_waiters.push(reply),
                    (Err(e), Some(reply)) => {
                        let _ = reply.send(Err(e));
                    }
                    (_, None) => {}
                }
            }
            ControlCommand::Stop { immediate } => self.request_stop(immediate),
            ControlCommand::SetMuted(muted) => self.set_muted(muted),
            ControlCommand::ToggleMute => self.set_muted(!self.muted),
            ControlCommand::Pause { duration } => self.request_pause(duration),
            ControlCommand::Interrupt { flushed } => {
                if flushed + self.ctx.playback.interrupt() > 0 {
                    self.ctx.emit(RuntimeEvent::AssistantSpeaking { active: false });
                }
                if self.state.is_active() {
                    let signals = self.turn.interrupt(&mut self.ctx);
                    log_signals(&signals);
                }
            }
            ControlCommand::EnableVideo => {
                let was_enabled = self.visual.is_enabled();
                if self.visual.enable(self.state == SessionState::Live) && !was_enabled {
                    self.ctx.emit(RuntimeEvent::VideoStreaming { enabled: true });
                }
            }
            ControlCommand::DisableVideo => self.disable_video(),
            ControlCommand::SetVoiceProfile(profile) => self.set_voice_profile(profile),
            // Handled by the run loop.
            ControlCommand::Shutdown => {}
        }
    }

    fn start(&mut self) -> Result<(), StartError> {
        if self.pending.is_stop_pending() {
            warn!("start rejected: a stop is pending");
            return Err(StartError::StopPending);
        }
        if self.state.is_active() {
            info!(state = ?self.state, "start ignored: session already active");
            return Err(StartError::AlreadyActive);
        }
        if !self.ctx.config.has_credentials() {
            self.report_error(SessionError::Start(StartError::MissingCredentials));
            return Err(StartError::MissingCredentials);
        }

        self.backlog.clear();
        self.protocol_errors = 0;
        self.set_state(SessionState::Connecting);
        // An open left over from a cancelled start is reused.
        if self.acquiring.is_none() {
            match self.capture.acquire() {
                Some(task) => self.acquiring = Some(task),
                None => self.on_microphone_ready(),
            }
        }
        Ok(())
    }

    fn on_acquired(&mut self, result: Result<(), PermissionError>) {
        let result = self.capture.finish_acquire(result);
        if !self.state.is_active() {
            debug!("microphone opened after stop, releasing it");
            self.capture.release();
            return;
        }
        match result {
            Ok(()) => self.on_microphone_ready(),
            Err(e) => self.fail_start(
                StartError::PermissionDenied(e.clone()),
                SessionError::Permission(e),
                "microphone unavailable",
            ),
        }
    }

    fn on_microphone_ready(&mut self) {
        let paused = self.state == SessionState::Paused;
        self.capture.connect(self.muted || paused, self.frames_tx.clone());
        // After a pause or its resume, the resume path owns the connect.
        if self.state == SessionState::Connecting {
            self.begin_connect();
        }
    }

    fn begin_connect(&mut self) {
        if let Some(previous) = self.connect.take() {
            previous.abort();
        }
        let params = ConnectParams {
            voice_profile: self.ctx.config.voice_profile.clone(),
            sample_rate_in: self.ctx.config.audio.sample_rate_in,
            sample_rate_out: self.ctx.config.audio.sample_rate_out,
            attempt: self.retry.attempts(),
        };
        info!(
            voice_profile = %params.voice_profile,
            attempt = params.attempt,
            "connecting voice channel"
        );
        let connector = Arc::clone(&self.connector);
        self.connect = Some(tokio::spawn(async move { connector.connect(params).await }));
    }

    fn on_connect_result(&mut self, result: Result<ChannelHandle, ConnectError>) {
        match result {
            Ok(handle) => {
                if !self.state.is_active() {
                    debug!("connect finished after stop, discarding channel");
                    return;
                }
                self.retry.on_success();
                self.protocol_errors = 0;
                let connection_id = handle.id().to_owned();
                if let Some(stale) = self.ctx.attach(handle) {
                    stale.close();
                }
                self.capture.set_muted(self.muted);
                self.flush_backlog();
                self.set_state(SessionState::Live);
                info!(
                    %connection_id,
                    voice_profile = %self.ctx.config.voice_profile,
                    "voice session live"
                );
                for waiter in self.start_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            Err(e) => {
                warn!(error = %e, "voice channel connect failed");
                self.on_connect_failure(e);
            }
        }
    }

    fn on_connect_failure(&mut self, err: ConnectError) {
        match self.retry.on_failure() {
            RetryDecision::RetryAfter(delay) => {
                self.backoff_until = Some(Instant::now() + delay);
                if self.state != SessionState::Connecting {
                    self.set_state(SessionState::Reconnecting);
                }
            }
            RetryDecision::GiveUp => self.give_up(err),
        }
    }

    fn give_up(&mut self, source: ConnectError) {
        let err = StartError::ConnectFailed {
            attempts: self.retry.attempts(),
            source,
        };
        self.fail_start(
            err.clone(),
            SessionError::Start(err),
            "connect retries exhausted",
        );
    }

    /// Tear down, then answer waiters once the idle status is visible.
    fn fail_start(&mut self, err: StartError, report: SessionError, reason: &str) {
        let waiters = std::mem::take(&mut self.start_waiters);
        self.report_error(report);
        self.teardown(reason);
        self.publish_status();
        for waiter in waiters {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    fn forward_frame(&mut self, frame: AudioFrame) {
        if self.ctx.send(OutboundMessage::audio(&frame)) {
            return;
        }
        match self.state {
            SessionState::Live
            | SessionState::Connecting
            | SessionState::Reconnecting
            | SessionState::HotSwapping => self.buffer_frame(frame),
            SessionState::Idle | SessionState::Paused => {
                debug!(sequence = frame.sequence, "no live channel, dropping frame");
            }
        }
    }

    fn buffer_frame(&mut self, frame: AudioFrame) {
        let capacity = self.ctx.config.reconnect_buffer_frames;
        if capacity == 0 {
            return;
        }
        if self.backlog.len() >= capacity
            && let Some(dropped) = self.backlog.pop_front()
        {
            warn!(
                sequence = dropped.sequence,
                capacity, "reconnect buffer full, dropping oldest frame"
            );
        }
        self.backlog.push_back(frame);
    }

    fn flush_backlog(&mut self) {
        let Some(conn) = &self.ctx.connection else {
            return;
        };
        let buffered = self.backlog.len();
        while let Some(frame) = self.backlog.pop_front() {
            if !conn.send(OutboundMessage::audio(&frame)) {
                self.backlog.push_front(frame);
                break;
            }
        }
        if buffered > 0 {
            debug!(frames = buffered, "flushed buffered audio to new channel");
        }
    }

    fn handle_inbound(&mut self, inbound: Option<InboundFrame>) {
        match inbound {
            None => self.on_channel_lost(ConnectError::Closed("transport closed".into())),
            Some(Err(e)) => {
                self.protocol_errors += 1;
                warn!(
                    error = %e,
                    consecutive = self.protocol_errors,
                    "dropping malformed inbound event"
                );
                let threshold = self.ctx.config.protocol_error_threshold;
                if threshold > 0 && self.protocol_errors >= threshold {
                    let reason = format!("{} consecutive malformed events", self.protocol_errors);
                    self.on_channel_lost(ConnectError::Protocol(reason));
                }
            }
            Some(Ok(InboundEvent::FatalError { message })) => {
                error!(%message, "remote reported a fatal error");
                self.on_channel_lost(ConnectError::Remote(message));
            }
            Some(Ok(event)) => {
                self.protocol_errors = 0;
                let signals = self.turn.handle_event(event, &mut self.ctx);
                log_signals(&signals);
            }
        }
    }

    fn on_channel_lost(&mut self, err: ConnectError) {
        warn!(error = %err, "voice channel lost");
        self.retire_channel();
        self.protocol_errors = 0;
        if !self.state.is_active() {
            return;
        }
        self.set_state(SessionState::Reconnecting);
        self.on_connect_failure(err);
    }

    /// Close the live channel and drop everything that belonged to it.
    fn retire_channel(&mut self) {
        if let Some(handle) = self.ctx.detach() {
            debug!(connection_id = handle.id(), "retiring voice channel");
            handle.close();
        }
        let signals = self.turn.abandon(&mut self.ctx);
        log_signals(&signals);
        if self.ctx.playback.interrupt() > 0 {
            self.ctx.emit(RuntimeEvent::AssistantSpeaking { active: false });
        }
    }

    fn request_stop(&mut self, immediate: bool) {
        if !self.state.is_active() {
            debug!("stop ignored: no active session");
            return;
        }
        if immediate {
            self.teardown("stopped by user");
            return;
        }
        let busy = !self.is_quiescent();
        if let Some(action) = self.pending.request_stop(busy) {
            self.execute(action);
        }
    }

    fn request_pause(&mut self, duration: Duration) {
        if !self.state.is_active() {
            warn!("pause ignored: no active session");
            return;
        }
        if self.state == SessionState::Paused {
            self.resume_at = Some(Instant::now() + duration);
            info!(duration_ms = duration.as_millis() as u64, "pause extended");
            return;
        }
        let busy = !self.is_quiescent();
        if let Some(action) = self.pending.request_pause(duration, busy) {
            self.execute(action);
        }
    }

    fn execute(&mut self, action: PendingAction) {
        match action {
            PendingAction::Stop => self.teardown("stopped by user"),
            PendingAction::Pause { duration } => self.pause_now(duration),
        }
    }

    fn pause_now(&mut self, duration: Duration) {
        info!(duration_ms = duration.as_millis() as u64, "pausing voice session");
        self.cancel_connect();
        self.retire_channel();
        self.disable_video();
        // Only the edge; `self.muted` keeps the user's choice for resume.
        self.capture.set_muted(true);
        self.backlog.clear();
        self.resume_at = Some(Instant::now() + duration);
        self.set_state(SessionState::Paused);
    }

    fn resume(&mut self) {
        if self.state != SessionState::Paused {
            return;
        }
        info!("pause elapsed, reconnecting");
        self.set_state(SessionState::Reconnecting);
        self.begin_connect();
    }

    fn set_muted(&mut self, muted: bool) {
        if self.muted == muted {
            return;
        }
        self.muted = muted;
        if self.state != SessionState::Paused {
            self.capture.set_muted(muted);
        }
        info!(muted, "microphone mute changed");
        self.ctx.emit(RuntimeEvent::MuteChanged { muted });
    }

    fn disable_video(&mut self) {
        if self.visual.is_enabled() {
            self.visual.disable();
            self.ctx.emit(RuntimeEvent::VideoStreaming { enabled: false });
        }
    }

    fn set_voice_profile(&mut self, profile: String) {
        if profile.trim().is_empty() {
            warn!("ignoring empty voice profile");
            return;
        }
        // No channel and no handshake: the next connect picks the profile up.
        let between_channels = self.ctx.connection.is_none() && self.connect.is_none();
        match self.state {
            SessionState::Idle | SessionState::Paused => {
                self.ctx.config.voice_profile = profile;
                self.swap_to = None;
            }
            SessionState::Connecting | SessionState::Reconnecting if between_channels => {
                self.ctx.config.voice_profile = profile;
                self.swap_to = None;
            }
            _ if profile == self.ctx.config.voice_profile => {
                self.swap_to = None;
            }
            _ => {
                info!(voice_profile = %profile, "hot-swap requested");
                self.swap_to = Some(profile);
            }
        }
    }

    /// Swap channels once live, quiescent and with no pending action.
    fn maybe_hot_swap(&mut self) {
        if self.swap_to.is_none()
            || self.state != SessionState::Live
            || self.pending.pending().is_some()
            || !self.is_quiescent()
        {
            return;
        }
        let Some(profile) = self.swap_to.take() else {
            return;
        };
        info!(
            from = %self.ctx.config.voice_profile,
            to = %profile,
            "hot-swapping voice channel"
        );
        self.ctx.config.voice_profile = profile;
        self.retire_channel();
        self.set_state(SessionState::HotSwapping);
        self.begin_connect();
    }

    fn is_quiescent(&self) -> bool {
        !self.turn.is_busy() && !self.ctx.playback.is_speaking()
    }

    fn settle(&mut self) {
        if self.pending.pending().is_some()
            && self.is_quiescent()
            && let Some(action) = self.pending.on_quiescent()
        {
            info!(?action, "running deferred action");
            self.execute(action);
        }
        self.maybe_hot_swap();
        self.publish_status();
    }

    fn cancel_connect(&mut self) {
        if let Some(attempt) = self.connect.take() {
            attempt.abort();
        }
        self.backoff_until = None;
    }

    /// Full stop: channel, playback, visual stream and microphone.
    fn teardown(&mut self, reason: &str) {
        let was_active = self.state.is_active();
        self.cancel_connect();
        self.resume_at = None;
        self.swap_to = None;
        self.pending.clear();
        self.retire_channel();
        self.disable_video();
        self.capture.release();
        self.backlog.clear();
        self.protocol_errors = 0;
        for waiter in self.start_waiters.drain(..) {
            let _ = waiter.send(Err(StartError::Aborted));
        }
        self.set_state(SessionState::Idle);
        if was_active {
            info!(reason, "voice session stopped");
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        debug!(from = ?self.state, to = ?state, "session state changed");
        self.state = state;
        self.ctx.emit(RuntimeEvent::StateChanged(state));
    }

    fn publish_status(&self) {
        let status = SessionStatus {
            state: self.state,
            muted: self.muted,
            turn_in_progress: self.turn.in_progress(),
            speaking: self.ctx.playback.is_speaking(),
            pending_action: self.pending.pending().map(|a| a.kind()),
            video_enabled: self.visual.is_enabled(),
            voice_profile: self.ctx.config.voice_profile.clone(),
            connection_id: self.ctx.connection_id().map(str::to_owned),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn report_error(&self, err: SessionError) {
        error!(error = %err, "voice session error");
        self.ctx.emit(RuntimeEvent::Error {
            message: err.user_message(),
        });
        if let Some(callback) = &self.on_error {
            callback(&err);
        }
    }
}

fn log_signals(signals: &[TurnSignal]) {
    for signal in signals {
        debug!(?signal, "turn signal");
    }
}

async fn recv_inbound(conn: &mut Option<ChannelHandle>) -> Option<InboundFrame> {
    match conn {
        Some(conn) => conn.recv().await,
        None => std::future::pending().await,
    }
}

async fn join_connect(
    attempt: &mut Option<JoinHandle<Result<ChannelHandle, ConnectError>>>,
) -> Result<ChannelHandle, ConnectError> {
    match attempt {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(e) => Err(ConnectError::Handshake(format!("connect task failed: {e}"))),
        },
        None => std::future::pending().await,
    }
}

async fn join_acquire(task: &mut Option<AcquireTask>) -> Result<(), PermissionError> {
    match task {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(e) => Err(PermissionError::Unavailable(format!(
                "microphone task failed: {e}"
            ))),
        },
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
