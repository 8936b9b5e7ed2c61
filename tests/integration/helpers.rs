//! Fake collaborators shared by the integration tests.
//!
//! Every seam of the engine (connector, microphone, speaker, clock, tools,
//! frame source) is replaced by an in-process fake the test can drive.

use async_trait::async_trait;
use image::{DynamicImage, Rgb, RgbImage};
use livevoice::audio::capture::{CaptureDevice, ProcessingNode};
use livevoice::audio::pcm::{encode_pcm16_base64, f32_to_pcm16};
use livevoice::audio::playback::{AudioOutput, CompletionHandle, PlaybackClock, PlaybackQueueEntry};
use livevoice::channel::messages::{InboundEvent, OutboundMessage, ToolCall};
use livevoice::channel::{ChannelHandle, ConnectParams, ConversationConnector, InboundFrame};
use livevoice::error::{ConnectError, PermissionError, SessionError, ToolExecutionError};
use livevoice::session::turn::SharedHistory;
use livevoice::session::visual::FrameCapture;
use livevoice::tools::ToolRegistry;
use livevoice::{RuntimeEvent, SessionBuilder, SessionConfig, SessionStatus, VoiceControl};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Upper bound for any single wait in a test.
pub(crate) const WAIT: Duration = Duration::from_secs(5);

/// Output sample rate used by [`test_config`].
pub(crate) const OUT_RATE: u32 = 24_000;

/// Small frames and short backoff so tests stay fast.
pub(crate) fn test_config() -> SessionConfig {
    let mut config = SessionConfig {
        api_key: Some("test-key".into()),
        voice_profile: "default".into(),
        ..SessionConfig::default()
    };
    config.audio.sample_rate_in = 16_000;
    config.audio.sample_rate_out = OUT_RATE;
    config.audio.chunk_frame_count = 4;
    config.retry.max_retries = 3;
    config.retry.base_backoff_ms = 100;
    config.retry.max_backoff_ms = 1_000;
    config.visual.frame_size = 16;
    config.turn.transcript_flush_interval_ms = 10;
    config
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// The far side of one fake connection.
pub(crate) struct RemoteEnd {
    pub params: ConnectParams,
    outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    inbound: mpsc::UnboundedSender<InboundFrame>,
    shutdown: CancellationToken,
}

impl RemoteEnd {
    pub(crate) fn send(&self, event: InboundEvent) {
        self.inbound.send(Ok(event)).expect("session dropped channel");
    }

    /// Push a raw text frame through the same validation as the real transport.
    pub(crate) fn send_raw(&self, text: &str) {
        self.inbound
            .send(InboundEvent::parse(text))
            .expect("session dropped channel");
    }

    pub(crate) async fn next_message(&mut self) -> OutboundMessage {
        tokio::time::timeout(WAIT, self.outbound.recv())
            .await
            .expect("timed out waiting for outbound message")
            .expect("outbound queue closed")
    }

    /// Next tool result, skipping audio and video traffic.
    pub(crate) async fn next_tool_result(&mut self) -> (String, livevoice::channel::ToolOutcome) {
        loop {
            if let OutboundMessage::ToolResult { id, outcome } = self.next_message().await {
                return (id, outcome);
            }
        }
    }

    /// The session closed this connection.
    pub(crate) fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[derive(Default)]
struct ConnectorState {
    failures: VecDeque<ConnectError>,
    attempts: usize,
}

/// Connector that hands each successful connection's far end to the test.
#[derive(Clone)]
pub(crate) struct FakeConnector {
    state: Arc<Mutex<ConnectorState>>,
    remotes: mpsc::UnboundedSender<RemoteEnd>,
}

impl FakeConnector {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (remotes, rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Arc::default(),
                remotes,
            },
            rx,
        )
    }

    /// Make the next `n` connect attempts fail with `err`.
    pub(crate) fn fail_next(&self, n: usize, err: ConnectError) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..n {
            state.failures.push_back(err.clone());
        }
    }

    pub(crate) fn attempts(&self) -> usize {
        self.state.lock().unwrap().attempts
    }
}

#[async_trait]
impl ConversationConnector for FakeConnector {
    async fn connect(&self, params: ConnectParams) -> Result<ChannelHandle, ConnectError> {
        {
            let mut state = self.state.lock().unwrap();
            state.attempts += 1;
            if let Some(err) = state.failures.pop_front() {
                return Err(err);
            }
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let _ = self.remotes.send(RemoteEnd {
            params,
            outbound: out_rx,
            inbound: in_tx,
            shutdown: shutdown.clone(),
        });
        Ok(ChannelHandle::new(out_tx, in_rx, shutdown))
    }
}

// ---------------------------------------------------------------------------
// Microphone
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MicState {
    node: Option<Arc<ProcessingNode>>,
    opens: usize,
    closes: usize,
}

/// Microphone whose samples are pushed by the test.
#[derive(Clone, Default)]
pub(crate) struct FakeMic {
    state: Arc<Mutex<MicState>>,
    deny: Arc<AtomicBool>,
    /// When set, the next open blocks until the test answers the prompt.
    prompt: Arc<Mutex<Option<std::sync::mpsc::Receiver<()>>>>,
}

impl FakeMic {
    pub(crate) fn denying() -> Self {
        let mic = Self::default();
        mic.deny.store(true, Ordering::SeqCst);
        mic
    }

    pub(crate) fn allow(&self) {
        self.deny.store(false, Ordering::SeqCst);
    }

    /// Make the next open block like an OS permission prompt. Sending on
    /// the returned channel answers it.
    pub(crate) fn hold_prompt(&self) -> std::sync::mpsc::Sender<()> {
        let (tx, rx) = std::sync::mpsc::channel();
        *self.prompt.lock().unwrap() = Some(rx);
        tx
    }

    /// Deliver samples at the session's input rate.
    pub(crate) fn feed(&self, samples: &[f32]) {
        let node = self.state.lock().unwrap().node.clone();
        if let Some(node) = node {
            node.process(samples, 16_000);
        }
    }

    pub(crate) fn opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    pub(crate) fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    /// Closes run in the background; wait until `count` have happened.
    pub(crate) async fn wait_closes(&self, count: usize) {
        tokio::time::timeout(WAIT, async {
            while self.closes() < count {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("timed out waiting for the microphone to close");
    }
}

impl CaptureDevice for FakeMic {
    fn open(&mut self, node: Arc<ProcessingNode>) -> Result<(), PermissionError> {
        let prompt = self.prompt.lock().unwrap().take();
        if let Some(answer) = prompt {
            let _ = answer.recv();
        }
        if self.deny.load(Ordering::SeqCst) {
            return Err(PermissionError::Denied("test microphone".into()));
        }
        let mut state = self.state.lock().unwrap();
        state.node = Some(node);
        state.opens += 1;
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.node = None;
        state.closes += 1;
    }
}

// ---------------------------------------------------------------------------
// Speaker and clock
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub(crate) struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub(crate) fn set_ms(&self, ms: u64) {
        self.0.store(ms, Ordering::SeqCst);
    }
}

impl PlaybackClock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.0.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
struct SpeakerState {
    scheduled: Vec<PlaybackQueueEntry>,
    playing: Vec<CompletionHandle>,
    stops: usize,
}

/// Output that records schedules and only finishes buffers on request.
#[derive(Clone, Default)]
pub(crate) struct FakeSpeaker {
    state: Arc<Mutex<SpeakerState>>,
}

impl FakeSpeaker {
    /// Every buffer handed to the output, in schedule order.
    pub(crate) fn scheduled(&self) -> Vec<PlaybackQueueEntry> {
        self.state.lock().unwrap().scheduled.clone()
    }

    pub(crate) fn stops(&self) -> usize {
        self.state.lock().unwrap().stops
    }

    /// Play out everything that is queued.
    pub(crate) fn finish_all(&self) {
        let playing = std::mem::take(&mut self.state.lock().unwrap().playing);
        for handle in playing {
            handle.complete();
        }
    }

    pub(crate) async fn wait_scheduled(&self, count: usize) -> Vec<PlaybackQueueEntry> {
        tokio::time::timeout(WAIT, async {
            loop {
                let scheduled = self.scheduled();
                if scheduled.len() >= count {
                    return scheduled;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("timed out waiting for playback")
    }
}

impl AudioOutput for FakeSpeaker {
    fn schedule(
        &mut self,
        entry: &PlaybackQueueEntry,
        _samples: Arc<[f32]>,
        _sample_rate: u32,
        done: CompletionHandle,
    ) {
        let mut state = self.state.lock().unwrap();
        state.scheduled.push(entry.clone());
        state.playing.push(done);
    }

    fn stop_all(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.playing.clear();
        state.stops += 1;
    }
}

/// Base64 PCM16 model audio lasting `ms` at [`OUT_RATE`].
pub(crate) fn model_audio(ms: u64) -> InboundEvent {
    let samples = vec![0.1_f32; (OUT_RATE as u64 * ms / 1_000) as usize];
    InboundEvent::AudioChunk {
        data: encode_pcm16_base64(&f32_to_pcm16(&samples)),
        sample_rate: None,
    }
}

// ---------------------------------------------------------------------------
// Tools and frames
// ---------------------------------------------------------------------------

type Gate = oneshot::Receiver<Result<Value, String>>;

/// Registry whose tools finish only when the test releases their gate.
/// Tools without a gate are unknown.
#[derive(Default)]
pub(crate) struct GatedTools {
    gates: Mutex<HashMap<String, Gate>>,
}

impl GatedTools {
    pub(crate) fn gate(&self, name: &str) -> oneshot::Sender<Result<Value, String>> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().unwrap().insert(name.to_owned(), rx);
        tx
    }
}

#[async_trait]
impl ToolRegistry for GatedTools {
    async fn execute(&self, name: &str, _args: Value) -> Result<Value, ToolExecutionError> {
        let gate = self.gates.lock().unwrap().remove(name);
        let Some(gate) = gate else {
            return Err(ToolExecutionError::NotFound(name.to_owned()));
        };
        match gate.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(ToolExecutionError::Failed {
                name: name.to_owned(),
                message,
            }),
            Err(_) => Err(ToolExecutionError::Failed {
                name: name.to_owned(),
                message: "gate dropped".into(),
            }),
        }
    }
}

pub(crate) fn call(id: &str, name: &str) -> ToolCall {
    ToolCall {
        id: id.to_owned(),
        name: name.to_owned(),
        args: Value::Null,
    }
}

/// Frame source returning a flat grey image.
#[derive(Default)]
pub(crate) struct GreyScreen {
    pub grabs: AtomicUsize,
}

#[async_trait]
impl FrameCapture for GreyScreen {
    async fn grab(&self) -> Result<DynamicImage, SessionError> {
        self.grabs.fetch_add(1, Ordering::SeqCst);
        Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            64,
            48,
            Rgb([128, 128, 128]),
        )))
    }
}

// ---------------------------------------------------------------------------
// Session harness
// ---------------------------------------------------------------------------

pub(crate) struct TestSession {
    pub voice: VoiceControl,
    pub engine: JoinHandle<()>,
    pub connector: FakeConnector,
    pub remotes: mpsc::UnboundedReceiver<RemoteEnd>,
    pub mic: FakeMic,
    pub speaker: FakeSpeaker,
    pub clock: ManualClock,
    pub history: SharedHistory,
    errors: Arc<Mutex<Vec<String>>>,
}

impl TestSession {
    pub(crate) async fn next_remote(&mut self) -> RemoteEnd {
        tokio::time::timeout(WAIT, self.remotes.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }

    /// User-facing messages passed to the error callback so far.
    pub(crate) fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

pub(crate) fn spawn_session(config: SessionConfig) -> TestSession {
    spawn_session_with(config, Arc::new(GatedTools::default()), FakeMic::default(), None)
}

pub(crate) fn spawn_session_with(
    config: SessionConfig,
    tools: Arc<dyn ToolRegistry>,
    mic: FakeMic,
    frames: Option<Arc<dyn FrameCapture>>,
) -> TestSession {
    let (connector, remotes) = FakeConnector::new();
    let speaker = FakeSpeaker::default();
    let clock = ManualClock::default();
    let history = SharedHistory::new();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);

    let mut builder = SessionBuilder::new(config)
        .connector(Arc::new(connector.clone()))
        .capture_device(Box::new(mic.clone()))
        .audio_output(Box::new(speaker.clone()), Arc::new(clock.clone()))
        .tools(tools)
        .history(Box::new(history.clone()))
        .on_error(move |e| sink.lock().unwrap().push(e.user_message()));
    if let Some(frames) = frames {
        builder = builder.frame_capture(frames);
    }
    let (voice, engine) = builder.spawn().expect("spawn session");

    TestSession {
        voice,
        engine,
        connector,
        remotes,
        mic,
        speaker,
        clock,
        history,
        errors,
    }
}

/// Wait until the published status satisfies `pred`.
pub(crate) async fn wait_status(
    voice: &VoiceControl,
    pred: impl Fn(&SessionStatus) -> bool,
) -> SessionStatus {
    let mut rx = voice.subscribe_status();
    let status = tokio::time::timeout(WAIT, rx.wait_for(|s| pred(s)))
        .await
        .expect("timed out waiting for status")
        .expect("engine stopped");
    SessionStatus::clone(&status)
}

/// Collect runtime events up to and including the first one matching `stop`.
pub(crate) async fn collect_until(
    events: &mut broadcast::Receiver<RuntimeEvent>,
    stop: impl Fn(&RuntimeEvent) -> bool,
) -> Vec<RuntimeEvent> {
    let mut seen = Vec::new();
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let done = stop(&event);
                    seen.push(event);
                    if done {
                        break;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event");
    seen
}

/// Let the engine run for a moment.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
