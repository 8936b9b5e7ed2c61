//! Microphone capture pipeline.
//!
//! The pipeline is created once per application and owns the input device
//! for its whole lifetime. A [`ProcessingNode`] sits between the device and
//! the session: it resamples to the configured input rate, slices the
//! stream into fixed-size PCM16 frames, and forwards them while its edge is
//! connected. Muting only disconnects that edge; the device keeps running,
//! so unmuting is instant and never re-prompts for permission.
//!
//! Opening and closing the device may block (permission prompts, driver
//! start-up), so both run on tokio's blocking pool and never on the task
//! that drives the session.

use crate::audio::pcm::{StreamResampler, f32_to_pcm16, to_mono};
use crate::config::AudioConfig;
use crate::error::PermissionError;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A device open in flight; feed its output to
/// [`CapturePipeline::finish_acquire`].
pub type AcquireTask = JoinHandle<Result<(), PermissionError>>;

/// A fixed-size frame of microphone audio, ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Monotonic per-pipeline frame counter.
    pub sequence: u64,
    /// Mono signed 16-bit samples.
    pub pcm: Vec<i16>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// When the last sample of this frame was delivered by the device.
    pub captured_at: Instant,
}

/// A source of raw microphone samples.
///
/// Implementations deliver mono f32 samples to the node from their own
/// thread until [`close`](Self::close) is called. Both calls run on the
/// blocking pool and may wait on the OS.
pub trait CaptureDevice: Send {
    /// Acquire the device and start delivering samples to `node`.
    ///
    /// # Errors
    ///
    /// Returns [`PermissionError`] if the device cannot be acquired.
    fn open(&mut self, node: Arc<ProcessingNode>) -> Result<(), PermissionError>;

    /// Stop the device and release it.
    fn close(&mut self);
}

struct FramerState {
    pending: Vec<f32>,
    resampler: StreamResampler,
    next_sequence: u64,
    sink: Option<mpsc::UnboundedSender<AudioFrame>>,
}

/// Frames device samples into fixed-size chunks and forwards them.
pub struct ProcessingNode {
    connected: AtomicBool,
    target_rate: u32,
    chunk_frame_count: usize,
    state: Mutex<FramerState>,
}

impl ProcessingNode {
    fn new(target_rate: u32, chunk_frame_count: usize) -> Self {
        Self {
            connected: AtomicBool::new(false),
            target_rate,
            chunk_frame_count: chunk_frame_count.max(1),
            state: Mutex::new(FramerState {
                pending: Vec::with_capacity(chunk_frame_count * 2),
                resampler: StreamResampler::default(),
                next_sequence: 0,
                sink: None,
            }),
        }
    }

    /// Feed mono samples captured at `native_rate`.
    ///
    /// Called from the device thread; never blocks on the session.
    pub fn process(&self, mono: &[f32], native_rate: u32) {
        if !self.connected.load(Ordering::Acquire) {
            return;
        }
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        // Re-check under the lock so a concurrent mute cannot race a push.
        if !self.connected.load(Ordering::Acquire) {
            return;
        }

        let samples = state.resampler.process(mono, native_rate, self.target_rate);
        state.pending.extend_from_slice(&samples);

        while state.pending.len() >= self.chunk_frame_count {
            let chunk: Vec<f32> = state.pending.drain(..self.chunk_frame_count).collect();
            let frame = AudioFrame {
                sequence: state.next_sequence,
                pcm: f32_to_pcm16(&chunk),
                sample_rate: self.target_rate,
                captured_at: Instant::now(),
            };
            state.next_sequence += 1;
            if let Some(sink) = &state.sink
                && sink.send(frame).is_err()
            {
                debug!("capture sink closed, dropping frame");
            }
        }
    }

    fn set_connected(&self, connected: bool) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        self.connected.store(connected, Ordering::Release);
        if !connected {
            // A partial frame must not leak pre-mute audio after unmute.
            state.pending.clear();
            state.resampler.reset();
        }
    }

    fn set_sink(&self, sink: Option<mpsc::UnboundedSender<AudioFrame>>) {
        if let Ok(mut state) = self.state.lock() {
            state.sink = sink;
            state.pending.clear();
            state.resampler.reset();
        }
    }

    /// Whether frames currently flow to the session.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

/// Owns the capture device and its processing node.
pub struct CapturePipeline {
    device: Arc<Mutex<Box<dyn CaptureDevice>>>,
    node: Arc<ProcessingNode>,
    acquired: bool,
    muted: bool,
    acquisitions: u64,
    /// Device close still running on the blocking pool.
    closing: Option<JoinHandle<()>>,
}

impl CapturePipeline {
    pub fn new(device: Box<dyn CaptureDevice>, config: &AudioConfig) -> Self {
        Self {
            device: Arc::new(Mutex::new(device)),
            node: Arc::new(ProcessingNode::new(
                config.sample_rate_in,
                config.chunk_frame_count,
            )),
            acquired: false,
            muted: false,
            acquisitions: 0,
            closing: None,
        }
    }

    /// Start opening the microphone. `None` while already acquired.
    ///
    /// The open waits for any close still in flight, so a quick stop/start
    /// never reorders the two.
    pub fn acquire(&mut self) -> Option<AcquireTask> {
        if self.acquired {
            return None;
        }
        let device = Arc::clone(&self.device);
        let node = Arc::clone(&self.node);
        let closing = self.closing.take();
        Some(tokio::spawn(async move {
            if let Some(closing) = closing {
                let _ = closing.await;
            }
            match tokio::task::spawn_blocking(move || lock_device(&device).open(node)).await {
                Ok(result) => result,
                Err(e) => Err(PermissionError::Unavailable(format!(
                    "microphone open task failed: {e}"
                ))),
            }
        }))
    }

    /// Record the outcome of an [`acquire`](Self::acquire) task.
    ///
    /// # Errors
    ///
    /// Returns the [`PermissionError`] if the device refused access.
    pub fn finish_acquire(
        &mut self,
        result: Result<(), PermissionError>,
    ) -> Result<(), PermissionError> {
        result?;
        self.acquired = true;
        self.acquisitions += 1;
        info!(acquisitions = self.acquisitions, "microphone acquired");
        Ok(())
    }

    /// Attach the processing node to `sink`, connected unless `is_muted`.
    pub fn connect(&mut self, is_muted: bool, sink: mpsc::UnboundedSender<AudioFrame>) {
        self.node.set_sink(Some(sink));
        self.set_muted(is_muted);
    }

    /// Connect or disconnect the processing edge. Never touches the device.
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        self.node.set_connected(!muted);
        debug!(muted, "capture edge updated");
    }

    /// Tear the graph down and close the device in the background.
    pub fn release(&mut self) {
        self.node.set_connected(false);
        self.node.set_sink(None);
        if !self.acquired {
            return;
        }
        self.acquired = false;
        let device = Arc::clone(&self.device);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                self.closing = Some(runtime.spawn_blocking(move || lock_device(&device).close()));
            }
            Err(_) => lock_device(&device).close(),
        }
        info!("microphone released");
    }

    /// Wait for a background close to finish.
    pub async fn closed(&mut self) {
        if let Some(closing) = self.closing.take()
            && closing.await.is_err()
        {
            warn!("microphone close task failed");
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Number of times the device has been opened.
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.release();
    }
}

fn lock_device(device: &Mutex<Box<dyn CaptureDevice>>) -> MutexGuard<'_, Box<dyn CaptureDevice>> {
    device.lock().unwrap_or_else(|e| e.into_inner())
}

/// Microphone device backed by cpal.
///
/// cpal streams are not `Send`, so the stream lives on a dedicated thread
/// that parks until [`close`](CaptureDevice::close).
pub struct CpalCaptureDevice {
    device_name: Option<String>,
    worker: Option<CaptureWorker>,
}

struct CaptureWorker {
    stop_tx: std::sync::mpsc::Sender<()>,
    thread: std::thread::JoinHandle<()>,
}

impl CpalCaptureDevice {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            device_name: config.input_device.clone(),
            worker: None,
        }
    }

    /// List available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>, PermissionError> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| PermissionError::Unavailable(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}

impl CaptureDevice for CpalCaptureDevice {
    fn open(&mut self, node: Arc<ProcessingNode>) -> Result<(), PermissionError> {
        if self.worker.is_some() {
            return Ok(());
        }

        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), PermissionError>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let device_name = self.device_name.clone();

        let thread = std::thread::Builder::new()
            .name("livevoice-capture".into())
            .spawn(move || match build_input_stream(device_name.as_deref(), node) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // Hold the stream alive until released.
                    let _ = stop_rx.recv();
                    drop(stream);
                    info!("audio capture stopped");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| {
                PermissionError::Unavailable(format!("cannot spawn capture thread: {e}"))
            })?;

        let ready = ready_rx.recv().map_err(|_| {
            PermissionError::Unavailable("capture thread exited during startup".into())
        })?;
        match ready {
            Ok(()) => {
                self.worker = Some(CaptureWorker { stop_tx, thread });
                Ok(())
            }
            Err(e) => {
                let _ = thread.join();
                Err(e)
            }
        }
    }

    fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            if worker.thread.join().is_err() {
                warn!("capture thread panicked during shutdown");
            }
        }
    }
}

fn build_input_stream(
    device_name: Option<&str>,
    node: Arc<ProcessingNode>,
) -> Result<cpal::Stream, PermissionError> {
    let host = cpal::default_host();

    let device = if let Some(name) = device_name {
        host.input_devices()
            .map_err(|e| PermissionError::Unavailable(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| {
                PermissionError::Unavailable(format!("input device '{name}' not found"))
            })?
    } else {
        host.default_input_device()
            .ok_or_else(|| PermissionError::Unavailable("no default input device".into()))?
    };

    let device_label = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("using input device: {device_label}");

    let default_config = device
        .default_input_config()
        .map_err(|e| PermissionError::Denied(format!("no default input config: {e}")))?;

    let native_rate = default_config.sample_rate();
    let native_channels = default_config.channels();
    let stream_config = StreamConfig {
        channels: native_channels,
        sample_rate: native_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    info!(
        "native input config: {}Hz, {} channels",
        native_rate, native_channels
    );

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mono = to_mono(data, native_channels);
                node.process(&mono, native_rate);
            },
            move |err| {
                error!("audio input stream error: {err}");
            },
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                PermissionError::Unavailable("input device disappeared".into())
            }
            other => PermissionError::Denied(format!("failed to build input stream: {other}")),
        })?;

    stream
        .play()
        .map_err(|e| PermissionError::Denied(format!("failed to start input stream: {e}")))?;

    Ok(stream)
}
