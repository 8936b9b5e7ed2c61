//! Gapless playback of model audio against a monotonic audio clock.
//!
//! Every decoded buffer is scheduled at `max(next_start, clock.now())` and
//! `next_start` advances by the buffer's duration, so buffers play
//! back-to-back no matter how irregularly they arrive. [`interrupt`]
//! (barge-in) stops everything, clears the queue and pulls `next_start`
//! back to "now" in one synchronous step.
//!
//! [`interrupt`]: PlaybackScheduler::interrupt

use crate::audio::pcm::{decode_pcm16_base64, resample};
use crate::config::AudioConfig;
use crate::error::{DecodeError, SessionError};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Monotonic playback clock, measured from an arbitrary origin.
pub trait PlaybackClock: Send + Sync {
    fn now(&self) -> Duration;
}

/// A decoded buffer placed on the playback timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackQueueEntry {
    pub id: u64,
    pub scheduled_start: Duration,
    pub duration: Duration,
}

impl PlaybackQueueEntry {
    pub fn end(&self) -> Duration {
        self.scheduled_start + self.duration
    }
}

/// Notifications from the output back to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// A scheduled buffer finished playing.
    Ended { generation: u64, entry_id: u64 },
}

/// Completion callback handed to the output with each buffer.
#[derive(Debug)]
pub struct CompletionHandle {
    tx: mpsc::UnboundedSender<PlaybackEvent>,
    generation: u64,
    entry_id: u64,
}

impl CompletionHandle {
    /// Report that the buffer finished playing. Safe to call from an audio thread.
    pub fn complete(self) {
        let _ = self.tx.send(PlaybackEvent::Ended {
            generation: self.generation,
            entry_id: self.entry_id,
        });
    }
}

/// Audio sink that plays buffers at absolute clock positions.
pub trait AudioOutput: Send {
    /// Play `samples` starting at `entry.scheduled_start`; call `done` when finished.
    fn schedule(
        &mut self,
        entry: &PlaybackQueueEntry,
        samples: Arc<[f32]>,
        sample_rate: u32,
        done: CompletionHandle,
    );

    /// Silence everything scheduled or playing, without completion callbacks.
    fn stop_all(&mut self);
}

/// Result of a successful [`PlaybackScheduler::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    pub entry: PlaybackQueueEntry,
    /// The queue was empty before this buffer: the model started speaking.
    pub started_speaking: bool,
}

struct SchedulerState {
    output: Box<dyn AudioOutput>,
    next_start: Duration,
    entries: VecDeque<PlaybackQueueEntry>,
    generation: u64,
    next_id: u64,
}

/// Schedules decoded model audio gaplessly. Cloning shares the same queue.
#[derive(Clone)]
pub struct PlaybackScheduler {
    state: Arc<Mutex<SchedulerState>>,
    clock: Arc<dyn PlaybackClock>,
    sample_rate: u32,
    events_tx: mpsc::UnboundedSender<PlaybackEvent>,
}

impl PlaybackScheduler {
    /// Create a scheduler and the receiver for its completion events.
    pub fn new(
        output: Box<dyn AudioOutput>,
        clock: Arc<dyn PlaybackClock>,
        sample_rate: u32,
    ) -> (Self, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let next_start = clock.now();
        let scheduler = Self {
            state: Arc::new(Mutex::new(SchedulerState {
                output,
                next_start,
                entries: VecDeque::new(),
                generation: 0,
                next_id: 0,
            })),
            clock,
            sample_rate,
            events_tx,
        };
        (scheduler, events_rx)
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Decode a base64 PCM16 chunk and schedule it.
    ///
    /// `chunk_rate` is the payload's sample rate when it differs from the
    /// output rate.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] when the payload is not valid PCM16; the
    /// queue is left untouched.
    pub fn enqueue(&self, encoded: &str, chunk_rate: Option<u32>) -> Result<Enqueued, DecodeError> {
        let mut samples = decode_pcm16_base64(encoded)?;
        if let Some(rate) = chunk_rate
            && rate != self.sample_rate
        {
            samples = resample(&samples, rate, self.sample_rate);
        }
        if samples.is_empty() {
            return Err(DecodeError::Empty);
        }
        Ok(self.enqueue_samples(samples))
    }

    /// Schedule already-decoded samples at the output sample rate.
    pub fn enqueue_samples(&self, samples: Vec<f32>) -> Enqueued {
        let duration = frames_to_duration(samples.len() as u64, self.sample_rate);
        let now = self.clock.now();

        let mut state = self.lock();
        let started_speaking = state.entries.is_empty();
        let scheduled_start = state.next_start.max(now);
        let entry = PlaybackQueueEntry {
            id: state.next_id,
            scheduled_start,
            duration,
        };
        state.next_id += 1;
        state.next_start = scheduled_start + duration;

        let done = CompletionHandle {
            tx: self.events_tx.clone(),
            generation: state.generation,
            entry_id: entry.id,
        };
        state
            .output
            .schedule(&entry, Arc::from(samples), self.sample_rate, done);
        state.entries.push_back(entry.clone());

        debug!(
            entry_id = entry.id,
            start_ms = entry.scheduled_start.as_millis() as u64,
            duration_ms = entry.duration.as_millis() as u64,
            "scheduled playback buffer"
        );
        Enqueued {
            entry,
            started_speaking,
        }
    }

    /// Apply a completion event. Returns `true` if the queue just drained.
    ///
    /// Events from before the last [`interrupt`](Self::interrupt) are ignored.
    pub fn complete(&self, event: &PlaybackEvent) -> bool {
        let PlaybackEvent::Ended {
            generation,
            entry_id,
        } = *event;
        let mut state = self.lock();
        if generation != state.generation {
            return false;
        }
        let Some(pos) = state.entries.iter().position(|e| e.id == entry_id) else {
            return false;
        };
        state.entries.remove(pos);
        state.entries.is_empty()
    }

    /// Stop all audio immediately and reset the timeline to now.
    ///
    /// Returns the number of flushed entries.
    pub fn interrupt(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.lock();
        state.output.stop_all();
        let flushed = state.entries.len();
        state.entries.clear();
        state.generation += 1;
        state.next_start = now;
        if flushed > 0 {
            info!(flushed, "playback interrupted");
        }
        flushed
    }

    /// Whether any buffer is scheduled or playing.
    pub fn is_speaking(&self) -> bool {
        !self.lock().entries.is_empty()
    }

    /// Snapshot of live entries in schedule order.
    pub fn entries(&self) -> Vec<PlaybackQueueEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    pub fn next_start_time(&self) -> Duration {
        self.lock().next_start
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }
}

fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    let nanos = frames as u128 * 1_000_000_000 / sample_rate.max(1) as u128;
    Duration::from_nanos(nanos as u64)
}

/// Clock driven by the number of frames the output device has rendered.
pub struct DeviceClock {
    frames: Arc<AtomicU64>,
    sample_rate: u32,
}

impl PlaybackClock for DeviceClock {
    fn now(&self) -> Duration {
        frames_to_duration(self.frames.load(Ordering::Acquire), self.sample_rate)
    }
}

struct Voice {
    start_frame: u64,
    samples: Arc<[f32]>,
    done: Option<CompletionHandle>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Speaker output backed by cpal, mixing buffers at absolute frame offsets.
pub struct CpalOutput {
    voices: Arc<Mutex<Vec<Voice>>>,
    sample_rate: u32,
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
}

impl CpalOutput {
    /// Open the output device and start rendering silence.
    ///
    /// Returns the output together with the clock it drives.
    ///
    /// # Errors
    ///
    /// Returns an error if no output device is available or the stream
    /// cannot be started.
    pub fn open(config: &AudioConfig) -> Result<(Self, Arc<DeviceClock>), SessionError> {
        let voices: Arc<Mutex<Vec<Voice>>> = Arc::new(Mutex::new(Vec::new()));
        let frames = Arc::new(AtomicU64::new(0));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), SessionError>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let thread_voices = Arc::clone(&voices);
        let thread_frames = Arc::clone(&frames);
        let output_device = config.output_device.clone();
        let sample_rate = config.sample_rate_out;

        std::thread::Builder::new()
            .name("livevoice-playback".into())
            .spawn(move || {
                match build_output_stream(
                    output_device.as_deref(),
                    sample_rate,
                    thread_voices,
                    thread_frames,
                ) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        let _ = stop_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| SessionError::Audio(format!("cannot spawn playback thread: {e}")))?;

        ready_rx
            .recv()
            .map_err(|_| SessionError::Audio("playback thread exited during startup".into()))??;

        let clock = Arc::new(DeviceClock {
            frames,
            sample_rate,
        });
        Ok((
            Self {
                voices,
                sample_rate,
                stop_tx: Some(stop_tx),
            },
            clock,
        ))
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>, SessionError> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| SessionError::Audio(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}

impl AudioOutput for CpalOutput {
    fn schedule(
        &mut self,
        entry: &PlaybackQueueEntry,
        samples: Arc<[f32]>,
        sample_rate: u32,
        done: CompletionHandle,
    ) {
        if sample_rate != self.sample_rate {
            warn!(
                sample_rate,
                device_rate = self.sample_rate,
                "buffer rate differs from device rate"
            );
        }
        let start_frame =
            (entry.scheduled_start.as_secs_f64() * self.sample_rate as f64).round() as u64;
        let mut voices = self.voices.lock().unwrap_or_else(|e| e.into_inner());
        voices.push(Voice {
            start_frame,
            samples,
            done: Some(done),
        });
    }

    fn stop_all(&mut self) {
        self.voices.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn build_output_stream(
    device_name: Option<&str>,
    sample_rate: u32,
    voices: Arc<Mutex<Vec<Voice>>>,
    frames: Arc<AtomicU64>,
) -> Result<cpal::Stream, SessionError> {
    let host = cpal::default_host();

    let device = if let Some(name) = device_name {
        host.output_devices()
            .map_err(|e| SessionError::Audio(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| SessionError::Audio(format!("output device '{name}' not found")))?
    } else {
        host.default_output_device()
            .ok_or_else(|| SessionError::Audio("no default output device".into()))?
    };

    let device_label = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("using output device: {device_label}");

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                render(data, &voices, &frames);
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| SessionError::Audio(format!("failed to build output stream: {e}")))?;

    stream
        .play()
        .map_err(|e| SessionError::Audio(format!("failed to start output stream: {e}")))?;

    Ok(stream)
}

/// Mix all voices overlapping this callback's frame window.
fn render(data: &mut [f32], voices: &Mutex<Vec<Voice>>, frames: &AtomicU64) {
    let base = frames.load(Ordering::Acquire);
    let window_end = base + data.len() as u64;
    data.fill(0.0);

    let Ok(mut voices) = voices.lock() else {
        frames.store(window_end, Ordering::Release);
        return;
    };

    for voice in voices.iter() {
        let start = voice.start_frame.max(base);
        let end = voice.end_frame().min(window_end);
        for frame in start..end {
            let out_idx = (frame - base) as usize;
            let src_idx = (frame - voice.start_frame) as usize;
            data[out_idx] += voice.samples[src_idx];
        }
    }
    for sample in data.iter_mut() {
        *sample = sample.clamp(-1.0, 1.0);
    }

    let mut idx = 0;
    while idx < voices.len() {
        if voices[idx].end_frame() <= window_end {
            let mut voice = voices.swap_remove(idx);
            if let Some(done) = voice.done.take() {
                done.complete();
            }
        } else {
            idx += 1;
        }
    }
    frames.store(window_end, Ordering::Release);
}
