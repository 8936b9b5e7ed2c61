//! Periodic still-frame streaming into the live session.
//!
//! While enabled, the streamer grabs a frame from [`FrameCapture`] every
//! `visual_stream_interval_ms`, downsamples it to a square JPEG and sends it
//! as a supplementary `video_frame`. A hard expiry disables streaming after
//! `visual_stream_max_duration_ms` whether or not anyone calls `disable`.
//!
//! Timers are plain deadlines polled by the session actor through
//! [`VisualContextStreamer::wait`], so disabling is just clearing them.

use crate::channel::messages::OutboundMessage;
use crate::config::VisualConfig;
use crate::error::SessionError;
use crate::runtime::RuntimeEvent;
use crate::session::lifecycle::SessionContext;
use async_trait::async_trait;
use base64::Engine as _;
use image::DynamicImage;
use image::imageops::FilterType;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Source of still images (screen, camera, canvas).
#[async_trait]
pub trait FrameCapture: Send + Sync {
    /// Grab the current frame.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Capture`] if no frame is available.
    async fn grab(&self) -> Result<DynamicImage, SessionError>;
}

/// Which visual deadline fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisualTimer {
    Tick,
    Expired,
}

/// An encoded frame (or failure) coming back from a grab task.
#[derive(Debug)]
pub struct GrabResult {
    generation: u64,
    result: Result<Vec<u8>, SessionError>,
}

/// Most recent JPEG sent to the model, for UI previews.
pub type LastFrame = Option<Arc<[u8]>>;

pub struct VisualContextStreamer {
    capture: Option<Arc<dyn FrameCapture>>,
    config: VisualConfig,
    enabled: bool,
    next_tick: Option<Instant>,
    expires_at: Option<Instant>,
    in_flight: bool,
    /// Bumped on disable so late grab results are discarded.
    generation: u64,
    results_tx: mpsc::UnboundedSender<GrabResult>,
    last_frame: watch::Sender<LastFrame>,
}

impl VisualContextStreamer {
    pub fn new(
        capture: Option<Arc<dyn FrameCapture>>,
        config: VisualConfig,
    ) -> (Self, mpsc::UnboundedReceiver<GrabResult>) {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (last_frame, _) = watch::channel(None);
        (
            Self {
                capture,
                config,
                enabled: false,
                next_tick: None,
                expires_at: None,
                in_flight: false,
                generation: 0,
                results_tx,
                last_frame,
            },
            results_rx,
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn subscribe_frames(&self) -> watch::Receiver<LastFrame> {
        self.last_frame.subscribe()
    }

    /// Start streaming. Returns `false` (and does nothing) when no session
    /// is active or no frame source is configured.
    pub fn enable(&mut self, session_active: bool) -> bool {
        if !session_active {
            warn!("enable_video ignored: no active session");
            return false;
        }
        if self.capture.is_none() {
            warn!("enable_video ignored: no frame capture configured");
            return false;
        }
        if self.enabled {
            return true;
        }
        let now = Instant::now();
        self.enabled = true;
        self.next_tick = Some(now);
        self.expires_at =
            Some(now + Duration::from_millis(self.config.visual_stream_max_duration_ms));
        info!(
            interval_ms = self.config.visual_stream_interval_ms,
            max_duration_ms = self.config.visual_stream_max_duration_ms,
            "visual streaming enabled"
        );
        true
    }

    /// Stop streaming, clear both timers and the last frame.
    pub fn disable(&mut self) {
        let was_enabled = self.enabled;
        self.enabled = false;
        self.next_tick = None;
        self.expires_at = None;
        self.in_flight = false;
        self.generation += 1;
        self.last_frame.send_replace(None);
        if was_enabled {
            info!("visual streaming disabled");
        }
    }

    /// Earliest pending deadline. Expiry wins a tie.
    pub fn next_deadline(&self) -> Option<(Instant, VisualTimer)> {
        match (self.next_tick, self.expires_at) {
            (Some(tick), Some(exp)) if tick < exp => Some((tick, VisualTimer::Tick)),
            (_, Some(exp)) => Some((exp, VisualTimer::Expired)),
            (Some(tick), None) => Some((tick, VisualTimer::Tick)),
            (None, None) => None,
        }
    }

    /// Resolve when the next deadline fires; pending forever when disabled.
    pub async fn wait(&self) -> VisualTimer {
        match self.next_deadline() {
            Some((at, which)) => {
                tokio::time::sleep_until(at).await;
                which
            }
            None => std::future::pending().await,
        }
    }

    /// React to a fired deadline.
    pub fn on_timer(&mut self, timer: VisualTimer) {
        match timer {
            VisualTimer::Expired => {
                info!("visual streaming reached its maximum duration");
                self.disable();
            }
            VisualTimer::Tick => {
                self.next_tick = Some(
                    Instant::now() + Duration::from_millis(self.config.visual_stream_interval_ms),
                );
                if self.in_flight {
                    debug!("previous frame grab still running, skipping tick");
                    return;
                }
                self.spawn_grab();
            }
        }
    }

    fn spawn_grab(&mut self) {
        let Some(capture) = self.capture.clone() else {
            return;
        };
        self.in_flight = true;
        let generation = self.generation;
        let size = self.config.frame_size;
        let quality = self.config.jpeg_quality;
        let tx = self.results_tx.clone();
        tokio::spawn(async move {
            let result = match capture.grab().await {
                Ok(image) => tokio::task::spawn_blocking(move || {
                    downsample_frame(&image, size, quality)
                })
                .await
                .unwrap_or_else(|e| {
                    Err(SessionError::Capture(format!("encoder task failed: {e}")))
                }),
                Err(e) => Err(e),
            };
            let _ = tx.send(GrabResult { generation, result });
        });
    }

    /// Forward a finished grab to the session. Stale results are dropped.
    pub fn on_result(&mut self, grab: GrabResult, ctx: &SessionContext) {
        if grab.generation != self.generation || !self.enabled {
            debug!("discarding frame from a disabled stream");
            return;
        }
        self.in_flight = false;
        match grab.result {
            Ok(jpeg) => {
                let bytes = jpeg.len();
                let data = base64::engine::general_purpose::STANDARD.encode(&jpeg);
                if ctx.send(OutboundMessage::VideoFrame {
                    mime_type: "image/jpeg".to_owned(),
                    data,
                }) {
                    self.last_frame.send_replace(Some(Arc::from(jpeg)));
                    ctx.emit(RuntimeEvent::VideoFrameCaptured { bytes });
                } else {
                    debug!("no live channel for video frame");
                }
            }
            Err(e) => warn!(error = %e, "frame capture failed"),
        }
    }
}

/// Crop to a centered square of `size` pixels and encode as JPEG.
///
/// # Errors
///
/// Returns [`SessionError::Capture`] if encoding fails.
pub fn downsample_frame(
    image: &DynamicImage,
    size: u32,
    quality: u8,
) -> Result<Vec<u8>, SessionError> {
    use image::ImageEncoder;

    let size = size.max(1);
    let rgb = image.resize_to_fill(size, size, FilterType::Triangle).to_rgb8();
    let mut buf = Vec::new();
    let encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    encoder
        .write_image(
            rgb.as_raw(),
            rgb.width(),
            rgb.height(),
            image::ExtendedColorType::Rgb8,
        )
        .map_err(|e| SessionError::Capture(format!("JPEG encode: {e}")))?;
    Ok(buf)
}
