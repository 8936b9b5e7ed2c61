//! Shared fakes for the session unit tests.

use crate::audio::playback::{
    AudioOutput, CompletionHandle, PlaybackClock, PlaybackQueueEntry, PlaybackScheduler,
};
use crate::channel::ChannelHandle;
use crate::channel::messages::OutboundMessage;
use crate::config::SessionConfig;
use crate::runtime::RuntimeEvent;
use crate::session::lifecycle::SessionContext;
use crate::session::turn::{SharedHistory, ToolCompletion};
use crate::tools::EmptyToolRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Output that accepts buffers and never finishes them.
pub(crate) struct SilentOutput;

impl AudioOutput for SilentOutput {
    fn schedule(
        &mut self,
        _entry: &PlaybackQueueEntry,
        _samples: Arc<[f32]>,
        _sample_rate: u32,
        _done: CompletionHandle,
    ) {
    }

    fn stop_all(&mut self) {}
}

/// Clock frozen at zero.
pub(crate) struct FrozenClock;

impl PlaybackClock for FrozenClock {
    fn now(&self) -> Duration {
        Duration::ZERO
    }
}

pub(crate) struct Harness {
    pub ctx: SessionContext,
    pub history: SharedHistory,
    pub outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    pub events: broadcast::Receiver<RuntimeEvent>,
    pub _tool_rx: mpsc::UnboundedReceiver<ToolCompletion>,
    _inbound_tx: mpsc::UnboundedSender<crate::channel::InboundFrame>,
}

impl Harness {
    /// Everything sent on the channel so far.
    pub fn sent(&mut self) -> Vec<OutboundMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = self.outbound.try_recv() {
            out.push(msg);
        }
        out
    }

    pub fn drain_events(&mut self) -> Vec<RuntimeEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = self.events.try_recv() {
            out.push(ev);
        }
        out
    }
}

/// A context with a live fake channel, silent playback and no tools.
pub(crate) fn harness() -> Harness {
    let config = SessionConfig::default();
    let (playback, _playback_rx) = PlaybackScheduler::new(
        Box::new(SilentOutput),
        Arc::new(FrozenClock),
        config.audio.sample_rate_out,
    );
    let history = SharedHistory::new();
    let (events_tx, events) = broadcast::channel(256);
    let (mut ctx, tool_rx) = SessionContext::new(
        config,
        playback,
        Box::new(history.clone()),
        Arc::new(EmptyToolRegistry),
        events_tx,
    );

    let (outbound_tx, outbound) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    ctx.attach(ChannelHandle::new(
        outbound_tx,
        inbound_rx,
        CancellationToken::new(),
    ));

    Harness {
        ctx,
        history,
        outbound,
        events,
        _tool_rx: tool_rx,
        _inbound_tx: inbound_tx,
    }
}
