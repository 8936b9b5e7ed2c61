//! Per-turn accumulation of transcripts and tool calls.
//!
//! [`TurnProcessor`] is the state machine that turns the inbound event
//! stream into committed conversation turns:
//!
//! ```text
//! Idle --(transcript | tool call)--> Accumulating --(turn_complete)--> Finalizing --> Idle
//! ```
//!
//! A turn that completes while tool calls are still running stays in
//! `Finalizing` until every result has been sent back over the channel, so
//! the commit always follows its turn's tool results. Events that arrive in
//! the meantime are queued and replayed after the commit. Model audio is
//! scheduled immediately in every phase.

use crate::channel::messages::{InboundEvent, OutboundMessage, ToolCall, ToolOutcome};
use crate::config::TurnConfig;
use crate::runtime::RuntimeEvent;
use crate::session::lifecycle::SessionContext;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Longest tool output forwarded to the UI.
const TOOL_OUTPUT_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Accumulating,
    /// Turn complete, waiting for outstanding tool results.
    Finalizing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Pending,
    Success,
    Error,
}

/// One tool call issued during a turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInvocationRecord {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
    pub status: ToolStatus,
}

/// Scratch state of the turn in progress.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnAccumulator {
    pub turn_id: u64,
    pub input_transcript: String,
    pub output_transcript: String,
    pub tool_invocations: Vec<ToolInvocationRecord>,
}

impl TurnAccumulator {
    fn new(turn_id: u64) -> Self {
        Self {
            turn_id,
            input_transcript: String::new(),
            output_transcript: String::new(),
            tool_invocations: Vec::new(),
        }
    }
}

/// A finished turn as written to conversation history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommittedTurn {
    pub turn_id: u64,
    pub input_transcript: String,
    pub output_transcript: String,
    pub tool_invocations: Vec<ToolInvocationRecord>,
    /// The turn was cut short by a barge-in or a lost channel.
    pub interrupted: bool,
    pub committed_at: DateTime<Utc>,
}

/// Destination for committed turns.
pub trait ConversationHistory: Send {
    /// A new turn started; create a placeholder if useful.
    fn begin_turn(&mut self, _turn_id: u64) {}

    fn commit_turn(&mut self, turn: CommittedTurn);

    /// A tool call resolved after its turn was committed.
    fn update_tool_status(&mut self, _turn_id: u64, _call_id: &str, _status: ToolStatus) {}
}

/// In-memory history that can be shared with the UI.
#[derive(Debug, Clone, Default)]
pub struct SharedHistory {
    turns: Arc<Mutex<Vec<CommittedTurn>>>,
}

impl SharedHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all committed turns, oldest first.
    pub fn turns(&self) -> Vec<CommittedTurn> {
        self.turns.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.turns.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ConversationHistory for SharedHistory {
    fn commit_turn(&mut self, turn: CommittedTurn) {
        self.turns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(turn);
    }

    fn update_tool_status(&mut self, turn_id: u64, call_id: &str, status: ToolStatus) {
        let mut turns = self.turns.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = turns
            .iter_mut()
            .rev()
            .find(|t| t.turn_id == turn_id)
            .and_then(|t| t.tool_invocations.iter_mut().find(|r| r.id == call_id))
        {
            record.status = status;
        }
    }
}

/// Turn boundaries reported to the lifecycle manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnSignal {
    Started { turn_id: u64 },
    /// The turn was committed. `None` when the model completed a turn that
    /// produced no transcript or tool call.
    Ended { turn_id: Option<u64> },
}

/// A tool invocation that has resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCompletion {
    /// Channel the request arrived on.
    pub connection_id: Option<String>,
    pub call_id: String,
    pub name: String,
    pub outcome: ToolOutcome,
}

/// Drives the per-turn state machine.
#[derive(Debug)]
pub struct TurnProcessor {
    phase: TurnPhase,
    current: Option<TurnAccumulator>,
    next_turn_id: u64,
    /// Call id -> turn that issued it.
    outstanding: HashMap<String, u64>,
    /// Calls whose channel was retired; no longer block quiescence.
    orphaned: HashMap<String, u64>,
    deferred: VecDeque<InboundEvent>,
    flush_interval: Duration,
    flush_deadline: Option<Instant>,
}

impl TurnProcessor {
    pub fn new(config: &TurnConfig) -> Self {
        Self {
            phase: TurnPhase::Idle,
            current: None,
            next_turn_id: 0,
            outstanding: HashMap::new(),
            orphaned: HashMap::new(),
            deferred: VecDeque::new(),
            flush_interval: Duration::from_millis(config.transcript_flush_interval_ms),
            flush_deadline: None,
        }
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    pub fn current(&self) -> Option<&TurnAccumulator> {
        self.current.as_ref()
    }

    /// A turn is accumulating or finalizing.
    pub fn in_progress(&self) -> bool {
        self.phase != TurnPhase::Idle
    }

    /// A turn is in progress or a tool call is still running.
    pub fn is_busy(&self) -> bool {
        self.in_progress() || !self.outstanding.is_empty()
    }

    pub fn outstanding_tools(&self) -> usize {
        self.outstanding.len()
    }

    /// When the throttled transcript update is due.
    pub fn flush_deadline(&self) -> Option<Instant> {
        self.flush_deadline
    }

    /// Process one validated inbound event.
    pub fn handle_event(
        &mut self,
        event: InboundEvent,
        ctx: &mut SessionContext,
    ) -> Vec<TurnSignal> {
        let mut signals = Vec::new();
        self.dispatch(event, ctx, &mut signals);
        signals
    }

    fn dispatch(
        &mut self,
        event: InboundEvent,
        ctx: &mut SessionContext,
        signals: &mut Vec<TurnSignal>,
    ) {
        match event {
            InboundEvent::AudioChunk { data, sample_rate } => {
                match ctx.playback.enqueue(&data, sample_rate) {
                    Ok(enqueued) => {
                        if enqueued.started_speaking {
                            ctx.emit(RuntimeEvent::AssistantSpeaking { active: true });
                        }
                    }
                    Err(e) => warn!(error = %e, "skipping undecodable audio chunk"),
                }
            }
            InboundEvent::Interrupted => self.interrupt_with(ctx, signals),
            InboundEvent::FatalError { message } => {
                warn!(%message, "fatal_error reached the turn processor; ignoring");
            }
            other if self.phase == TurnPhase::Finalizing => {
                debug!(kind = other.kind(), "deferring event until the turn commits");
                self.deferred.push_back(other);
            }
            InboundEvent::PartialInputTranscript { text } => {
                self.ensure_turn(ctx, signals);
                if let Some(acc) = &mut self.current {
                    acc.input_transcript.push_str(&text);
                }
                self.schedule_flush();
            }
            InboundEvent::PartialOutputTranscript { text } => {
                self.ensure_turn(ctx, signals);
                if let Some(acc) = &mut self.current {
                    acc.output_transcript.push_str(&text);
                }
                self.schedule_flush();
            }
            InboundEvent::ToolCallRequest { calls } => {
                let turn_id = self.ensure_turn(ctx, signals);
                for call in calls {
                    self.start_tool(turn_id, call, ctx);
                }
            }
            InboundEvent::TurnComplete => self.complete_turn(ctx, signals),
        }
    }

    fn ensure_turn(&mut self, ctx: &mut SessionContext, signals: &mut Vec<TurnSignal>) -> u64 {
        if let Some(acc) = &self.current {
            return acc.turn_id;
        }
        self.next_turn_id += 1;
        let turn_id = self.next_turn_id;
        self.current = Some(TurnAccumulator::new(turn_id));
        self.phase = TurnPhase::Accumulating;
        ctx.history_mut().begin_turn(turn_id);
        ctx.emit(RuntimeEvent::TurnStarted { turn_id });
        signals.push(TurnSignal::Started { turn_id });
        info!(turn_id, "turn started");
        turn_id
    }

    fn start_tool(&mut self, turn_id: u64, call: ToolCall, ctx: &SessionContext) {
        if self.outstanding.contains_key(&call.id) {
            warn!(call_id = %call.id, "duplicate tool call id ignored");
            return;
        }
        if let Some(acc) = &mut self.current {
            acc.tool_invocations.push(ToolInvocationRecord {
                id: call.id.clone(),
                name: call.name.clone(),
                args: call.args.clone(),
                status: ToolStatus::Pending,
            });
        }
        self.outstanding.insert(call.id.clone(), turn_id);
        info!(turn_id, call_id = %call.id, tool_name = %call.name, "tool call started");
        ctx.emit(RuntimeEvent::ToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
            input_json: call.args.to_string(),
        });
        ctx.dispatch_tool(call);
    }

    fn complete_turn(&mut self, ctx: &mut SessionContext, signals: &mut Vec<TurnSignal>) {
        let Some(acc) = &self.current else {
            debug!("turn_complete with no turn in progress");
            signals.push(TurnSignal::Ended { turn_id: None });
            return;
        };
        let turn_id = acc.turn_id;
        let waiting = self.outstanding_for(turn_id);
        if waiting > 0 {
            self.phase = TurnPhase::Finalizing;
            info!(turn_id, waiting, "turn finalizing, waiting for tool results");
            return;
        }
        self.commit(false, ctx, signals);
    }

    /// Report a resolved tool call back to the model and update its record.
    ///
    /// The result is sent only if the channel it was requested on is still
    /// the live one.
    pub fn on_tool_completed(
        &mut self,
        completion: ToolCompletion,
        ctx: &mut SessionContext,
    ) -> Vec<TurnSignal> {
        let mut signals = Vec::new();
        let owner = self
            .outstanding
            .remove(&completion.call_id)
            .or_else(|| self.orphaned.remove(&completion.call_id));
        let success = completion.outcome.is_success();

        let same_channel = ctx.connection_id().is_some()
            && ctx.connection_id() == completion.connection_id.as_deref();
        if same_channel {
            ctx.send(OutboundMessage::ToolResult {
                id: completion.call_id.clone(),
                outcome: completion.outcome.clone(),
            });
        } else {
            warn!(
                call_id = %completion.call_id,
                "tool result dropped: its channel was retired"
            );
        }

        ctx.emit(RuntimeEvent::ToolResult {
            id: completion.call_id.clone(),
            name: completion.name.clone(),
            success,
            output_text: preview(&completion.outcome),
        });

        let status = if success {
            ToolStatus::Success
        } else {
            ToolStatus::Error
        };
        let record = self
            .current
            .as_mut()
            .filter(|acc| owner == Some(acc.turn_id))
            .and_then(|acc| {
                acc.tool_invocations
                    .iter_mut()
                    .find(|r| r.id == completion.call_id)
            });
        match (record, owner) {
            (Some(record), _) => record.status = status,
            // Its turn was already committed by a barge-in or a lost channel.
            (None, Some(turn_id)) => {
                ctx.history_mut()
                    .update_tool_status(turn_id, &completion.call_id, status);
            }
            (None, None) => {}
        }

        let ready = self.phase == TurnPhase::Finalizing
            && self
                .current
                .as_ref()
                .is_some_and(|acc| self.outstanding_for(acc.turn_id) == 0);
        if ready {
            self.commit(false, ctx, &mut signals);
        }
        signals
    }

    /// Barge-in: flush playback now and commit whatever the turn holds.
    pub fn interrupt(&mut self, ctx: &mut SessionContext) -> Vec<TurnSignal> {
        let mut signals = Vec::new();
        self.interrupt_with(ctx, &mut signals);
        signals
    }

    fn interrupt_with(&mut self, ctx: &mut SessionContext, signals: &mut Vec<TurnSignal>) {
        if ctx.playback.interrupt() > 0 {
            ctx.emit(RuntimeEvent::AssistantSpeaking { active: false });
        }
        if self.current.is_some() {
            self.commit(true, ctx, signals);
        }
    }

    /// The channel is gone: commit the partial turn and forget its queue.
    ///
    /// Tool calls still running can no longer be answered on this channel.
    pub fn abandon(&mut self, ctx: &mut SessionContext) -> Vec<TurnSignal> {
        let mut signals = Vec::new();
        self.deferred.clear();
        self.orphaned.extend(self.outstanding.drain());
        if self.current.is_some() {
            self.commit(true, ctx, &mut signals);
        }
        self.phase = TurnPhase::Idle;
        self.flush_deadline = None;
        signals
    }

    /// Push the throttled transcript update to the UI.
    pub fn flush_ui(&mut self, ctx: &SessionContext) {
        self.flush_deadline = None;
        if let Some(acc) = &self.current {
            ctx.emit(RuntimeEvent::TranscriptUpdate {
                turn_id: acc.turn_id,
                input: acc.input_transcript.clone(),
                output: acc.output_transcript.clone(),
            });
        }
    }

    fn schedule_flush(&mut self) {
        if self.flush_deadline.is_none() {
            self.flush_deadline = Some(Instant::now() + self.flush_interval);
        }
    }

    fn outstanding_for(&self, turn_id: u64) -> usize {
        self.outstanding.values().filter(|t| **t == turn_id).count()
    }

    fn commit(
        &mut self,
        interrupted: bool,
        ctx: &mut SessionContext,
        signals: &mut Vec<TurnSignal>,
    ) {
        // The commit carries the final transcript; the throttled update is moot.
        self.flush_deadline = None;
        let Some(acc) = self.current.take() else {
            return;
        };
        self.phase = TurnPhase::Idle;

        let turn = CommittedTurn {
            turn_id: acc.turn_id,
            input_transcript: acc.input_transcript,
            output_transcript: acc.output_transcript,
            tool_invocations: acc.tool_invocations,
            interrupted,
            committed_at: Utc::now(),
        };
        info!(
            turn_id = turn.turn_id,
            tools = turn.tool_invocations.len(),
            interrupted,
            "turn committed"
        );
        let committed = RuntimeEvent::TurnCommitted {
            turn_id: turn.turn_id,
            input: turn.input_transcript.clone(),
            output: turn.output_transcript.clone(),
            interrupted,
        };
        let turn_id = turn.turn_id;
        ctx.history_mut().commit_turn(turn);
        ctx.emit(committed);
        signals.push(TurnSignal::Ended {
            turn_id: Some(turn_id),
        });

        while self.phase != TurnPhase::Finalizing {
            let Some(event) = self.deferred.pop_front() else {
                break;
            };
            self.dispatch(event, ctx, signals);
        }
    }
}

fn preview(outcome: &ToolOutcome) -> Option<String> {
    let text = match outcome {
        ToolOutcome::Result(serde_json::Value::Null) => return None,
        ToolOutcome::Result(serde_json::Value::String(s)) => s.clone(),
        ToolOutcome::Result(value) => value.to_string(),
        ToolOutcome::Error(message) => message.clone(),
    };
    if text.chars().count() > TOOL_OUTPUT_PREVIEW_CHARS {
        let cut: String = text.chars().take(TOOL_OUTPUT_PREVIEW_CHARS).collect();
        Some(format!("{cut}…"))
    } else {
        Some(text)
    }
}
