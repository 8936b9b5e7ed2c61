//! The voice session engine.
//!
//! [`lifecycle::SessionLifecycleManager`] is the single actor that owns the
//! channel, the capture pipeline and every per-session component below.

pub mod lifecycle;
pub mod pending;
pub mod retry;
pub mod turn;
pub mod visual;

#[cfg(test)]
pub(crate) mod test_support;

pub use lifecycle::{ControlCommand, SessionContext, SessionLifecycleManager};
pub use pending::{PendingAction, PendingActionCoordinator, PendingActionKind};
pub use retry::{RetryDecision, RetryPolicy, RetryState};
pub use turn::{
    CommittedTurn, ConversationHistory, SharedHistory, ToolInvocationRecord, ToolStatus,
    TurnPhase, TurnProcessor, TurnSignal,
};
pub use visual::{FrameCapture, VisualContextStreamer};
