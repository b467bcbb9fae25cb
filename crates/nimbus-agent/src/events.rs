//! Session event types

use crate::classify::{Diagnostic, ProgressNotice};

/// Where a turn currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Generating,
    Extracting,
    Deploying,
    Succeeded,
    Failed,
}

/// Events emitted while a session works on a turn
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The turn moved to a new phase
    Phase(TurnPhase),

    /// A completion delta arrived
    Token(String),

    /// A resource step started or finished
    Progress(ProgressNotice),

    /// A deployment diagnostic was collected
    Diagnostic(Diagnostic),

    /// Verbose-mode echo (prompts, responses)
    Log(String),
}
