//! Conversation state: current program, pending diagnostics, verbosity.

use crate::classify::Diagnostic;

/// Program every conversation starts from
pub const INITIAL_PROGRAM: &str = "const pulumi = require('@pulumi/pulumi');";

/// Per-session conversation state
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationState {
    /// Program most recently produced by the model (deployed or attempted)
    pub program: String,
    /// Diagnostics from the last failed deployment of `program`
    pub diagnostics: Vec<Diagnostic>,
    /// Echo prompts and responses to the operator
    pub verbose: bool,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self {
            program: INITIAL_PROGRAM.to_string(),
            diagnostics: Vec::new(),
            verbose: false,
        }
    }
}

impl ConversationState {
    /// Whether the last deployment left errors to repair
    pub fn needs_repair(&self) -> bool {
        !self.diagnostics.is_empty()
    }
}
