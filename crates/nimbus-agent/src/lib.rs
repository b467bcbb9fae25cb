//! nimbus-agent: the instruction → program → deployment loop
//!
//! This crate turns operator instructions into Pulumi programs with an LLM,
//! deploys them through a provisioning engine, and feeds deployment
//! diagnostics back into the next prompt.

pub mod classify;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod events;
pub mod extract;
pub mod orchestrator;
pub mod prompt;
pub mod pulumi;
pub mod session;

pub use classify::{Diagnostic, ProgressNotice, Severity};
pub use conversation::ConversationState;
pub use engine::{
    EngineError, EngineEvent, OutputMap, OutputValue, Stack, StackHandle, StackSpec,
    StackSummary, Workspace,
};
pub use error::{Error, Result};
pub use events::{SessionEvent, TurnPhase};
pub use extract::{ProgramResponse, extract_code_block};
pub use orchestrator::{Deployer, DeploymentFailure, DeploymentResult};
pub use prompt::PromptTarget;
pub use pulumi::PulumiWorkspace;
pub use session::{FIX_ERRORS_INSTRUCTION, Session, SessionConfig, TurnOutcome, TurnResult};
