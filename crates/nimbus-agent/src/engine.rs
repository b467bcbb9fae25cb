//! Provisioning engine contract.
//!
//! The engine owns stacks and runs programs against live infrastructure.
//! nimbus only ever sets a program, synchronizes, reads outputs and state,
//! cancels, and destroys.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Result type alias for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Errors raised by the provisioning engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine binary could not be started
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// An engine command exited unsuccessfully
    #[error("`{command}` failed ({}): {stderr}", exit_label(.code))]
    Command {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Filesystem error in the engine workspace
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Engine produced JSON we could not read
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {}", c),
        None => "terminated by signal".to_string(),
    }
}

/// One stack output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputValue {
    pub value: serde_json::Value,
    #[serde(default)]
    pub secret: bool,
}

impl OutputValue {
    /// A plain (non-secret) output
    pub fn plain(value: impl Into<serde_json::Value>) -> Self {
        Self {
            value: value.into(),
            secret: false,
        }
    }

    /// Human-readable value: strings verbatim, everything else as JSON
    pub fn display_value(&self) -> String {
        match &self.value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Stack outputs by name
pub type OutputMap = BTreeMap<String, OutputValue>;

/// Which stack to select or create, and the config it needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSpec {
    pub stack_name: String,
    pub project_name: String,
    /// Config key holding the target region (e.g. `aws:region`)
    pub region_key: String,
    pub region: String,
}

impl Default for StackSpec {
    fn default() -> Self {
        Self {
            stack_name: "dev".to_string(),
            project_name: "nimbus".to_string(),
            region_key: "aws:region".to_string(),
            region: "us-west-2".to_string(),
        }
    }
}

/// What the engine reports about a stack
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackSummary {
    pub name: String,
    /// Console URL, when the backend has one
    pub url: Option<String>,
}

/// Metadata of a resource step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMetadata {
    pub op: String,
    pub urn: String,
    #[serde(rename = "type")]
    pub resource_type: String,
}

/// Payload of a diagnostic event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urn: Option<String>,
    pub message: String,
    pub severity: String,
}

/// An engine event, classified by kind once at the boundary
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A resource step is about to run
    ResourcePre(StepMetadata),
    /// A resource step finished and its outputs are known
    ResourceOutputs(StepMetadata),
    Diagnostic(DiagnosticPayload),
    Prelude,
    Summary,
    Cancel,
    /// Any other event, kept raw for logging
    Unrecognized(serde_json::Value),
}

impl EngineEvent {
    /// Decide the kind of a raw engine event.
    pub fn from_wire(raw: serde_json::Value) -> Self {
        let wire: WireEvent = match serde_json::from_value(raw.clone()) {
            Ok(w) => w,
            Err(e) => {
                tracing::debug!("Engine event does not match any known shape: {}", e);
                return EngineEvent::Unrecognized(raw);
            }
        };

        if let Some(diag) = wire.diagnostic_event {
            EngineEvent::Diagnostic(diag)
        } else if let Some(step) = wire.resource_pre_event {
            EngineEvent::ResourcePre(step.metadata)
        } else if let Some(step) = wire.res_outputs_event {
            EngineEvent::ResourceOutputs(step.metadata)
        } else if wire.prelude_event.is_some() {
            EngineEvent::Prelude
        } else if wire.summary_event.is_some() {
            EngineEvent::Summary
        } else if wire.cancel_event.is_some() {
            EngineEvent::Cancel
        } else {
            EngineEvent::Unrecognized(raw)
        }
    }

    /// Parse one line of an engine event log
    pub fn from_json_line(line: &str) -> EngineResult<Self> {
        let raw: serde_json::Value = serde_json::from_str(line)?;
        Ok(Self::from_wire(raw))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent {
    #[serde(default)]
    resource_pre_event: Option<WireStep>,
    #[serde(default)]
    res_outputs_event: Option<WireStep>,
    #[serde(default)]
    diagnostic_event: Option<DiagnosticPayload>,
    #[serde(default)]
    prelude_event: Option<serde_json::Value>,
    #[serde(default)]
    summary_event: Option<serde_json::Value>,
    #[serde(default)]
    cancel_event: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireStep {
    metadata: StepMetadata,
}

/// A stack managed by the provisioning engine.
///
/// Operations against one stack must not overlap; callers serialize them.
#[async_trait]
pub trait Stack: Send + Sync {
    /// Stack name
    fn name(&self) -> &str;

    /// Replace the program the next `up` will run
    async fn set_program(&self, program: &str) -> EngineResult<()>;

    /// Set a stack config value
    async fn set_config(&self, key: &str, value: &str) -> EngineResult<()>;

    /// Synchronize live infrastructure with the current program, reporting
    /// engine events on `events` as they happen
    async fn up(&self, events: mpsc::UnboundedSender<EngineEvent>) -> EngineResult<OutputMap>;

    /// Cancel an in-flight operation (e.g. one left by a crashed run)
    async fn cancel(&self) -> EngineResult<()>;

    /// Current stack outputs
    async fn outputs(&self) -> EngineResult<OutputMap>;

    /// Exported deployment state
    async fn export_stack(&self) -> EngineResult<serde_json::Value>;

    /// Tear down every resource in the stack
    async fn destroy(&self) -> EngineResult<()>;

    /// Summary information (name, console URL)
    async fn summary(&self) -> EngineResult<StackSummary>;
}

/// Shared handle to an engine-owned stack
pub type StackHandle = Arc<dyn Stack>;

/// Entry point into the provisioning engine
#[async_trait]
pub trait Workspace: Send + Sync {
    /// Select the stack described by `spec`, creating it if needed
    async fn create_or_select_stack(&self, spec: &StackSpec) -> EngineResult<StackHandle>;
}
