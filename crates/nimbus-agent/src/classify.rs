//! Classification of provisioning engine events into diagnostics and
//! progress notices

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::engine::{DiagnosticPayload, EngineEvent, StepMetadata};

/// Message prefix of the engine's aggregate wrapper around diagnostics that
/// were already reported one by one
pub const AGGREGATE_ERROR_PREFIX: &str = "One or more errors occurred";

/// Step operation that changes nothing
const NO_OP: &str = "same";

/// Diagnostic severity as reported by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Severity {
    Error,
    /// Error text the engine printed on an info stream (`info#err`)
    InfoError,
    Info,
    Warning,
    Debug,
    Other(String),
}

impl Severity {
    pub fn as_str(&self) -> &str {
        match self {
            Severity::Error => "error",
            Severity::InfoError => "info#err",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Debug => "debug",
            Severity::Other(s) => s,
        }
    }

    /// Whether diagnostics of this severity fail a deployment
    pub fn is_error(&self) -> bool {
        matches!(self, Severity::Error | Severity::InfoError)
    }
}

impl From<&str> for Severity {
    fn from(s: &str) -> Self {
        match s {
            "error" => Severity::Error,
            "info#err" => Severity::InfoError,
            "info" => Severity::Info,
            "warning" => Severity::Warning,
            "debug" => Severity::Debug,
            other => Severity::Other(other.to_string()),
        }
    }
}

impl From<String> for Severity {
    fn from(s: String) -> Self {
        Severity::from(s.as_str())
    }
}

impl From<Severity> for String {
    fn from(s: Severity) -> Self {
        s.as_str().to_string()
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resource-level error collected during one deployment attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urn: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            urn: None,
        }
    }

    /// JSON rendering used in repair prompts and operator output
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.message.clone())
    }
}

impl From<DiagnosticPayload> for Diagnostic {
    fn from(payload: DiagnosticPayload) -> Self {
        Self {
            severity: Severity::from(payload.severity),
            message: payload.message,
            urn: payload.urn,
        }
    }
}

/// Whether a resource step is starting or has finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPhase {
    Started,
    Finished,
}

/// A resource step worth telling the operator about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressNotice {
    pub phase: ProgressPhase,
    pub op: String,
    pub resource_type: String,
    pub name: String,
}

impl ProgressNotice {
    fn from_step(phase: ProgressPhase, meta: &StepMetadata) -> Self {
        Self {
            phase,
            op: meta.op.clone(),
            resource_type: meta.resource_type.clone(),
            name: display_name(&meta.urn).to_string(),
        }
    }
}

impl fmt::Display for ProgressNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.phase {
            ProgressPhase::Started => {
                write!(f, "{} {} {} ...", self.op, self.resource_type, self.name)
            }
            ProgressPhase::Finished => write!(f, "{}d {}", self.op, self.name),
        }
    }
}

/// What to do with one engine event
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Ignored,
    Progress(ProgressNotice),
    Diagnostic(Diagnostic),
    Unrecognized,
}

/// Classify one engine event.
pub fn classify(event: &EngineEvent) -> Classification {
    match event {
        EngineEvent::Diagnostic(payload) => {
            let severity = Severity::from(payload.severity.as_str());
            if !severity.is_error() || payload.message.starts_with(AGGREGATE_ERROR_PREFIX) {
                Classification::Ignored
            } else {
                Classification::Diagnostic(Diagnostic::from(payload.clone()))
            }
        }
        EngineEvent::ResourcePre(meta) => step_notice(ProgressPhase::Started, meta),
        EngineEvent::ResourceOutputs(meta) => step_notice(ProgressPhase::Finished, meta),
        EngineEvent::Prelude | EngineEvent::Summary | EngineEvent::Cancel => {
            Classification::Ignored
        }
        EngineEvent::Unrecognized(_) => Classification::Unrecognized,
    }
}

fn step_notice(phase: ProgressPhase, meta: &StepMetadata) -> Classification {
    if meta.op == NO_OP {
        Classification::Ignored
    } else {
        Classification::Progress(ProgressNotice::from_step(phase, meta))
    }
}

/// Resource name from a URN of the form
/// `urn:<stack-and-project>::<project>::<type>::<name>`.
///
/// Falls back to the whole URN when it has fewer segments.
pub fn display_name(urn: &str) -> &str {
    urn.split("::").nth(3).unwrap_or(urn)
}
