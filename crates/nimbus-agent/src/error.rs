//! Error types for nimbus-agent

use thiserror::Error;

use crate::engine::EngineError;

/// Result type alias using nimbus-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during a session
#[derive(Error, Debug)]
pub enum Error {
    /// The model request or its stream failed
    #[error(transparent)]
    Ai(#[from] nimbus_ai::Error),

    /// The stack could not be selected, configured or baselined
    #[error("failed to initialize stack: {0}")]
    Initialization(#[source] EngineError),

    /// A direct engine operation (outputs, export, destroy) failed
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The session has no stack because auto-deploy is off
    #[error("no stack: auto-deploy is disabled for this session")]
    NotDeployed,
}
