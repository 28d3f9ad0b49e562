//! Crate-wide error taxonomy.
//!
//! Module errors (`RuntimeError`, `ActionError`, `RelayError`, `SettingsError`)
//! fold into `OperatorError` so callers at the HTTP/WebSocket edge can decide
//! how each kind is surfaced: capability and tool failures are downgraded to
//! records, runtime failures end a turn, connection faults end a session.

use thiserror::Error;

use crate::computer::ActionError;
use crate::relay::RelayError;
use crate::runtime::RuntimeError;
use crate::settings::SettingsError;

#[derive(Error, Debug)]
pub enum OperatorError {
    #[error("{0} not configured")]
    ConfigurationMissing(&'static str),
    #[error("Runtime invocation failed: {0}")]
    RuntimeInvocationFailed(String),
    #[error("Tool '{tool}' failed: {message}")]
    ToolInvocationFailed { tool: String, message: String },
    #[error("Action budget exceeded ({limit} actions per run)")]
    ActionBudgetExceeded { limit: u32 },
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<RuntimeError> for OperatorError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::NoApiKey => Self::ConfigurationMissing("OPENAI_API_KEY"),
            other => Self::RuntimeInvocationFailed(other.to_string()),
        }
    }
}

impl From<ActionError> for OperatorError {
    fn from(e: ActionError) -> Self {
        match e {
            ActionError::BudgetExceeded { limit } => Self::ActionBudgetExceeded { limit },
            other => Self::ToolInvocationFailed {
                tool: "computer".to_string(),
                message: other.to_string(),
            },
        }
    }
}

impl From<RelayError> for OperatorError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::TurnInFlight | RelayError::EmptyTask => Self::InvalidState(e.to_string()),
            RelayError::SessionClosed => Self::ConnectionLost(e.to_string()),
        }
    }
}

impl From<SettingsError> for OperatorError {
    fn from(e: SettingsError) -> Self {
        Self::InvalidState(e.to_string())
    }
}
