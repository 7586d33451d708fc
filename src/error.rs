//! Error taxonomy for the step engine.
//!
//! ```text
//! EngineError
//! ├── Parse           - model reply could not be decoded (recoverable by retry)
//! ├── Validation      - decoded call violates the tool catalog (recoverable by retry)
//! ├── Transport       - model or device collaborator failed (fatal)
//! ├── BudgetExceeded  - max_steps reached without finish
//! ├── Cancelled       - caller asked the loop to stop
//! └── InvalidState    - step/resume called in a state that does not allow it
//! ```

use std::fmt;
use thiserror::Error;

use crate::types::ActionKind;

/// Which part of a model reply is missing or repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Reasoning,
    Action,
    FunctionCall,
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Reasoning => f.write_str("<think>"),
            Segment::Action => f.write_str("<answer>"),
            Segment::FunctionCall => f.write_str("function call"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("missing {0} segment")]
    MissingSegment(Segment),
    #[error("more than one {0} segment")]
    DuplicateSegment(Segment),
    #[error("syntax error at offset {offset}: {message}")]
    SyntaxError { offset: usize, message: String },
}

impl ParseError {
    pub(crate) fn syntax(offset: usize, message: impl Into<String>) -> Self {
        ParseError::SyntaxError {
            offset,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    #[error("{kind} requires parameter '{param}'")]
    MissingParam { kind: ActionKind, param: &'static str },
    #[error("invalid coordinate '{param}': {reason}")]
    InvalidCoordinate { param: &'static str, reason: String },
    #[error("invalid parameter '{param}': {reason}")]
    InvalidParam { param: &'static str, reason: String },
}

/// Failure of an external collaborator. Never retried by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("model call failed: {0}")]
    Model(String),
    #[error("device call failed: {0}")]
    Device(String),
}

impl TransportError {
    pub fn model(err: anyhow::Error) -> Self {
        TransportError::Model(format!("{err:#}"))
    }

    pub fn device(err: anyhow::Error) -> Self {
        TransportError::Device(format!("{err:#}"))
    }
}

/// A reply that can be corrected by re-prompting the model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("model reply rejected after {attempts} attempt(s): {source}")]
    Action {
        attempts: usize,
        #[source]
        source: ActionError,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("step budget of {max_steps} exhausted before the task finished")]
    BudgetExceeded { max_steps: usize },
    #[error("cancelled by caller")]
    Cancelled,
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
}

impl EngineError {
    /// Whether this is a normal terminal outcome rather than a defect.
    pub fn is_expected_stop(&self) -> bool {
        matches!(
            self,
            EngineError::BudgetExceeded { .. } | EngineError::Cancelled
        )
    }
}
