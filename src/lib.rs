//! Step-execution engine for driving an Android phone with a language model.
//!
//! Each step screenshots the device, asks the model for one action, decodes the
//! reply (text-markup or native tool calls), validates it against the tool
//! catalog and executes it. See [`StepLoop`] for the control loop.

pub mod catalog;
pub mod config;
pub mod device;
pub mod error;
pub mod history;
pub mod model;
pub mod parser;
pub mod prompt;
pub mod step_loop;
pub mod types;
pub mod validator;

pub use catalog::{ToolCatalog, ToolDefinition, ToolSchema};
pub use config::{AgentSettings, SessionConfig};
pub use device::{Device, DeviceClaim, ScreenSize};
pub use error::{ActionError, EngineError, ParseError, Segment, TransportError, ValidationError};
pub use history::History;
pub use model::{CompletionRequest, ContextMessage, Model, NativeCall, RawResponse, Role};
pub use parser::parse;
pub use step_loop::{CancelHandle, LoopState, StepLoop};
pub use types::{
    Action, ActionCall, ActionKind, Dialect, Locale, ParamValue, Point, StepResult,
};
pub use validator::validate;
