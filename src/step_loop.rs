//! The step controller.
//!
//! A [`StepLoop`] owns one session: its configuration, device, model, the
//! conversation context and the [`History`]. Each call to [`StepLoop::step`]
//! performs exactly one turn (observe, decide, act, record) and returns the
//! resulting [`StepResult`]. The sequence is finite and cannot be restarted once
//! the loop is finished or failed; [`StepLoop::reset`] turns it into a fresh session.
//!
//! ```text
//! Idle ──step(task)──▶ Running ──Finish──────────▶ Finished
//!                        │  ▲
//!                        │  └──resume()── AwaitingHuman ◀── TakeOver / Interact
//!                        └──budget / transport / retries / cancel──▶ Failed
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::catalog::{ToolCatalog, ToolDefinition};
use crate::config::SessionConfig;
use crate::device::Device;
use crate::error::{ActionError, EngineError, TransportError, ValidationError};
use crate::history::History;
use crate::model::{CompletionRequest, ContextMessage, Model};
use crate::types::{
    Action, ActionKind, Dialect, Locale, Point, StepResult, wait_duration,
};
use crate::{parser, prompt, validator};

/// Lets another task stop the loop between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopState {
    Idle,
    Running,
    /// Paused on TakeOver/Interact; `message` says what the human should do.
    AwaitingHuman { message: String },
    Finished { message: String },
    Failed(EngineError),
}

impl LoopState {
    pub fn name(&self) -> &'static str {
        match self {
            LoopState::Idle => "idle",
            LoopState::Running => "running",
            LoopState::AwaitingHuman { .. } => "awaiting a human",
            LoopState::Finished { .. } => "finished",
            LoopState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopState::Finished { .. } | LoopState::Failed(_))
    }

    /// Human-readable reason for paused and terminal states.
    pub fn reason(&self) -> Option<String> {
        match self {
            LoopState::AwaitingHuman { message } | LoopState::Finished { message } => {
                Some(message.clone())
            }
            LoopState::Failed(err) => Some(err.to_string()),
            LoopState::Idle | LoopState::Running => None,
        }
    }
}

/// A device operation resolved from a validated action.
#[derive(Debug, Clone, PartialEq)]
enum DeviceOp {
    Tap(Point),
    LongPress(Point),
    DoubleTap(Point),
    Swipe(Point, Point),
    Type(String),
    Launch(String),
    Back,
    Home,
    Wait(Duration),
}

impl DeviceOp {
    /// `None` for logical actions that never reach the device.
    fn from_action(action: &Action) -> Result<Option<Self>, ValidationError> {
        let op = match action.kind {
            ActionKind::Tap => DeviceOp::Tap(point(action, "element")?),
            ActionKind::LongPress => DeviceOp::LongPress(point(action, "element")?),
            ActionKind::DoubleTap => DeviceOp::DoubleTap(point(action, "element")?),
            ActionKind::Swipe => DeviceOp::Swipe(point(action, "start")?, point(action, "end")?),
            ActionKind::Type | ActionKind::TypeName => {
                DeviceOp::Type(text(action, "text")?.to_string())
            }
            ActionKind::Launch => DeviceOp::Launch(text(action, "app")?.to_string()),
            ActionKind::Back => DeviceOp::Back,
            ActionKind::Home => DeviceOp::Home,
            ActionKind::Wait => {
                let raw = text(action, "duration")?;
                let duration = wait_duration(raw).ok_or_else(|| ValidationError::InvalidParam {
                    param: "duration",
                    reason: format!("'{raw}' is not a usable wait"),
                })?;
                DeviceOp::Wait(duration)
            }
            ActionKind::Note
            | ActionKind::CallApi
            | ActionKind::TakeOver
            | ActionKind::Interact
            | ActionKind::Finish => return Ok(None),
        };
        Ok(Some(op))
    }

    async fn run<D: Device>(&self, device: &D) -> anyhow::Result<()> {
        match self {
            DeviceOp::Tap(at) => device.tap(*at).await,
            DeviceOp::LongPress(at) => device.long_press(*at).await,
            DeviceOp::DoubleTap(at) => device.double_tap(*at).await,
            DeviceOp::Swipe(from, to) => device.swipe(*from, *to).await,
            DeviceOp::Type(text) => device.type_text(text).await,
            DeviceOp::Launch(app) => device.launch_app(app).await,
            DeviceOp::Back => device.go_back().await,
            DeviceOp::Home => device.go_home().await,
            DeviceOp::Wait(duration) => device.wait(*duration).await,
        }
    }
}

fn point(action: &Action, param: &'static str) -> Result<Point, ValidationError> {
    action.point(param).ok_or(ValidationError::MissingParam {
        kind: action.kind,
        param,
    })
}

fn text<'a>(action: &'a Action, param: &'static str) -> Result<&'a str, ValidationError> {
    action.text(param).ok_or(ValidationError::MissingParam {
        kind: action.kind,
        param,
    })
}

pub struct StepLoop<D, M> {
    config: SessionConfig,
    device: D,
    model: M,
    instruction: String,
    tools: Option<Vec<ToolDefinition>>,
    context: Vec<ContextMessage>,
    history: History,
    state: LoopState,
    /// Steps counted against `max_steps`; human hand-offs are not counted.
    steps_taken: usize,
    pending_task: Option<String>,
    resume_note: Option<String>,
    cancel: CancelHandle,
}

impl<D: Device, M: Model> StepLoop<D, M> {
    pub fn new(config: SessionConfig, device: D, model: M) -> Self {
        let payload = prompt::assemble(config.locale, config.dialect);
        let instruction =
            prompt::dated(&payload, config.locale, chrono::Local::now().date_naive());
        let tools = match config.dialect {
            Dialect::Native => Some(ToolCatalog.native_tools(config.locale)),
            Dialect::TextMarkup => None,
        };

        Self {
            config,
            device,
            model,
            instruction,
            tools,
            context: Vec::new(),
            history: History::default(),
            state: LoopState::Idle,
            steps_taken: 0,
            pending_task: None,
            resume_note: None,
            cancel: CancelHandle::default(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn context(&self) -> &[ContextMessage] {
        &self.context
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Runs one turn. The first call must carry the task; later calls pass `None`.
    pub async fn step(&mut self, task: Option<&str>) -> Result<StepResult, EngineError> {
        self.check_cancelled()?;

        match (&self.state, task) {
            (LoopState::Idle, Some(task)) => {
                info!(task, "session started");
                self.pending_task = Some(task.to_string());
                self.state = LoopState::Running;
            }
            (LoopState::Idle, None) => {
                return Err(EngineError::InvalidState {
                    operation: "step without a task",
                    state: "idle",
                });
            }
            (LoopState::Running, Some(_)) => {
                warn!("session already running, ignoring new task text");
            }
            (LoopState::Running, None) => {}
            (state, _) => {
                return Err(EngineError::InvalidState {
                    operation: "step",
                    state: state.name(),
                });
            }
        }

        if self.steps_taken >= self.config.max_steps {
            return Err(self.fail(EngineError::BudgetExceeded {
                max_steps: self.config.max_steps,
            }));
        }

        let screenshot = self.observe().await?;
        let action = self.decide().await?;
        self.act(action, screenshot).await
    }

    /// Hands control back after a TakeOver/Interact pause.
    pub fn resume(&mut self, note: Option<&str>) -> Result<(), EngineError> {
        if !matches!(self.state, LoopState::AwaitingHuman { .. }) {
            return Err(EngineError::InvalidState {
                operation: "resume",
                state: self.state.name(),
            });
        }
        info!("human hand-off complete, resuming");
        self.resume_note = Some(prompt::resumed(self.config.locale, note));
        self.state = LoopState::Running;
        Ok(())
    }

    /// Fails the session if its cancel handle fired. Also honoured while
    /// awaiting a human, where `step` would otherwise refuse to run.
    pub fn check_cancelled(&mut self) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() && !self.state.is_terminal() {
            return Err(self.fail(EngineError::Cancelled));
        }
        Ok(())
    }

    /// Steps until the loop finishes, fails or waits for a human.
    pub async fn run(&mut self, task: Option<&str>) -> &LoopState {
        let mut task = task;
        while matches!(self.state, LoopState::Idle | LoopState::Running) {
            if self.step(task.take()).await.is_err() {
                break;
            }
        }
        &self.state
    }

    /// Starts a fresh session over the same collaborators.
    pub fn reset(mut self) -> Self {
        self.history.clear();
        self.context.clear();
        self.state = LoopState::Idle;
        self.steps_taken = 0;
        self.pending_task = None;
        self.resume_note = None;
        self.cancel = CancelHandle::default();
        self
    }

    fn fail(&mut self, err: EngineError) -> EngineError {
        if err.is_expected_stop() {
            warn!(reason = %err, steps = self.history.len(), "session stopped");
        } else {
            error!(reason = %err, steps = self.history.len(), "session failed");
        }
        self.state = LoopState::Failed(err.clone());
        err
    }

    /// Captures the screen and appends this turn's user message.
    async fn observe(&mut self) -> Result<Vec<u8>, EngineError> {
        let screenshot = match self.device.capture_screenshot().await {
            Ok(bytes) => bytes,
            Err(e) => return Err(self.fail(TransportError::device(e).into())),
        };
        let current_app = match self.device.current_app().await {
            Ok(app) => app,
            Err(e) => return Err(self.fail(TransportError::device(e).into())),
        };

        let locale = self.config.locale;
        let info = prompt::screen_info(current_app.as_deref());
        let mut text = match self.pending_task.take() {
            Some(task) => prompt::first_turn(locale, &task, &info),
            None => prompt::next_turn(locale, &info),
        };
        if let Some(note) = self.resume_note.take() {
            text = format!("{note}\n\n{text}");
        }

        for message in &mut self.context {
            message.screenshot = None;
        }
        self.context
            .push(ContextMessage::user(text, Some(screenshot.clone())));
        Ok(screenshot)
    }

    /// Asks the model for an action, re-prompting on malformed replies.
    async fn decide(&mut self) -> Result<Action, EngineError> {
        let dialect = self.config.dialect;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let request = CompletionRequest {
                context: &self.context,
                instruction: &self.instruction,
                dialect,
                tools: self.tools.as_deref(),
            };
            let raw = match self.model.complete(request).await {
                Ok(raw) => raw,
                Err(e) => return Err(self.fail(TransportError::model(e).into())),
            };
            debug!(?raw, "model reply");
            self.context
                .push(ContextMessage::assistant(raw.to_context_text()));

            let decoded = parser::parse(&raw, dialect)
                .map_err(ActionError::from)
                .and_then(|call| validator::validate(&call).map_err(ActionError::from));

            match decoded {
                Ok(action) => return Ok(action),
                Err(err) if attempts <= self.config.retry_budget => {
                    warn!(attempt = attempts, error = %err, "rejected model reply, asking for a correction");
                    let correction = prompt::correction(self.config.locale, dialect, &err);
                    self.context.push(ContextMessage::user(correction, None));
                }
                Err(err) => {
                    return Err(self.fail(EngineError::Action {
                        attempts,
                        source: err,
                    }));
                }
            }
        }
    }

    /// Executes the action, records the step and applies the state transition.
    async fn act(&mut self, action: Action, screenshot: Vec<u8>) -> Result<StepResult, EngineError> {
        let op = match DeviceOp::from_action(&action) {
            Ok(op) => op,
            Err(e) => {
                return Err(self.fail(EngineError::Action {
                    attempts: 1,
                    source: e.into(),
                }));
            }
        };
        if let Some(op) = &op {
            if let Err(e) = op.run(&self.device).await {
                return Err(self.fail(TransportError::device(e).into()));
            }
        }

        let message = match action.kind {
            ActionKind::Finish | ActionKind::TakeOver | ActionKind::Note => {
                action.text("message").map(str::to_string)
            }
            ActionKind::CallApi => action.text("instruction").map(str::to_string),
            ActionKind::Interact => Some(interact_message(self.config.locale, &action.thought)),
            _ => None,
        };

        let step_index = self.history.len();
        info!(step = step_index, action = %action, thought = %action.thought, "step executed");

        let finished = action.kind == ActionKind::Finish;
        let result = StepResult {
            step_index,
            thought: action.thought.clone(),
            action: Some(action.clone()),
            screenshot: Some(screenshot),
            message: message.clone(),
            finished,
        };
        self.history.push(result.clone());

        if finished {
            let message = message.unwrap_or_default();
            info!(summary = %message, "task finished");
            self.state = LoopState::Finished { message };
        } else if action.kind.needs_human() {
            let message = message.unwrap_or_default();
            info!(reason = %message, "waiting for a human");
            self.state = LoopState::AwaitingHuman { message };
        } else {
            self.steps_taken += 1;
            if self.steps_taken >= self.config.max_steps {
                self.fail(EngineError::BudgetExceeded {
                    max_steps: self.config.max_steps,
                });
            }
        }

        Ok(result)
    }
}

fn interact_message(locale: Locale, thought: &str) -> String {
    if !thought.trim().is_empty() {
        return thought.trim().to_string();
    }
    match locale {
        Locale::Cn => "有多个符合条件的选项，请选择。".to_string(),
        Locale::En => "Several options match; please choose one.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Params;

    fn action(kind: ActionKind, params: &[(&str, crate::types::ParamValue)]) -> Action {
        Action {
            kind,
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<Params>(),
            thought: String::new(),
        }
    }

    #[test]
    fn device_ops_cover_physical_kinds() {
        use crate::types::ParamValue::{Point as P, Text};
        let p = Point::new(1, 2);
        assert_eq!(
            DeviceOp::from_action(&action(ActionKind::Swipe, &[("start", P(p)), ("end", P(p))])),
            Ok(Some(DeviceOp::Swipe(p, p)))
        );
        assert_eq!(
            DeviceOp::from_action(&action(ActionKind::Wait, &[("duration", Text("1.5 seconds".into()))])),
            Ok(Some(DeviceOp::Wait(Duration::from_millis(1500))))
        );
        assert_eq!(
            DeviceOp::from_action(&action(ActionKind::TypeName, &[("text", Text("Li Lei".into()))])),
            Ok(Some(DeviceOp::Type("Li Lei".into())))
        );
        for kind in ActionKind::ALL.into_iter().filter(|k| !k.touches_device()) {
            assert_eq!(DeviceOp::from_action(&action(kind, &[])), Ok(None));
        }
    }

    #[test]
    fn interact_message_falls_back_to_default() {
        assert_eq!(interact_message(Locale::En, "  which contact?  "), "which contact?");
        assert!(interact_message(Locale::En, "").contains("choose"));
    }

    #[test]
    fn cancel_handle_is_shared() {
        let handle = CancelHandle::default();
        let clone = handle.clone();
        clone.cancel();
        assert!(handle.is_cancelled());
    }
}
