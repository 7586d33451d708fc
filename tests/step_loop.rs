use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use phone_pilot::{
    ActionKind, CompletionRequest, Device, Dialect, EngineError, Locale, LoopState, Model,
    NativeCall, RawResponse, Role, SessionConfig, StepLoop, TransportError,
};

#[derive(Default)]
struct ScriptedDevice {
    ops: Mutex<Vec<String>>,
    fail_taps: bool,
}

impl ScriptedDevice {
    fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    fn log(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl Device for ScriptedDevice {
    async fn capture_screenshot(&self) -> anyhow::Result<Vec<u8>> {
        Ok(vec![0x89, b'P', b'N', b'G'])
    }
    async fn tap(&self, at: phone_pilot::Point) -> anyhow::Result<()> {
        if self.fail_taps {
            anyhow::bail!("adb: device offline");
        }
        self.log(format!("tap {at}"));
        Ok(())
    }
    async fn long_press(&self, at: phone_pilot::Point) -> anyhow::Result<()> {
        self.log(format!("long_press {at}"));
        Ok(())
    }
    async fn double_tap(&self, at: phone_pilot::Point) -> anyhow::Result<()> {
        self.log(format!("double_tap {at}"));
        Ok(())
    }
    async fn swipe(&self, from: phone_pilot::Point, to: phone_pilot::Point) -> anyhow::Result<()> {
        self.log(format!("swipe {from} {to}"));
        Ok(())
    }
    async fn type_text(&self, text: &str) -> anyhow::Result<()> {
        self.log(format!("type {text}"));
        Ok(())
    }
    async fn launch_app(&self, name: &str) -> anyhow::Result<()> {
        self.log(format!("launch {name}"));
        Ok(())
    }
    async fn go_back(&self) -> anyhow::Result<()> {
        self.log("back".into());
        Ok(())
    }
    async fn go_home(&self) -> anyhow::Result<()> {
        self.log("home".into());
        Ok(())
    }
    async fn wait(&self, duration: Duration) -> anyhow::Result<()> {
        self.log(format!("wait {}ms", duration.as_millis()));
        Ok(())
    }
}

/// Replays queued replies, then repeats `fallback` forever.
struct ScriptedModel {
    replies: Mutex<VecDeque<RawResponse>>,
    fallback: Option<RawResponse>,
    calls: Mutex<usize>,
    last_context: Mutex<Vec<(Role, String, bool)>>,
}

impl ScriptedModel {
    fn new(replies: Vec<RawResponse>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: None,
            calls: Mutex::new(0),
            last_context: Mutex::new(Vec::new()),
        }
    }

    fn forever(reply: RawResponse) -> Self {
        Self {
            fallback: Some(reply),
            ..Self::new(Vec::new())
        }
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl Model for ScriptedModel {
    async fn complete(&self, request: CompletionRequest<'_>) -> anyhow::Result<RawResponse> {
        *self.calls.lock().unwrap() += 1;
        *self.last_context.lock().unwrap() = request
            .context
            .iter()
            .map(|m| (m.role, m.text.clone(), m.screenshot.is_some()))
            .collect();
        if let Some(reply) = self.replies.lock().unwrap().pop_front() {
            return Ok(reply);
        }
        self.fallback
            .clone()
            .ok_or_else(|| anyhow::anyhow!("script exhausted"))
    }
}

fn markup(answer: &str) -> RawResponse {
    RawResponse::Text(format!("<think>looking at the screen</think>\n<answer>{answer}</answer>"))
}

fn config(max_steps: usize) -> SessionConfig {
    SessionConfig {
        locale: Locale::En,
        dialect: Dialect::TextMarkup,
        max_steps,
        retry_budget: 1,
        device_id: None,
    }
}

#[tokio::test]
async fn finish_on_first_turn() {
    let model = ScriptedModel::new(vec![markup(r#"finish(message="Nothing to do.")"#)]);
    let mut agent = StepLoop::new(config(10), ScriptedDevice::default(), model);

    let state = agent.run(Some("check the weather")).await.clone();

    assert_eq!(
        state,
        LoopState::Finished {
            message: "Nothing to do.".into()
        }
    );
    assert_eq!(agent.history().len(), 1);
    let step = agent.history().last().unwrap();
    assert!(step.finished);
    assert_eq!(step.message.as_deref(), Some("Nothing to do."));
    assert_eq!(step.thought, "looking at the screen");
    assert!(step.screenshot.is_some());
    assert!(agent.device().ops().is_empty());
}

#[tokio::test]
async fn budget_exhaustion_fails_after_max_steps() {
    let model = ScriptedModel::forever(markup(r#"do(action="Back", thought="go back")"#));
    let mut agent = StepLoop::new(config(3), ScriptedDevice::default(), model);

    let state = agent.run(Some("loop forever")).await.clone();

    assert_eq!(state, LoopState::Failed(EngineError::BudgetExceeded { max_steps: 3 }));
    assert_eq!(agent.history().len(), 3);
    assert_eq!(agent.device().ops(), vec!["back", "back", "back"]);
    assert_eq!(agent.model().calls(), 3);
    assert!(state.reason().unwrap().contains("budget of 3"));
}

#[tokio::test]
async fn two_malformed_replies_fail_the_turn() {
    let model = ScriptedModel::new(vec![
        RawResponse::Text("I would tap the button".into()),
        markup(r#"do(action="Tap", element=[1,2]))"#),
        markup(r#"finish(message="unreachable")"#),
    ]);
    let mut agent = StepLoop::new(config(10), ScriptedDevice::default(), model);

    let err = agent.step(Some("tap the button")).await.unwrap_err();

    assert!(matches!(err, EngineError::Action { attempts: 2, .. }), "{err:?}");
    assert!(matches!(agent.state(), LoopState::Failed(_)));
    assert!(agent.history().is_empty());
    assert_eq!(agent.model().calls(), 2);

    let again = agent.step(None).await.unwrap_err();
    assert_eq!(
        again,
        EngineError::InvalidState {
            operation: "step",
            state: "failed"
        }
    );
}

#[tokio::test]
async fn one_malformed_reply_is_corrected() {
    let model = ScriptedModel::new(vec![
        markup(r#"do(action="Tap", element=[100,200]"#),
        markup(r#"do(action="Tap", element=[100,200], thought="retry")"#),
    ]);
    let mut agent = StepLoop::new(config(10), ScriptedDevice::default(), model);

    let step = agent.step(Some("tap")).await.unwrap();

    assert_eq!(step.action.unwrap().kind, ActionKind::Tap);
    assert_eq!(agent.device().ops(), vec!["tap [100,200]"]);
    let context = agent.model().last_context.lock().unwrap().clone();
    let (role, correction, _) = context.last().unwrap();
    assert_eq!(*role, Role::User);
    assert!(correction.contains("previous response was invalid"));
    assert!(correction.contains("syntax error"));
}

#[tokio::test]
async fn unknown_action_is_never_executed() {
    let model = ScriptedModel::forever(markup(r#"do(action="Frobnicate", thought="x")"#));
    let mut agent = StepLoop::new(config(10), ScriptedDevice::default(), model);

    let err = agent.step(Some("do something")).await.unwrap_err();

    let EngineError::Action { source, .. } = &err else {
        panic!("expected action error, got {err:?}");
    };
    assert!(source.to_string().contains("unknown action 'Frobnicate'"));
    assert!(agent.device().ops().is_empty());
}

#[tokio::test]
async fn take_over_pauses_without_consuming_budget() {
    let model = ScriptedModel::new(vec![
        markup(r#"do(action="Tap", element=[500,500])"#),
        markup(r#"do(action="Take_over", message="Please log in")"#),
        markup(r#"finish(message="Logged in and done")"#),
    ]);
    let mut agent = StepLoop::new(config(2), ScriptedDevice::default(), model);

    let state = agent.run(Some("open my account")).await.clone();
    assert_eq!(
        state,
        LoopState::AwaitingHuman {
            message: "Please log in".into()
        }
    );
    assert!(agent.step(None).await.is_err());

    agent.resume(Some("entered the password")).unwrap();
    let state = agent.run(None).await.clone();

    assert_eq!(
        state,
        LoopState::Finished {
            message: "Logged in and done".into()
        }
    );
    assert_eq!(agent.history().len(), 3);
    let context = agent.model().last_context.lock().unwrap().clone();
    let (_, last_user, _) = context.iter().rev().find(|(r, _, _)| *r == Role::User).unwrap();
    assert!(last_user.contains("entered the password"));
}

#[tokio::test]
async fn interact_uses_thought_as_message() {
    let model = ScriptedModel::new(vec![markup(
        r#"do(action="Interact", thought="Two contacts named Wang, which one?")"#,
    )]);
    let mut agent = StepLoop::new(config(5), ScriptedDevice::default(), model);

    let step = agent.step(Some("call Wang")).await.unwrap();

    assert_eq!(step.message.as_deref(), Some("Two contacts named Wang, which one?"));
    assert!(matches!(agent.state(), LoopState::AwaitingHuman { .. }));
}

#[tokio::test]
async fn device_failure_is_fatal() {
    let device = ScriptedDevice {
        fail_taps: true,
        ..ScriptedDevice::default()
    };
    let model = ScriptedModel::forever(markup(r#"do(action="Tap", element=[1,1])"#));
    let mut agent = StepLoop::new(config(5), device, model);

    let err = agent.step(Some("tap")).await.unwrap_err();

    assert_eq!(
        err,
        EngineError::Transport(TransportError::Device("adb: device offline".into()))
    );
    assert_eq!(agent.model().calls(), 1);
}

#[tokio::test]
async fn model_failure_is_not_retried() {
    let model = ScriptedModel::new(Vec::new());
    let mut agent = StepLoop::new(config(5), ScriptedDevice::default(), model);

    let err = agent.step(Some("anything")).await.unwrap_err();

    assert!(matches!(err, EngineError::Transport(TransportError::Model(_))));
    assert_eq!(agent.model().calls(), 1);
}

#[tokio::test]
async fn cancellation_between_steps() {
    let model = ScriptedModel::forever(markup(r#"do(action="Home")"#));
    let mut agent = StepLoop::new(config(10), ScriptedDevice::default(), model);
    let cancel = agent.cancel_handle();

    agent.step(Some("go home")).await.unwrap();
    cancel.cancel();
    let err = agent.step(None).await.unwrap_err();

    assert_eq!(err, EngineError::Cancelled);
    assert_eq!(agent.state(), &LoopState::Failed(EngineError::Cancelled));
    assert_eq!(agent.history().len(), 1);
}

#[tokio::test]
async fn zero_step_budget_touches_nothing() {
    let model = ScriptedModel::forever(markup(r#"do(action="Back")"#));
    let mut agent = StepLoop::new(config(0), ScriptedDevice::default(), model);

    let err = agent.step(Some("go back")).await.unwrap_err();

    assert_eq!(err, EngineError::BudgetExceeded { max_steps: 0 });
    assert_eq!(agent.state(), &LoopState::Failed(EngineError::BudgetExceeded { max_steps: 0 }));
    assert!(agent.device().ops().is_empty());
    assert_eq!(agent.model().calls(), 0);
    assert!(agent.history().is_empty());
}

#[tokio::test]
async fn cancel_while_awaiting_a_human() {
    let model = ScriptedModel::forever(markup(r#"do(action="Take_over", message="Scan your face")"#));
    let mut agent = StepLoop::new(config(5), ScriptedDevice::default(), model);
    let cancel = agent.cancel_handle();

    let state = agent.run(Some("pay the bill")).await.clone();
    assert!(matches!(state, LoopState::AwaitingHuman { .. }));
    assert_eq!(agent.check_cancelled(), Ok(()));

    cancel.cancel();

    assert_eq!(agent.check_cancelled(), Err(EngineError::Cancelled));
    assert_eq!(agent.state(), &LoopState::Failed(EngineError::Cancelled));
    assert!(agent.resume(None).is_err());
    assert_eq!(agent.check_cancelled(), Ok(()));
}

#[tokio::test]
async fn paused_step_reports_cancellation() {
    let model = ScriptedModel::forever(markup(r#"do(action="Take_over", message="Log in")"#));
    let mut agent = StepLoop::new(config(5), ScriptedDevice::default(), model);

    agent.step(Some("open the bank app")).await.unwrap();
    agent.cancel_handle().cancel();

    assert_eq!(agent.step(None).await.unwrap_err(), EngineError::Cancelled);
    assert_eq!(agent.state(), &LoopState::Failed(EngineError::Cancelled));
}

#[tokio::test]
async fn oversized_wait_is_corrected_not_executed() {
    let model = ScriptedModel::new(vec![
        markup(r#"do(action="Wait", duration="100000000000000000000 seconds")"#),
        markup(r#"finish(message="Gave up waiting")"#),
    ]);
    let mut agent = StepLoop::new(config(5), ScriptedDevice::default(), model);

    let state = agent.run(Some("wait for the download")).await.clone();

    assert_eq!(
        state,
        LoopState::Finished {
            message: "Gave up waiting".into()
        }
    );
    assert!(agent.device().ops().is_empty());
    assert_eq!(agent.model().calls(), 2);
    let context = agent.model().last_context.lock().unwrap().clone();
    let (_, correction, _) = context.last().unwrap();
    assert!(correction.contains("duration"));
}

#[tokio::test]
async fn task_is_folded_in_once_and_old_screenshots_dropped() {
    let model = ScriptedModel::forever(markup(r#"do(action="Wait", duration="1 seconds")"#));
    let mut agent = StepLoop::new(config(5), ScriptedDevice::default(), model);

    agent.step(Some("find the settings page")).await.unwrap();
    agent.step(Some("ignored second task")).await.unwrap();

    let context = agent.model().last_context.lock().unwrap().clone();
    let users: Vec<_> = context.iter().filter(|(r, _, _)| *r == Role::User).collect();
    assert_eq!(users.len(), 2);
    assert!(users[0].1.contains("Task: find the settings page"));
    assert!(!users[1].1.contains("Task:"));
    assert!(!context.iter().any(|(_, text, _)| text.contains("ignored second task")));
    assert!(!users[0].2);
    assert!(users[1].2);
    assert_eq!(agent.device().ops(), vec!["wait 1000ms", "wait 1000ms"]);
}

#[tokio::test]
async fn idle_step_requires_task() {
    let model = ScriptedModel::new(Vec::new());
    let mut agent = StepLoop::new(config(5), ScriptedDevice::default(), model);

    assert!(matches!(
        agent.step(None).await,
        Err(EngineError::InvalidState { .. })
    ));
    assert_eq!(agent.state(), &LoopState::Idle);
    assert!(agent.resume(None).is_err());
}

#[tokio::test]
async fn native_dialect_drives_the_same_loop() {
    let model = ScriptedModel::new(vec![
        RawResponse::Call(NativeCall {
            name: "Swipe".into(),
            arguments: serde_json::json!({"start": [500, 800], "end": [500, 200], "thought": "scroll"}),
            reasoning: None,
        }),
        RawResponse::Call(NativeCall {
            name: "finish".into(),
            arguments: serde_json::json!({"message": "found it", "thought": "done"}),
            reasoning: None,
        }),
    ]);
    let session = SessionConfig {
        dialect: Dialect::Native,
        ..config(5)
    };
    let mut agent = StepLoop::new(session, ScriptedDevice::default(), model);

    let state = agent.run(Some("scroll to the end")).await.clone();

    assert!(matches!(state, LoopState::Finished { .. }));
    assert_eq!(agent.device().ops(), vec!["swipe [500,800] [500,200]"]);
    assert!(!agent.instruction().contains("<answer>"));
}

#[tokio::test]
async fn reset_gives_a_fresh_session() {
    let model = ScriptedModel::forever(markup(r#"finish(message="ok")"#));
    let mut agent = StepLoop::new(config(5), ScriptedDevice::default(), model);
    agent.run(Some("first")).await;
    assert!(agent.state().is_terminal());

    let mut agent = agent.reset();
    assert_eq!(agent.state(), &LoopState::Idle);
    assert!(agent.history().is_empty());
    assert!(agent.context().is_empty());

    agent.run(Some("second")).await;
    assert_eq!(agent.history().len(), 1);
}
