use anyhow::{Context, Result};
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use phone_pilot::{CancelHandle, StepResult};

/// Events streamed to the browser via SSE.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum AgentEvent {
    Started {
        task: String,
    },
    Thinking,
    Step {
        number: usize,
        action: String,
        thought: String,
        message: Option<String>,
    },
    AwaitingHuman {
        message: String,
    },
    TaskComplete {
        summary: String,
    },
    TaskError {
        message: String,
    },
    Ready,
}

impl AgentEvent {
    fn name(&self) -> &'static str {
        match self {
            AgentEvent::Started { .. } => "started",
            AgentEvent::Thinking => "thinking",
            AgentEvent::Step { .. } => "step",
            AgentEvent::AwaitingHuman { .. } => "awaiting_human",
            AgentEvent::TaskComplete { .. } => "task_complete",
            AgentEvent::TaskError { .. } => "task_error",
            AgentEvent::Ready => "ready",
        }
    }

    fn to_sse_event(&self) -> Event {
        let data = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        Event::default().event(self.name()).data(data)
    }
}

/// Requests the web page sends to the agent loop.
#[derive(Debug, Clone, PartialEq)]
pub enum UiCommand {
    Run(String),
    Resume(Option<String>),
    /// Sent after the cancel flag is raised so a paused session wakes up to see it.
    Cancel,
}

/// What the page can read back at any time. Updated by the agent loop after every step.
#[derive(Debug, Default)]
pub struct Panel {
    pub state: String,
    pub reason: Option<String>,
    pub steps: Vec<StepResult>,
    pub screenshot: Option<Vec<u8>>,
    pub cancel: Option<CancelHandle>,
}

#[derive(Serialize)]
struct PanelView<'a> {
    state: &'a str,
    reason: Option<&'a str>,
    steps: &'a [StepResult],
}

#[derive(Clone)]
struct AppState {
    cmd_tx: mpsc::Sender<UiCommand>,
    event_tx: broadcast::Sender<AgentEvent>,
    panel: Arc<Mutex<Panel>>,
}

/// Handles the agent loop uses to talk to the page.
pub struct Ui {
    pub commands: mpsc::Receiver<UiCommand>,
    pub events: broadcast::Sender<AgentEvent>,
    pub panel: Arc<Mutex<Panel>>,
}

#[derive(Deserialize)]
struct CommandPayload {
    command: String,
}

#[derive(Deserialize, Default)]
struct ResumePayload {
    note: Option<String>,
}

/// Serves the control page on the first free port starting at `port`.
pub async fn start_server(port: u16) -> Result<Ui> {
    let (cmd_tx, commands) = mpsc::channel::<UiCommand>(4);
    let (events, _) = broadcast::channel::<AgentEvent>(64);
    let panel = Arc::new(Mutex::new(Panel {
        state: "idle".to_string(),
        ..Panel::default()
    }));

    let state = AppState {
        cmd_tx,
        event_tx: events.clone(),
        panel: panel.clone(),
    };

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/command", post(command_handler))
        .route("/resume", post(resume_handler))
        .route("/cancel", post(cancel_handler))
        .route("/state", get(state_handler))
        .route("/screenshot.png", get(screenshot_handler))
        .route("/events", get(sse_handler))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .with_state(state);

    let mut bound = None;
    for p in port..port.saturating_add(10) {
        match tokio::net::TcpListener::bind(("127.0.0.1", p)).await {
            Ok(l) => {
                bound = Some((l, p));
                break;
            }
            Err(e) => debug!(port = p, error = %e, "port busy"),
        }
    }
    let (listener, port) = bound.with_context(|| {
        format!("could not bind any port in {port}..{}", port.saturating_add(10))
    })?;

    info!("web UI running at http://localhost:{port}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "web server stopped");
        }
    });

    Ok(Ui {
        commands,
        events,
        panel,
    })
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn command_handler(
    State(state): State<AppState>,
    Json(payload): Json<CommandPayload>,
) -> StatusCode {
    let command = payload.command.trim().to_string();
    if command.is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    info!(command, "POST /command");
    match state.cmd_tx.send(UiCommand::Run(command)).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn resume_handler(
    State(state): State<AppState>,
    payload: Option<Json<ResumePayload>>,
) -> StatusCode {
    let note = payload.map(|Json(p)| p).unwrap_or_default().note;
    info!(?note, "POST /resume");
    match state.cmd_tx.send(UiCommand::Resume(note)).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn cancel_handler(State(state): State<AppState>) -> StatusCode {
    {
        let panel = state.panel.lock().await;
        let Some(handle) = &panel.cancel else {
            return StatusCode::CONFLICT;
        };
        info!("POST /cancel");
        handle.cancel();
    }
    if let Err(e) = state.cmd_tx.try_send(UiCommand::Cancel) {
        debug!(error = %e, "cancel wake-up not queued");
    }
    StatusCode::ACCEPTED
}

async fn state_handler(State(state): State<AppState>) -> Response {
    let panel = state.panel.lock().await;
    Json(PanelView {
        state: &panel.state,
        reason: panel.reason.as_deref(),
        steps: &panel.steps,
    })
    .into_response()
}

async fn screenshot_handler(State(state): State<AppState>) -> Response {
    let panel = state.panel.lock().await;
    match &panel.screenshot {
        Some(png) => ([(header::CONTENT_TYPE, "image/png")], png.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_tx.subscribe();
    let stream =
        BroadcastStream::new(rx).filter_map(|result: Result<AgentEvent, _>| match result {
            Ok(event) => Some(Ok::<_, Infallible>(event.to_sse_event())),
            Err(_) => None,
        });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Phone Pilot</title>
<style>
  * { margin: 0; padding: 0; box-sizing: border-box; }
  body { background: #0b0d12; color: #dde; font-family: system-ui, sans-serif; height: 100vh; display: flex; flex-direction: column; }
  header { padding: 18px 28px; border-bottom: 1px solid #1c2030; display: flex; align-items: center; gap: 12px; }
  header h1 { font-size: 18px; font-weight: 600; }
  #state { font-size: 13px; color: #8a8fa8; }
  .dot { width: 8px; height: 8px; border-radius: 50%; background: #22c55e; }
  .dot.busy { background: #f59e0b; }
  .dot.paused { background: #a855f7; }
  .main { flex: 1; display: flex; gap: 20px; padding: 20px 28px; overflow: hidden; }
  .phone { width: 300px; display: flex; align-items: flex-start; justify-content: center; }
  .phone img { max-width: 100%; max-height: calc(100vh - 120px); border-radius: 16px; border: 1px solid #1c2030; }
  .side { flex: 1; display: flex; flex-direction: column; gap: 12px; min-width: 0; }
  #log { flex: 1; overflow-y: auto; display: flex; flex-direction: column; gap: 6px; }
  .entry { padding: 8px 12px; border-radius: 6px; font-size: 14px; line-height: 1.45; background: #12151e; border-left: 3px solid #3b82f6; }
  .entry.user { border-color: #6366f1; }
  .entry.think { border-color: #f59e0b; color: #fcd34d; }
  .entry.human { border-color: #a855f7; color: #e9d5ff; }
  .entry.error { border-color: #ef4444; color: #fca5a5; }
  .entry.done { border-color: #22c55e; color: #86efac; }
  .entry code { font-family: ui-monospace, monospace; font-size: 13px; }
  .entry .thought { display: block; color: #8a8fa8; font-size: 13px; }
  .controls { display: flex; gap: 8px; }
  input { flex: 1; background: #12151e; border: 1px solid #23283a; border-radius: 6px; padding: 10px 14px; color: #fff; font-size: 15px; }
  button { background: #6366f1; color: #fff; border: none; border-radius: 6px; padding: 10px 18px; font-weight: 600; cursor: pointer; }
  button.secondary { background: #23283a; }
  button:disabled { opacity: 0.4; cursor: not-allowed; }
</style>
</head>
<body>
  <header>
    <div class="dot" id="dot"></div>
    <h1>Phone Pilot</h1>
    <span id="state">idle</span>
  </header>
  <div class="main">
    <div class="phone"><img id="screen" alt=""></div>
    <div class="side">
      <div id="log"></div>
      <div class="controls">
        <input id="cmd" placeholder="What should the phone do?" autofocus>
        <button id="send">Run</button>
        <button id="resume" class="secondary" disabled>Resume</button>
        <button id="cancel" class="secondary" disabled>Cancel</button>
      </div>
    </div>
  </div>
<script>
  const $ = id => document.getElementById(id);
  const esc = s => String(s ?? '').replace(/&/g, '&amp;').replace(/</g, '&lt;');

  function add(cls, html) {
    const div = document.createElement('div');
    div.className = 'entry ' + cls;
    div.innerHTML = html;
    $('log').appendChild(div);
    $('log').scrollTop = $('log').scrollHeight;
  }

  function mode(m) {
    $('state').textContent = m;
    $('dot').className = 'dot' + (m === 'running' ? ' busy' : m === 'awaiting a human' ? ' paused' : '');
    $('cmd').disabled = $('send').disabled = m === 'running' || m === 'awaiting a human';
    $('resume').disabled = m !== 'awaiting a human';
    $('cancel').disabled = m !== 'running' && m !== 'awaiting a human';
  }

  function refreshScreen() { $('screen').src = '/screenshot.png?t=' + Date.now(); }

  async function post(path, body) {
    await fetch(path, { method: 'POST', headers: {'Content-Type': 'application/json'}, body: JSON.stringify(body ?? {}) });
  }

  $('send').onclick = async () => {
    const text = $('cmd').value.trim();
    if (!text) return;
    $('cmd').value = '';
    add('user', '<strong>You:</strong> ' + esc(text));
    mode('running');
    await post('/command', { command: text });
  };
  $('cmd').addEventListener('keydown', e => { if (e.key === 'Enter') $('send').onclick(); });
  $('resume').onclick = async () => {
    const note = $('cmd').value.trim();
    $('cmd').value = '';
    mode('running');
    await post('/resume', note ? { note } : {});
  };
  $('cancel').onclick = () => post('/cancel');

  const es = new EventSource('/events');
  const on = (name, fn) => es.addEventListener(name, e => fn(JSON.parse(e.data)));
  on('started', d => mode('running'));
  on('thinking', () => add('think', 'Thinking...'));
  on('step', d => {
    add('', '<strong>Step ' + d.number + '</strong> <code>' + esc(d.action) + '</code>'
      + (d.thought ? '<span class="thought">' + esc(d.thought) + '</span>' : '')
      + (d.message ? '<span class="thought">' + esc(d.message) + '</span>' : ''));
    refreshScreen();
  });
  on('awaiting_human', d => { add('human', '<strong>Your turn:</strong> ' + esc(d.message)); mode('awaiting a human'); });
  on('task_complete', d => { add('done', '<strong>Done:</strong> ' + esc(d.summary)); mode('finished'); });
  on('task_error', d => { add('error', '<strong>Stopped:</strong> ' + esc(d.message)); mode('failed'); });
  on('ready', () => { if ($('state').textContent === 'running') mode('idle'); });

  fetch('/state').then(r => r.json()).then(s => { mode(s.state); if (s.steps.length) refreshScreen(); });
</script>
</body>
</html>
"##;
