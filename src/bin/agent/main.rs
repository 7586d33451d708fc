mod brain;
mod face;
mod hands;
mod notify;

use anyhow::{Result, bail};
use clap::Parser;
use dotenvy::dotenv;
use face::{AgentEvent, Panel, Ui, UiCommand};
use notify::{Notifier, notify};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use phone_pilot::{AgentSettings, Dialect, Locale, LoopState, StepLoop, StepResult};

type Agent = StepLoop<hands::AdbDevice, brain::Brain>;

/// Drive an Android phone with a vision language model.
#[derive(Parser, Debug)]
#[command(name = "agent", version)]
struct Cli {
    /// Run this task in the terminal and exit instead of serving the web UI.
    #[arg(long)]
    task: Option<String>,

    /// ADB serial of the phone. Defaults to the first attached device.
    #[arg(long, env = "ANDROID_SERIAL")]
    device_id: Option<String>,

    /// Prompt language: cn or en.
    #[arg(long)]
    lang: Option<Locale>,

    /// How the model answers: text-markup or native.
    #[arg(long)]
    dialect: Option<Dialect>,

    #[arg(long)]
    max_steps: Option<usize>,

    /// Correction re-prompts allowed per step.
    #[arg(long)]
    retry_budget: Option<usize>,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long, env = "OPENAI_BASE_URL")]
    base_url: Option<String>,

    #[arg(long, env = "MODEL_NAME")]
    model: Option<String>,

    /// Settings file. Defaults to ui_config.json in the user config directory.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Write the effective settings back to the settings file.
    #[arg(long)]
    save: bool,

    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Notification program called on each step, e.g. termux-notification.
    #[arg(long, env = "PHONE_PILOT_NOTIFY")]
    notify: Option<String>,
}

impl Cli {
    fn apply(&self, settings: &mut AgentSettings) {
        if let Some(v) = &self.device_id {
            settings.device_id = v.clone();
        }
        if let Some(v) = self.lang {
            settings.lang = v;
        }
        if let Some(v) = self.dialect {
            settings.dialect = v;
        }
        if let Some(v) = self.max_steps {
            settings.max_steps = v;
        }
        if let Some(v) = self.retry_budget {
            settings.retry_budget = v;
        }
        if let Some(v) = &self.api_key {
            settings.api_key = v.clone();
        }
        if let Some(v) = &self.base_url {
            settings.base_url = v.clone();
        }
        if let Some(v) = &self.model {
            settings.model_name = v.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let path = cli.settings.clone().unwrap_or_else(AgentSettings::default_path);
    let mut settings = AgentSettings::load(&path)?;
    cli.apply(&mut settings);
    if cli.save {
        settings.save(&path)?;
        info!(path = %path.display(), "settings saved");
    }

    let config = settings.session_config();
    let brain = brain::Brain::new(&settings)?;
    let device = hands::AdbDevice::connect(config.device_id.as_deref()).await?;
    info!(
        serial = device.serial(),
        model = %settings.model_name,
        dialect = ?config.dialect,
        "agent ready"
    );
    let agent = StepLoop::new(config, device, brain);
    let notifier = cli.notify.as_deref().map(Notifier::new);

    match &cli.task {
        Some(task) => run_headless(agent, task, notifier.as_ref()).await,
        None => {
            let ui = face::start_server(cli.port).await?;
            serve(agent, ui, notifier.as_ref()).await;
            Ok(())
        }
    }
}

/// Runs one task in the terminal. Hand-offs wait for Enter on stdin.
async fn run_headless(mut agent: Agent, task: &str, notifier: Option<&Notifier>) -> Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut task = Some(task);

    loop {
        match agent.run(task.take()).await.clone() {
            LoopState::AwaitingHuman { message } => {
                notify(notifier, &format!("Your turn: {message}")).await;
                println!("\n>>> {message}");
                println!(">>> Do it on the phone, then press Enter (optionally type a note).");
                let note = stdin.next_line().await?.unwrap_or_default();
                let note = note.trim();
                agent.resume((!note.is_empty()).then_some(note))?;
            }
            LoopState::Finished { message } => {
                for step in agent.history().iter() {
                    print_step(step);
                }
                println!("\nDone: {message}");
                notify(notifier, &format!("Done: {message}")).await;
                return Ok(());
            }
            LoopState::Failed(err) => {
                notify(notifier, &format!("Stopped: {err}")).await;
                bail!("task stopped after {} steps: {err}", agent.history().len())
            }
            LoopState::Idle | LoopState::Running => bail!("agent loop returned while still active"),
        }
    }
}

fn print_step(step: &StepResult) {
    let action = step
        .action
        .as_ref()
        .map(|a| a.to_string())
        .unwrap_or_default();
    println!("[{}] {action}  // {}", step.step_index + 1, step.thought);
}

/// Serves commands from the web page until the server goes away.
async fn serve(mut agent: Agent, mut ui: Ui, notifier: Option<&Notifier>) {
    let _ = ui.events.send(AgentEvent::Ready);

    while let Some(command) = ui.commands.recv().await {
        let task = match command {
            UiCommand::Run(task) => task,
            UiCommand::Resume(_) => {
                warn!("resume requested with no task waiting");
                continue;
            }
            UiCommand::Cancel => {
                debug!("cancel arrived after the task ended");
                continue;
            }
        };

        info!(task, "received command");
        agent = agent.reset();
        {
            let mut panel = ui.panel.lock().await;
            panel.steps.clear();
            panel.cancel = Some(agent.cancel_handle());
        }
        let _ = ui.events.send(AgentEvent::Started { task: task.clone() });

        run_task(&mut agent, &task, &mut ui, notifier).await;

        ui.panel.lock().await.cancel = None;
        let _ = ui.events.send(AgentEvent::Ready);
    }
}

async fn run_task(agent: &mut Agent, task: &str, ui: &mut Ui, notifier: Option<&Notifier>) {
    let mut task = Some(task);

    loop {
        match agent.state().clone() {
            LoopState::Idle | LoopState::Running => {
                let _ = ui.events.send(AgentEvent::Thinking);
                match agent.step(task.take()).await {
                    Ok(step) => {
                        let action = step
                            .action
                            .as_ref()
                            .map(|a| a.to_string())
                            .unwrap_or_default();
                        let number = step.step_index + 1;
                        notify(notifier, &format!("Step {number}: {action}")).await;
                        let _ = ui.events.send(AgentEvent::Step {
                            number,
                            action,
                            thought: step.thought.clone(),
                            message: step.message.clone(),
                        });
                        record(&ui.panel, agent.state(), Some(step)).await;
                    }
                    Err(err) => {
                        error!(error = %err, "step failed");
                        record(&ui.panel, agent.state(), None).await;
                    }
                }
            }
            LoopState::AwaitingHuman { message } => {
                notify(notifier, &format!("Your turn: {message}")).await;
                let _ = ui.events.send(AgentEvent::AwaitingHuman { message });
                let connected = wait_for_human(agent, ui).await;
                record(&ui.panel, agent.state(), None).await;
                if !connected {
                    return;
                }
            }
            LoopState::Finished { message } => {
                notify(notifier, &format!("Done: {message}")).await;
                let _ = ui.events.send(AgentEvent::TaskComplete { summary: message });
                return;
            }
            LoopState::Failed(err) => {
                let message = err.to_string();
                notify(notifier, &format!("Stopped: {message}")).await;
                let _ = ui.events.send(AgentEvent::TaskError { message });
                return;
            }
        }
    }
}

/// Blocks a paused session until the page resumes or cancels it.
/// Returns false once the page's command channel is gone.
async fn wait_for_human(agent: &mut Agent, ui: &mut Ui) -> bool {
    while let Some(command) = ui.commands.recv().await {
        if agent.check_cancelled().is_err() {
            return true;
        }
        match command {
            UiCommand::Resume(note) => {
                if let Err(err) = agent.resume(note.as_deref()) {
                    warn!(error = %err, "resume rejected");
                }
                return true;
            }
            UiCommand::Run(other) => {
                warn!(task = other, "busy with a hand-off, ignoring new task");
            }
            UiCommand::Cancel => warn!("cancel requested without a raised cancel flag"),
        }
    }
    false
}

async fn record(panel: &Arc<Mutex<Panel>>, state: &LoopState, step: Option<StepResult>) {
    let mut panel = panel.lock().await;
    panel.state = state.name().to_string();
    panel.reason = state.reason();
    if let Some(step) = step {
        if step.screenshot.is_some() {
            panel.screenshot = step.screenshot.clone();
        }
        panel.steps.push(step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_saved_settings() {
        let cli = Cli::parse_from([
            "agent",
            "--lang",
            "en",
            "--dialect",
            "native",
            "--max-steps",
            "40",
            "--device-id",
            "emulator-5554",
        ]);
        let mut settings = AgentSettings {
            model_name: "saved-model".into(),
            ..AgentSettings::default()
        };
        cli.apply(&mut settings);
        assert_eq!(settings.lang, Locale::En);
        assert_eq!(settings.dialect, Dialect::Native);
        assert_eq!(settings.max_steps, 40);
        assert_eq!(settings.device_id, "emulator-5554");
        assert_eq!(settings.session_config().device_id.as_deref(), Some("emulator-5554"));
    }

    #[test]
    fn notifier_program_from_flag() {
        let cli = Cli::parse_from(["agent", "--notify", "termux-notification"]);
        assert_eq!(cli.notify.as_deref(), Some("termux-notification"));
    }

    #[test]
    fn rejects_unknown_dialect() {
        assert!(Cli::try_parse_from(["agent", "--dialect", "xml"]).is_err());
    }
}
