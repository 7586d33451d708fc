use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);
const TITLE: &str = "Phone Pilot";
const TAG: &str = "phone-pilot";

/// Progress notifications through a `termux-notification` compatible program.
/// One notification id is reused, so each message replaces the previous one.
#[derive(Debug, Clone)]
pub struct Notifier {
    program: String,
}

impl Notifier {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn args(content: &str) -> [&str; 8] {
        [
            "--title", TITLE, "--content", content, "--id", TAG, "--group", TAG,
        ]
    }

    /// Best effort: failures are logged and never reach the session.
    pub async fn send(&self, content: &str) {
        let mut cmd = Command::new(&self.program);
        cmd.args(Self::args(content)).kill_on_drop(true);

        match tokio::time::timeout(NOTIFY_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) if output.status.success() => debug!(content, "notification sent"),
            Ok(Ok(output)) => warn!(
                program = %self.program,
                status = %output.status,
                "notification command failed"
            ),
            Ok(Err(e)) => warn!(program = %self.program, error = %e, "could not run notifier"),
            Err(_) => warn!(program = %self.program, "notifier timed out"),
        }
    }
}

/// Sends through `notifier` when one is configured.
pub async fn notify(notifier: Option<&Notifier>, content: &str) {
    if let Some(notifier) = notifier {
        notifier.send(content).await;
    }
}
