use serde::Serialize;

use crate::types::StepResult;

/// Append-only record of a session's steps, in execution order.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct History {
    steps: Vec<StepResult>,
}

impl History {
    pub(crate) fn push(&mut self, step: StepResult) {
        self.steps.push(step);
    }

    pub(crate) fn clear(&mut self) {
        self.steps.clear();
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepResult> {
        self.steps.iter()
    }

    pub fn last(&self) -> Option<&StepResult> {
        self.steps.last()
    }

    pub fn as_slice(&self) -> &[StepResult] {
        &self.steps
    }

    /// Most recent screenshot, for front-ends that show the live screen.
    pub fn latest_screenshot(&self) -> Option<&[u8]> {
        self.steps
            .iter()
            .rev()
            .find_map(|s| s.screenshot.as_deref())
    }
}
