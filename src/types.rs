use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Side length of the normalized coordinate grid. Valid components are `0..GRID_SIZE`.
pub const GRID_SIZE: i64 = 1000;

pub const DEFAULT_MAX_STEPS: usize = 15;
pub const DEFAULT_RETRY_BUDGET: usize = 1;

/// Longest pause a single `Wait` may request.
pub const MAX_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    #[default]
    Cn,
    En,
}

impl std::str::FromStr for Locale {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cn" | "zh" => Ok(Locale::Cn),
            "en" => Ok(Locale::En),
            other => Err(format!("unknown locale '{other}' (expected cn or en)")),
        }
    }
}

/// The wire convention the model uses to express its next action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Dialect {
    /// Structured function calls with the tool catalog passed as schema data.
    Native,
    /// Free text with `<think>` and `<answer>` segments holding pseudo-code.
    #[default]
    TextMarkup,
}

impl std::str::FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" | "gemini" => Ok(Dialect::Native),
            "text-markup" | "text" | "openai" => Ok(Dialect::TextMarkup),
            other => Err(format!(
                "unknown dialect '{other}' (expected native or text-markup)"
            )),
        }
    }
}

/// Every action the model may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ActionKind {
    Tap,
    Launch,
    Type,
    TypeName,
    Interact,
    Swipe,
    Note,
    CallApi,
    LongPress,
    DoubleTap,
    TakeOver,
    Back,
    Home,
    Wait,
    Finish,
}

impl ActionKind {
    pub const ALL: [ActionKind; 15] = [
        ActionKind::Tap,
        ActionKind::Launch,
        ActionKind::Type,
        ActionKind::TypeName,
        ActionKind::Interact,
        ActionKind::Swipe,
        ActionKind::Note,
        ActionKind::CallApi,
        ActionKind::LongPress,
        ActionKind::DoubleTap,
        ActionKind::TakeOver,
        ActionKind::Back,
        ActionKind::Home,
        ActionKind::Wait,
        ActionKind::Finish,
    ];

    /// The name models use for this kind in both dialects.
    pub fn wire_name(self) -> &'static str {
        match self {
            ActionKind::Tap => "Tap",
            ActionKind::Launch => "Launch",
            ActionKind::Type => "Type",
            ActionKind::TypeName => "Type_Name",
            ActionKind::Interact => "Interact",
            ActionKind::Swipe => "Swipe",
            ActionKind::Note => "Note",
            ActionKind::CallApi => "Call_API",
            ActionKind::LongPress => "Long_Press",
            ActionKind::DoubleTap => "Double_Tap",
            ActionKind::TakeOver => "Take_over",
            ActionKind::Back => "Back",
            ActionKind::Home => "Home",
            ActionKind::Wait => "Wait",
            ActionKind::Finish => "finish",
        }
    }

    /// Case-sensitive lookup. Spaces and underscores are interchangeable, so
    /// `Long Press` and `Long_Press` both resolve.
    pub fn from_wire_name(name: &str) -> Option<Self> {
        let normalized = normalize_name(name);
        ActionKind::ALL
            .into_iter()
            .find(|kind| kind.wire_name() == normalized)
    }

    /// Whether executing this kind issues a device operation.
    pub fn touches_device(self) -> bool {
        !matches!(
            self,
            ActionKind::Finish
                | ActionKind::TakeOver
                | ActionKind::Interact
                | ActionKind::Note
                | ActionKind::CallApi
        )
    }

    /// Kinds that hand control to a human and do not count against the step budget.
    pub fn needs_human(self) -> bool {
        matches!(self, ActionKind::TakeOver | ActionKind::Interact)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

pub(crate) fn normalize_name(name: &str) -> String {
    name.trim().replace(' ', "_")
}

/// A point on the normalized 0-999 grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

impl Point {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }

    pub fn on_grid(&self) -> bool {
        (0..GRID_SIZE).contains(&self.x) && (0..GRID_SIZE).contains(&self.y)
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.x, self.y)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Text(String),
    Point(Point),
    List(Vec<ParamValue>),
}

impl ParamValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_point(&self) -> Option<Point> {
        match self {
            ParamValue::Point(p) => Some(*p),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(n) => write!(f, "{n}"),
            ParamValue::Text(s) => write!(f, "{s:?}"),
            ParamValue::Point(p) => write!(f, "{p}"),
            ParamValue::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

pub type Params = BTreeMap<String, ParamValue>;

/// A decoded but not yet validated model action. Both dialects produce this shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCall {
    pub name: String,
    pub params: Params,
    pub thought: String,
}

/// A validated action. `params` holds exactly the kind's required keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    pub params: Params,
    pub thought: String,
}

impl Action {
    pub fn point(&self, name: &str) -> Option<Point> {
        self.params.get(name).and_then(ParamValue::as_point)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(ParamValue::as_text)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.kind)?;
        for (i, (key, value)) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}={value}")?;
        }
        f.write_str(")")
    }
}

/// The record of one completed loop turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_index: usize,
    pub thought: String,
    pub action: Option<Action>,
    #[serde(skip)]
    pub screenshot: Option<Vec<u8>>,
    pub message: Option<String>,
    pub finished: bool,
}

/// Parses the seconds out of a `Wait` duration such as `"2"`, `"2 seconds"` or `"1.5s"`.
pub fn parse_duration_secs(raw: &str) -> Option<f64> {
    let trimmed = raw.trim_start();
    let end = trimmed
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
        .map(|(i, _)| i)
        .unwrap_or(trimmed.len());
    let secs: f64 = trimmed[..end].parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then_some(secs)
}

/// A `Wait` duration that fits in a [`Duration`] and does not exceed [`MAX_WAIT`].
pub fn wait_duration(raw: &str) -> Option<Duration> {
    let secs = parse_duration_secs(raw)?;
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| *d <= MAX_WAIT)
}
