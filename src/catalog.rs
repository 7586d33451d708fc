//! Static tool catalog: one schema per [`ActionKind`].
//!
//! The catalog is the single source for what the validator enforces, what the
//! text-markup prompt lists, and what native tool definitions are sent to the model.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::types::{ActionKind, Locale};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    /// `[x, y]` on the normalized grid.
    Coordinate,
    Text,
}

#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub ty: ParamType,
    /// Placeholder shown in the text-markup call signature.
    pub example: &'static str,
    pub description_cn: &'static str,
    pub description_en: &'static str,
}

impl ParamSpec {
    pub fn description(&self, locale: Locale) -> &'static str {
        match locale {
            Locale::Cn => self.description_cn,
            Locale::En => self.description_en,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ToolSchema {
    pub kind: ActionKind,
    pub params: &'static [ParamSpec],
    pub description_cn: &'static str,
    pub description_en: &'static str,
}

impl ToolSchema {
    pub fn description(&self, locale: Locale) -> &'static str {
        match locale {
            Locale::Cn => self.description_cn,
            Locale::En => self.description_en,
        }
    }

    pub fn param(&self, name: &str) -> Option<&'static ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// The pseudo-code form taught to text-markup models, e.g.
    /// `do(action="Tap", element=[x,y], thought="xxx")`.
    pub fn call_signature(&self) -> String {
        let mut args: Vec<String> = Vec::with_capacity(self.params.len() + 2);
        if self.kind != ActionKind::Finish {
            args.push(format!("action=\"{}\"", self.kind.wire_name()));
        }
        for param in self.params {
            let rendered = match param.ty {
                ParamType::Coordinate => format!("{}={}", param.name, param.example),
                ParamType::Text => format!("{}=\"{}\"", param.name, param.example),
            };
            args.push(rendered);
        }
        args.push("thought=\"xxx\"".to_string());

        let callee = if self.kind == ActionKind::Finish {
            "finish"
        } else {
            "do"
        };
        format!("{callee}({})", args.join(", "))
    }

    /// JSON Schema for the native dialect. `thought` is required on every tool.
    pub fn parameters_schema(&self, locale: Locale) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required: Vec<&str> = Vec::with_capacity(self.params.len() + 1);
        for param in self.params {
            let schema = match param.ty {
                ParamType::Coordinate => json!({
                    "type": "array",
                    "items": {"type": "integer", "minimum": 0, "maximum": 999},
                    "minItems": 2,
                    "maxItems": 2,
                    "description": param.description(locale),
                }),
                ParamType::Text => json!({
                    "type": "string",
                    "description": param.description(locale),
                }),
            };
            properties.insert(param.name.to_string(), schema);
            required.push(param.name);
        }
        properties.insert(
            "thought".to_string(),
            json!({"type": "string", "description": THOUGHT.description(locale)}),
        );
        required.push("thought");

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// A tool as handed to a native function-calling model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

const THOUGHT: ParamSpec = ParamSpec {
    name: "thought",
    ty: ParamType::Text,
    example: "xxx",
    description_cn: "当前的思考和行动原因",
    description_en: "Your reasoning for this action",
};

const fn coordinate(
    name: &'static str,
    example: &'static str,
    description_cn: &'static str,
    description_en: &'static str,
) -> ParamSpec {
    ParamSpec {
        name,
        ty: ParamType::Coordinate,
        example,
        description_cn,
        description_en,
    }
}

const fn text(
    name: &'static str,
    example: &'static str,
    description_cn: &'static str,
    description_en: &'static str,
) -> ParamSpec {
    ParamSpec {
        name,
        ty: ParamType::Text,
        example,
        description_cn,
        description_en,
    }
}

const ELEMENT: ParamSpec = coordinate("element", "[x,y]", "目标坐标 [x, y]", "Target point [x, y]");
const START: ParamSpec = coordinate("start", "[x1,y1]", "起始坐标 [x1, y1]", "Start point [x1, y1]");
const END: ParamSpec = coordinate("end", "[x2,y2]", "结束坐标 [x2, y2]", "End point [x2, y2]");
const TEXT: ParamSpec = text("text", "xxx", "要输入的文本内容", "Text to type");
const APP: ParamSpec = text("app", "xxx", "应用名称", "App name");
const MESSAGE: ParamSpec = text("message", "xxx", "说明信息", "Message");
const INSTRUCTION: ParamSpec = text("instruction", "xxx", "总结或评论的指令", "What to summarize or comment on");
const DURATION: ParamSpec = text("duration", "x seconds", "等待秒数，如 '2 seconds'", "Seconds to wait, e.g. '2 seconds'");

static SCHEMAS: [ToolSchema; 15] = [
    ToolSchema {
        kind: ActionKind::Tap,
        params: &[ELEMENT],
        description_cn: "点击屏幕上的特定点。坐标系统从左上角 (0,0) 开始到右下角 (999,999)。",
        description_en: "Tap a point on the screen. Coordinates run from (0,0) top-left to (999,999) bottom-right.",
    },
    ToolSchema {
        kind: ActionKind::Launch,
        params: &[APP],
        description_cn: "启动目标 app 的操作。",
        description_en: "Launch the named app.",
    },
    ToolSchema {
        kind: ActionKind::Type,
        params: &[TEXT],
        description_cn: "在当前聚焦的输入框中输入文本。",
        description_en: "Type text into the focused input field.",
    },
    ToolSchema {
        kind: ActionKind::TypeName,
        params: &[TEXT],
        description_cn: "输入人名的操作，基本功能同 Type。",
        description_en: "Type a person's name; otherwise the same as Type.",
    },
    ToolSchema {
        kind: ActionKind::Interact,
        params: &[],
        description_cn: "当有多个满足条件的选项时，询问用户如何选择。",
        description_en: "Ask the user to choose when several options match.",
    },
    ToolSchema {
        kind: ActionKind::Swipe,
        params: &[START, END],
        description_cn: "从起始坐标拖动到结束坐标来执行滑动手势。",
        description_en: "Swipe from the start point to the end point.",
    },
    ToolSchema {
        kind: ActionKind::Note,
        params: &[MESSAGE],
        description_cn: "记录当前页面内容以便后续总结。",
        description_en: "Record the current page content for a later summary.",
    },
    ToolSchema {
        kind: ActionKind::CallApi,
        params: &[INSTRUCTION],
        description_cn: "总结或评论当前页面或已记录的内容。",
        description_en: "Summarize or comment on the page or recorded notes.",
    },
    ToolSchema {
        kind: ActionKind::LongPress,
        params: &[ELEMENT],
        description_cn: "在屏幕上的特定点长按。",
        description_en: "Long-press a point on the screen.",
    },
    ToolSchema {
        kind: ActionKind::DoubleTap,
        params: &[ELEMENT],
        description_cn: "双击屏幕上的特定点，即快速连续点按两次。",
        description_en: "Double-tap a point on the screen.",
    },
    ToolSchema {
        kind: ActionKind::TakeOver,
        params: &[MESSAGE],
        description_cn: "接管操作，表示在登录和验证阶段需要用户协助。",
        description_en: "Hand over to the user, e.g. for login or verification.",
    },
    ToolSchema {
        kind: ActionKind::Back,
        params: &[],
        description_cn: "返回上一个屏幕或关闭当前对话框。",
        description_en: "Go back to the previous screen or close a dialog.",
    },
    ToolSchema {
        kind: ActionKind::Home,
        params: &[],
        description_cn: "回到系统桌面。",
        description_en: "Go to the home screen.",
    },
    ToolSchema {
        kind: ActionKind::Wait,
        params: &[DURATION],
        description_cn: "等待页面加载。",
        description_en: "Wait for the page to load.",
    },
    ToolSchema {
        kind: ActionKind::Finish,
        params: &[MESSAGE],
        description_cn: "结束任务，message 为任务完成时的总结信息。",
        description_en: "End the task; message summarizes the result.",
    },
];

/// Read-only view over the process-wide schema table.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolCatalog;

impl ToolCatalog {
    pub fn schemas(&self) -> &'static [ToolSchema] {
        &SCHEMAS
    }

    pub fn schema(&self, kind: ActionKind) -> &'static ToolSchema {
        // SCHEMAS is declared in ActionKind::ALL order.
        &SCHEMAS[kind as usize]
    }

    pub fn native_tools(&self, locale: Locale) -> Vec<ToolDefinition> {
        SCHEMAS
            .iter()
            .map(|schema| ToolDefinition {
                name: schema.kind.wire_name().to_string(),
                description: schema.description(locale).to_string(),
                parameters: schema.parameters_schema(locale),
            })
            .collect()
    }
}
