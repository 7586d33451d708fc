//! Instruction payloads, one per locale and dialect.
//!
//! Every function here is pure: the same inputs always yield the same text.

use chrono::{Datelike, NaiveDate, Weekday};

use crate::catalog::ToolCatalog;
use crate::error::ActionError;
use crate::types::{Dialect, Locale};

const FRAMING_CN: &str = r#"# 设定
你是一个专业的安卓操作智能助手，能够完成用户的高层指令。每一步你都会收到当前安卓界面的截图，你需要先分析当前状况，再规划最合适的下一步操作。

注意：
- 先思考再行动：每一步都要先分析当前界面和最佳操作。
- 每次回复只执行一个操作。
- 坐标使用 0-999 的归一化坐标系，左上角为 (0,0)，右下角为 (999,999)。
- 遇到登录、验证码、支付等需要用户参与的环节时，使用 Take_over。
- 任务完成后使用 finish 并给出总结。"#;

const FRAMING_EN: &str = r#"# Setup
You are a professional Android operation agent that fulfills the user's high-level instructions. At each step you receive a screenshot of the Android interface; first analyze the situation, then choose the best next action.

REMEMBER:
- Think before you act: analyze the current UI before every step.
- Only ONE action per response.
- Coordinates use a normalized 0-999 grid: (0,0) is top-left, (999,999) is bottom-right.
- Use Take_over when login, verification or payment needs the user.
- When the task is done, use finish with a short summary."#;

const NATIVE_NOTE_CN: &str = "请通过函数调用给出操作，并在 thought 参数中写明你的推理。";
const NATIVE_NOTE_EN: &str = "Respond with a function call and put your reasoning in the `thought` parameter.";

const FORMAT_CN: &str = r#"# 输出格式
你必须严格按照以下格式输出，不允许有其他内容：
<think>你的推理</think>
<answer>一行操作指令</answer>

其中 <think> 是对为什么选择这个操作的简短推理，<answer> 是本次执行的具体操作指令。"#;

const FORMAT_EN: &str = r#"# Output Format
Your response must contain exactly these two segments, in this order, and nothing else:
<think>
[Your thought]
</think>
<answer>
[One line of operation code]
</answer>

Use <think> to analyze the screen and pick the most efficient action; use <answer> for a single pseudo-code call."#;

/// Builds the instruction payload for a session.
pub fn assemble(locale: Locale, dialect: Dialect) -> String {
    match (locale, dialect) {
        (Locale::Cn, Dialect::Native) => native(FRAMING_CN, NATIVE_NOTE_CN),
        (Locale::En, Dialect::Native) => native(FRAMING_EN, NATIVE_NOTE_EN),
        (Locale::Cn, Dialect::TextMarkup) => {
            text_markup(FRAMING_CN, FORMAT_CN, "操作指令及其作用如下：", Locale::Cn)
        }
        (Locale::En, Dialect::TextMarkup) => {
            text_markup(FRAMING_EN, FORMAT_EN, "Available actions:", Locale::En)
        }
    }
}

fn native(framing: &str, note: &str) -> String {
    format!("{framing}\n\n{note}")
}

fn text_markup(framing: &str, format: &str, heading: &str, locale: Locale) -> String {
    format!(
        "{framing}\n\n{format}\n\n{heading}\n{}",
        tool_catalog_prose(locale)
    )
}

/// One entry per tool: call signature, then a one-line description.
pub fn tool_catalog_prose(locale: Locale) -> String {
    ToolCatalog
        .schemas()
        .iter()
        .map(|schema| {
            format!(
                "- {}\n    {}\n",
                schema.call_signature(),
                schema.description(locale)
            )
        })
        .collect()
}

/// Prefixes the payload with the date line.
pub fn dated(payload: &str, locale: Locale, date: NaiveDate) -> String {
    let line = match locale {
        Locale::Cn => format!(
            "今天的日期是: {}年{:02}月{:02}日 {}",
            date.year(),
            date.month(),
            date.day(),
            weekday_cn(date.weekday())
        ),
        Locale::En => format!("The current date: {}", date.format("%Y-%m-%d, %A")),
    };
    format!("{line}\n{payload}")
}

fn weekday_cn(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "星期一",
        Weekday::Tue => "星期二",
        Weekday::Wed => "星期三",
        Weekday::Thu => "星期四",
        Weekday::Fri => "星期五",
        Weekday::Sat => "星期六",
        Weekday::Sun => "星期日",
    }
}

/// The first user turn: task plus the current screen description.
pub fn first_turn(locale: Locale, task: &str, screen_info: &str) -> String {
    match locale {
        Locale::Cn => format!("任务: {task}\n\n** 屏幕信息 **\n{screen_info}"),
        Locale::En => format!("Task: {task}\n\n** Screen Info **\n{screen_info}"),
    }
}

pub fn next_turn(locale: Locale, screen_info: &str) -> String {
    match locale {
        Locale::Cn => format!("** 屏幕信息 **\n{screen_info}"),
        Locale::En => format!("** Screen Info **\n{screen_info}"),
    }
}

pub fn screen_info(current_app: Option<&str>) -> String {
    serde_json::json!({ "current_app": current_app.unwrap_or("System Home") }).to_string()
}

/// Re-prompt sent after a reply that failed to parse or validate.
pub fn correction(locale: Locale, dialect: Dialect, error: &ActionError) -> String {
    match (locale, dialect) {
        (Locale::Cn, Dialect::TextMarkup) => format!(
            "上一条回复无效：{error}。\n请严格只输出一个 <think>…</think> 段和一个 <answer>…</answer> 段，answer 中只包含一个 do(...) 或 finish(...) 调用。"
        ),
        (Locale::En, Dialect::TextMarkup) => format!(
            "Your previous response was invalid: {error}.\nReturn exactly one <think>...</think> segment followed by one <answer>...</answer> segment containing a single do(...) or finish(...) call."
        ),
        (Locale::Cn, Dialect::Native) => {
            format!("上一次函数调用无效：{error}。请使用列表中的工具重新调用，并提供全部必填参数。")
        }
        (Locale::En, Dialect::Native) => format!(
            "Your previous function call was invalid: {error}.\nCall one of the provided tools again with all required parameters."
        ),
    }
}

/// Context note folded in when a human hands control back.
pub fn resumed(locale: Locale, note: Option<&str>) -> String {
    match (locale, note) {
        (Locale::Cn, Some(note)) => format!("用户已完成人工操作：{note}。请继续任务。"),
        (Locale::Cn, None) => "用户已完成人工操作，请继续任务。".to_string(),
        (Locale::En, Some(note)) => {
            format!("The user finished the manual step: {note}. Continue the task.")
        }
        (Locale::En, None) => "The user finished the manual step. Continue the task.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ParseError, Segment};

    #[test]
    fn native_payload_has_no_tool_list() {
        for locale in [Locale::Cn, Locale::En] {
            let payload = assemble(locale, Dialect::Native);
            assert!(!payload.contains("do(action="));
            assert!(!payload.contains("<answer>"));
        }
    }

    #[test]
    fn text_markup_payload_embeds_catalog_and_format() {
        let payload = assemble(Locale::En, Dialect::TextMarkup);
        let format_at = payload.find("<think>").unwrap();
        let answer_at = payload.find("<answer>").unwrap();
        assert!(format_at < answer_at);
        assert!(payload.contains(r#"do(action="Swipe", start=[x1,y1], end=[x2,y2], thought="xxx")"#));
        assert!(payload.contains(r#"finish(message="xxx", thought="xxx")"#));
        assert!(payload.contains("Double-tap a point on the screen."));

        let payload = assemble(Locale::Cn, Dialect::TextMarkup);
        assert!(payload.contains("操作指令及其作用如下"));
        assert!(payload.contains("双击"));
    }

    #[test]
    fn assemble_is_deterministic() {
        assert_eq!(
            assemble(Locale::Cn, Dialect::TextMarkup),
            assemble(Locale::Cn, Dialect::TextMarkup)
        );
    }

    #[test]
    fn dated_prefix() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        let payload = dated("body", Locale::En, date);
        assert_eq!(payload, "The current date: 2026-10-16, Friday\nbody");
        let payload = dated("body", Locale::Cn, date);
        assert!(payload.starts_with("今天的日期是: 2026年10月16日 星期五\n"));
    }

    #[test]
    fn correction_carries_error_detail() {
        let err = ActionError::Parse(ParseError::MissingSegment(Segment::Action));
        let text = correction(Locale::En, Dialect::TextMarkup, &err);
        assert!(text.contains("missing <answer> segment"));
    }
}
