use tracing::debug;

use crate::catalog::{ParamType, ToolCatalog};
use crate::error::ValidationError;
use crate::types::{
    Action, ActionCall, ActionKind, MAX_WAIT, ParamValue, Params, parse_duration_secs,
    wait_duration,
};

/// Checks a decoded call against the tool catalog and returns the typed action.
///
/// Every kind needs a non-empty thought. String parameters given as integers
/// are normalized to text and parameters outside the kind's schema are
/// dropped; nothing else is rewritten.
pub fn validate(call: &ActionCall) -> Result<Action, ValidationError> {
    let kind = ActionKind::from_wire_name(&call.name)
        .ok_or_else(|| ValidationError::UnknownAction(call.name.clone()))?;
    let schema = ToolCatalog.schema(kind);

    let mut params = Params::new();
    for spec in schema.params {
        let value = call
            .params
            .get(spec.name)
            .ok_or(ValidationError::MissingParam {
                kind,
                param: spec.name,
            })?;

        let normalized = match spec.ty {
            ParamType::Coordinate => check_coordinate(spec.name, value)?,
            ParamType::Text => check_text(spec.name, value)?,
        };
        params.insert(spec.name.to_string(), normalized);
    }

    for extra in call.params.keys().filter(|k| schema.param(k).is_none()) {
        debug!(action = %kind, param = %extra, "dropping parameter outside schema");
    }

    check_kind_rules(kind, &params)?;

    if call.thought.trim().is_empty() {
        return Err(ValidationError::MissingParam {
            kind,
            param: "thought",
        });
    }

    Ok(Action {
        kind,
        params,
        thought: call.thought.clone(),
    })
}

fn check_coordinate(param: &'static str, value: &ParamValue) -> Result<ParamValue, ValidationError> {
    let point = match value {
        ParamValue::Point(p) => *p,
        ParamValue::List(items) => {
            return Err(ValidationError::InvalidCoordinate {
                param,
                reason: format!("expected exactly two integers, got {} value(s)", items.len()),
            });
        }
        other => {
            return Err(ValidationError::InvalidCoordinate {
                param,
                reason: format!("expected [x,y], got {other}"),
            });
        }
    };
    if !point.on_grid() {
        return Err(ValidationError::InvalidCoordinate {
            param,
            reason: format!("{point} is outside the 0-999 grid"),
        });
    }
    Ok(ParamValue::Point(point))
}

fn check_text(param: &'static str, value: &ParamValue) -> Result<ParamValue, ValidationError> {
    match value {
        ParamValue::Text(s) => Ok(ParamValue::Text(s.clone())),
        ParamValue::Int(n) => Ok(ParamValue::Text(n.to_string())),
        other => Err(ValidationError::InvalidParam {
            param,
            reason: format!("expected a string, got {other}"),
        }),
    }
}

fn check_kind_rules(kind: ActionKind, params: &Params) -> Result<(), ValidationError> {
    match kind {
        ActionKind::Finish | ActionKind::TakeOver => {
            let empty = params
                .get("message")
                .and_then(ParamValue::as_text)
                .is_none_or(|m| m.trim().is_empty());
            if empty {
                return Err(ValidationError::MissingParam {
                    kind,
                    param: "message",
                });
            }
        }
        ActionKind::Wait => {
            let duration = params
                .get("duration")
                .and_then(ParamValue::as_text)
                .unwrap_or_default();
            if parse_duration_secs(duration).is_none() {
                return Err(ValidationError::InvalidParam {
                    param: "duration",
                    reason: format!("'{duration}' is not a number of seconds"),
                });
            }
            if wait_duration(duration).is_none() {
                return Err(ValidationError::InvalidParam {
                    param: "duration",
                    reason: format!("'{duration}' is longer than {}s", MAX_WAIT.as_secs()),
                });
            }
        }
        _ => {}
    }
    Ok(())
}
