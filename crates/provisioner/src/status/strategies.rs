//! Status extraction strategies.
//!
//! Each strategy receives the full raw object and reads only its `status`
//! field. A [`ShapeError`] means the payload is missing something the
//! strategy requires, as opposed to an object that has reported nothing yet.

use api_types::NormalizedStatus;
use serde_json::Value;

/// Raw status payload lacks a field the strategy requires.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display("{_0}")]
pub struct ShapeError(pub &'static str);

impl core::error::Error for ShapeError {}

pub type StrategyResult = Result<NormalizedStatus, ShapeError>;

fn status_field<'a>(object: &'a Value, field: &str) -> Option<&'a Value> {
    object
        .get("status")
        .and_then(|status| status.get(field))
        .filter(|value| !value.is_null())
}

fn string_field<'a>(
    value: Option<&'a Value>,
    not_a_string: &'static str,
) -> Result<Option<&'a str>, ShapeError> {
    match value {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(ShapeError(not_a_string)),
    }
}

fn conditions(object: &Value) -> Result<Option<&Vec<Value>>, ShapeError> {
    match status_field(object, "conditions") {
        None => Ok(None),
        Some(Value::Array(items)) => Ok(Some(items)),
        Some(_) => Err(ShapeError("status.conditions is not a list")),
    }
}

fn condition_type(condition: &Value, not_a_map: &'static str) -> StrategyResult {
    if !condition.is_object() {
        return Err(ShapeError(not_a_map));
    }
    string_field(condition.get("type"), "condition type is not a string")?
        .map(NormalizedStatus::new)
        .ok_or(ShapeError("condition type not found"))
}

/// `status.phase`, else the `type` of the last condition.
///
/// An object without any `status` yields an empty token and no error.
pub fn default_status(object: &Value) -> StrategyResult {
    match object.get("status") {
        None | Some(Value::Null) => return Ok(NormalizedStatus::default()),
        Some(_) => {}
    }

    if let Some(phase) = string_field(status_field(object, "phase"), "status.phase is not a string")? {
        return Ok(NormalizedStatus::new(phase));
    }

    let conditions = conditions(object)?.ok_or(ShapeError("status.conditions not found"))?;
    let last = conditions
        .last()
        .ok_or(ShapeError("status.conditions is empty"))?;
    condition_type(last, "last condition is not a map")
}

/// Workflow phase (default `Unknown`), overridden by `Pending` when the
/// inspected sub-task is still pending.
///
/// `status.nodes` is an unordered mapping and exactly one entry is inspected:
/// the last one in iteration order. Which entry that is carries no meaning,
/// and callers must not depend on it.
pub fn workflow_status(object: &Value) -> StrategyResult {
    let phase = string_field(status_field(object, "phase"), "status.phase is not a string")?
        .unwrap_or("Unknown");

    let nodes = match status_field(object, "nodes") {
        None => return Ok(NormalizedStatus::new(phase)),
        Some(Value::Object(nodes)) => nodes,
        Some(_) => return Err(ShapeError("status.nodes is not a map")),
    };
    let Some(node) = nodes.values().last() else {
        return Ok(NormalizedStatus::new(phase));
    };
    if !node.is_object() {
        return Err(ShapeError("workflow node entry is not a map"));
    }

    match string_field(node.get("phase"), "workflow node phase is not a string")? {
        Some("Pending") => Ok(NormalizedStatus::new("Pending")),
        _ => Ok(NormalizedStatus::new(phase)),
    }
}

/// `type` of the **first** condition. Missing or empty conditions are an error.
pub fn session_crd_status(object: &Value) -> StrategyResult {
    let conditions = conditions(object)?.ok_or(ShapeError("status.conditions not found"))?;
    let first = conditions.first().ok_or(ShapeError("no conditions found"))?;
    condition_type(first, "first condition is not a map")
}

/// `ready` if any condition is `Ready`/`True`, otherwise `unready`.
pub fn serving_readiness_status(object: &Value) -> StrategyResult {
    let ready = conditions(object)?.is_some_and(|conditions| {
        conditions.iter().any(|condition| {
            condition.get("type").and_then(Value::as_str) == Some("Ready")
                && condition.get("status").and_then(Value::as_str) == Some("True")
        })
    });
    Ok(NormalizedStatus::new(if ready { "ready" } else { "unready" }))
}

/// `status.state.phase`, default `unready`.
pub fn batch_job_status(object: &Value) -> StrategyResult {
    let phase = status_field(object, "state")
        .and_then(|state| state.get("phase"))
        .filter(|phase| !phase.is_null());
    let phase = string_field(phase, "status.state.phase is not a string")?;
    Ok(NormalizedStatus::new(phase.unwrap_or("unready")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use similar_asserts::assert_eq;

    use super::*;

    fn token(result: StrategyResult) -> String {
        result.unwrap().into_inner()
    }

    #[test]
    fn default_prefers_phase() {
        assert_eq!(token(default_status(&json!({"status": {"phase": "Running"}}))), "Running");
        assert_eq!(
            token(default_status(&json!({
                "status": {"phase": "Succeeded", "conditions": [{"type": "Ready"}]}
            }))),
            "Succeeded"
        );
    }

    #[test]
    fn default_falls_back_to_last_condition() {
        let object = json!({"status": {"conditions": [{"type": "Initializing"}, {"type": "Ready"}]}});
        assert_eq!(token(default_status(&object)), "Ready");
    }

    #[test]
    fn default_without_status_is_empty_signal() {
        let status = default_status(&json!({})).unwrap();
        assert!(status.is_empty());
    }

    #[test]
    fn default_with_status_but_no_signal_is_shape_error() {
        assert_eq!(
            default_status(&json!({"status": {}})).unwrap_err(),
            ShapeError("status.conditions not found")
        );
        assert_eq!(
            default_status(&json!({"status": {"conditions": []}})).unwrap_err(),
            ShapeError("status.conditions is empty")
        );
        assert_eq!(
            default_status(&json!({"status": {"conditions": ["Ready"]}})).unwrap_err(),
            ShapeError("last condition is not a map")
        );
        assert_eq!(
            default_status(&json!({"status": {"phase": 3}})).unwrap_err(),
            ShapeError("status.phase is not a string")
        );
    }

    #[test]
    fn session_crd_takes_first_condition() {
        let object = json!({"status": {"conditions": [{"type": "Initializing"}, {"type": "Ready"}]}});
        assert_eq!(token(session_crd_status(&object)), "Initializing");
    }

    #[test]
    fn session_crd_requires_conditions() {
        assert_eq!(
            session_crd_status(&json!({})).unwrap_err(),
            ShapeError("status.conditions not found")
        );
        assert_eq!(
            session_crd_status(&json!({"status": {"conditions": []}})).unwrap_err(),
            ShapeError("no conditions found")
        );
        assert_eq!(
            session_crd_status(&json!({"status": {"conditions": [{"status": "True"}]}})).unwrap_err(),
            ShapeError("condition type not found")
        );
    }

    #[test]
    fn serving_readiness() {
        let ready = json!({"status": {"conditions": [
            {"type": "Initializing", "status": "True"},
            {"type": "Ready", "status": "True"},
        ]}});
        assert_eq!(token(serving_readiness_status(&ready)), "ready");

        let not_ready = json!({"status": {"conditions": [{"type": "Ready", "status": "False"}]}});
        assert_eq!(token(serving_readiness_status(&not_ready)), "unready");
        assert_eq!(token(serving_readiness_status(&json!({}))), "unready");
        assert_eq!(
            token(serving_readiness_status(&json!({"status": {"conditions": ["junk"]}}))),
            "unready"
        );
    }

    #[test]
    fn batch_job_phase() {
        let running = json!({"status": {"state": {"phase": "Running"}}});
        assert_eq!(token(batch_job_status(&running)), "Running");
        assert_eq!(token(batch_job_status(&json!({}))), "unready");
        assert_eq!(token(batch_job_status(&json!({"status": {"state": {}}}))), "unready");
    }

    #[test]
    fn workflow_phase_and_default() {
        assert_eq!(token(workflow_status(&json!({}))), "Unknown");
        assert_eq!(
            token(workflow_status(&json!({"status": {"phase": "Running", "nodes": {}}}))),
            "Running"
        );
    }

    #[test]
    fn workflow_pending_node_overrides_phase() {
        let object = json!({"status": {
            "phase": "Running",
            "nodes": {"wf-1": {"phase": "Pending"}},
        }});
        assert_eq!(token(workflow_status(&object)), "Pending");

        let object = json!({"status": {
            "phase": "Running",
            "nodes": {"wf-1": {"phase": "Succeeded"}},
        }});
        assert_eq!(token(workflow_status(&object)), "Running");
    }

    #[test]
    fn workflow_result_is_one_of_the_allowed_tokens() {
        // Which node is inspected is unspecified; either answer is acceptable.
        let object = json!({"status": {
            "phase": "Running",
            "nodes": {"a": {"phase": "Pending"}, "b": {"phase": "Running"}},
        }});
        let status = token(workflow_status(&object));
        assert!(status == "Pending" || status == "Running", "got {status}");
    }

    #[test]
    fn workflow_node_without_phase_reports_top_level() {
        let object = json!({"status": {"phase": "Failed", "nodes": {"a": {}}}});
        assert_eq!(token(workflow_status(&object)), "Failed");
        assert_eq!(
            workflow_status(&json!({"status": {"nodes": {"a": 1}}})).unwrap_err(),
            ShapeError("workflow node entry is not a map")
        );
    }
}
