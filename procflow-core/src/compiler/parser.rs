//! Declarative procedure JSON → IR.
//!
//! The parser is tolerant about optional fields (defaults everywhere the
//! definition format allows omission) and strict about structure: a node
//! with an unknown type, a rule without a condition, or a missing
//! `procedure_id` is a `validation` error.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::compiler::ir::*;
use crate::error::{OrchError, OrchResult};

/// Step fields that are orchestration metadata; everything else in the step
/// object is treated as an action parameter.
const STEP_META_KEYS: &[&str] = &[
    "step_id",
    "action",
    "timeout_ms",
    "wait_ms",
    "wait_after_ms",
    "retry_on_failure",
    "retry",
    "output_variable",
    "idempotency_key",
    "workflow_dispatch_mode",
];

/// Parse a full procedure definition into an [`IrProcedure`].
pub fn parse_procedure(definition: &Value) -> OrchResult<IrProcedure> {
    let root = definition
        .as_object()
        .ok_or_else(|| OrchError::validation("procedure definition must be a JSON object"))?;

    let procedure_id = require_str(root, "procedure_id")?;
    let version = require_str(root, "version")?;

    let graph = root
        .get("workflow_graph")
        .and_then(Value::as_object)
        .ok_or_else(|| OrchError::validation("definition is missing 'workflow_graph'"))?;

    let raw_nodes = graph
        .get("nodes")
        .and_then(Value::as_object)
        .ok_or_else(|| OrchError::validation("workflow_graph is missing 'nodes'"))?;

    let mut nodes = BTreeMap::new();
    for (node_id, raw) in raw_nodes {
        let obj = raw.as_object().ok_or_else(|| {
            OrchError::validation(format!("node '{node_id}' must be a JSON object"))
        })?;
        nodes.insert(node_id.clone(), parse_node(node_id, obj)?);
    }

    Ok(IrProcedure {
        procedure_id,
        version,
        global_config: parse_global_config(root.get("global_config")),
        variables_schema: normalize_variables_schema(root.get("variables_schema")),
        start_node_id: get_str(graph, "start_node").unwrap_or_default(),
        nodes,
    })
}

// ─── Node & payload parsing ───────────────────────────────────

fn parse_node(node_id: &str, d: &Map<String, Value>) -> OrchResult<IrNode> {
    let node_type = get_str(d, "type").unwrap_or_else(|| "sequence".to_string());

    let payload = match node_type.as_str() {
        "sequence" => NodePayload::Sequence(parse_sequence(node_id, d)?),
        "logic" => NodePayload::Logic(parse_logic(node_id, d)?),
        "loop" => NodePayload::Loop(parse_loop(d)),
        "parallel" => NodePayload::Parallel(parse_parallel(node_id, d)?),
        "processing" => NodePayload::Processing(parse_processing(d)),
        "verification" => NodePayload::Verification(parse_verification(d)),
        "llm_action" => NodePayload::LlmAction(parse_llm_action(d)),
        "human_approval" => NodePayload::HumanApproval(parse_human_approval(d)),
        "transform" => NodePayload::Transform(parse_transform(node_id, d)?),
        "subflow" => NodePayload::Subflow(parse_subflow(d)),
        "terminate" => NodePayload::Terminate(parse_terminate(d)),
        other => {
            return Err(OrchError::validation(format!(
                "node '{node_id}' has unknown type '{other}'"
            )))
        }
    };

    Ok(IrNode {
        node_id: node_id.to_string(),
        agent: get_str(d, "agent").map(|c| c.to_lowercase()),
        description: get_str(d, "description"),
        is_checkpoint: get_bool(d, "is_checkpoint"),
        next_node_id: get_str(d, "next_node"),
        sla_ms: get_u64(d, "sla_ms"),
        payload,
    })
}

fn parse_sequence(node_id: &str, d: &Map<String, Value>) -> OrchResult<SequencePayload> {
    let steps = d
        .get("steps")
        .and_then(Value::as_array)
        .map(|steps| steps.iter().map(|s| parse_step(node_id, s)).collect())
        .transpose()?
        .unwrap_or_default();

    let error_handlers = d
        .get("error_handlers")
        .and_then(Value::as_array)
        .map(|handlers| {
            handlers
                .iter()
                .map(|h| parse_error_handler(node_id, h))
                .collect()
        })
        .transpose()?
        .unwrap_or_default();

    Ok(SequencePayload {
        steps,
        error_handlers,
    })
}

fn parse_step(node_id: &str, raw: &Value) -> OrchResult<IrStep> {
    let s = raw
        .as_object()
        .ok_or_else(|| OrchError::validation(format!("step in '{node_id}' must be an object")))?;

    // Everything that is not orchestration metadata is an action param.
    let params: Map<String, Value> = s
        .iter()
        .filter(|(k, _)| !STEP_META_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(IrStep {
        step_id: get_str(s, "step_id").unwrap_or_default(),
        action: get_str(s, "action").unwrap_or_default(),
        params,
        timeout_ms: get_u64(s, "timeout_ms"),
        wait_ms: get_u64(s, "wait_ms"),
        wait_after_ms: get_u64(s, "wait_after_ms"),
        retry_on_failure: get_bool(s, "retry_on_failure"),
        retry: s.get("retry").and_then(Value::as_object).map(parse_retry),
        output_variable: get_str(s, "output_variable"),
        idempotency_key: get_str(s, "idempotency_key"),
        workflow_dispatch_mode: parse_dispatch_mode(get_str(s, "workflow_dispatch_mode")),
        binding: None,
    })
}

fn parse_retry(d: &Map<String, Value>) -> RetryConfig {
    let defaults = RetryConfig::default();
    RetryConfig {
        max_retries: get_u64(d, "max_retries")
            .map(|n| n as u32)
            .unwrap_or(defaults.max_retries),
        base_delay_ms: get_u64(d, "delay_ms").unwrap_or(defaults.base_delay_ms),
    }
}

fn parse_dispatch_mode(raw: Option<String>) -> Option<DispatchMode> {
    match raw.as_deref() {
        Some("async") => Some(DispatchMode::Async),
        Some(_) => Some(DispatchMode::Sync),
        None => None,
    }
}

fn parse_error_handler(node_id: &str, raw: &Value) -> OrchResult<IrErrorHandler> {
    let h = raw.as_object().ok_or_else(|| {
        OrchError::validation(format!("error handler in '{node_id}' must be an object"))
    })?;

    let action = match get_str(h, "action").as_deref() {
        Some("retry") => HandlerAction::Retry,
        Some("ignore") => HandlerAction::Ignore,
        Some("fallback_node") => HandlerAction::Fallback,
        Some("escalate") => HandlerAction::Escalate,
        _ => HandlerAction::Fail,
    };

    let recovery_steps = h
        .get("recovery_steps")
        .and_then(Value::as_array)
        .map(|steps| steps.iter().map(|s| parse_step(node_id, s)).collect())
        .transpose()?
        .unwrap_or_default();

    Ok(IrErrorHandler {
        error_kind: get_str(h, "error_kind")
            .or_else(|| get_str(h, "error_type"))
            .unwrap_or_else(|| "*".to_string()),
        action,
        max_retries: get_u64(h, "max_retries").unwrap_or(0) as u32,
        delay_ms: get_u64(h, "delay_ms").unwrap_or(0),
        recovery_steps,
        fallback_node: get_str(h, "fallback_node"),
    })
}

fn parse_logic(node_id: &str, d: &Map<String, Value>) -> OrchResult<LogicPayload> {
    let mut rules = Vec::new();
    for raw in d.get("rules").and_then(Value::as_array).unwrap_or(&vec![]) {
        let r = raw.as_object().ok_or_else(|| {
            OrchError::validation(format!("logic rule in '{node_id}' must be an object"))
        })?;
        let condition = get_str(r, "condition").ok_or_else(|| {
            OrchError::validation(format!("logic rule in '{node_id}' is missing 'condition'"))
        })?;
        let next_node_id = get_str(r, "next_node").ok_or_else(|| {
            OrchError::validation(format!("logic rule in '{node_id}' is missing 'next_node'"))
        })?;
        rules.push(LogicRule {
            condition,
            next_node_id,
        });
    }
    Ok(LogicPayload {
        rules,
        default_next_node_id: get_str(d, "default_next_node"),
    })
}

fn parse_loop(d: &Map<String, Value>) -> LoopPayload {
    LoopPayload {
        iterator_var: get_str(d, "iterator").unwrap_or_default(),
        item_variable: get_str(d, "iterator_variable").unwrap_or_default(),
        index_variable: get_str(d, "index_variable"),
        body_node_id: get_str(d, "body_node").unwrap_or_default(),
        max_iterations: get_u64(d, "max_iterations").map(|n| n as usize),
        continue_on_error: get_bool(d, "continue_on_error"),
        next_node_id: get_str(d, "next_node"),
    }
}

fn parse_parallel(node_id: &str, d: &Map<String, Value>) -> OrchResult<ParallelPayload> {
    let mut branches = Vec::new();
    for raw in d
        .get("branches")
        .and_then(Value::as_array)
        .unwrap_or(&vec![])
    {
        let b = raw.as_object().ok_or_else(|| {
            OrchError::validation(format!("parallel branch in '{node_id}' must be an object"))
        })?;
        branches.push(ParallelBranch {
            branch_id: get_str(b, "branch_id").unwrap_or_default(),
            start_node_id: get_str(b, "start_node").ok_or_else(|| {
                OrchError::validation(format!(
                    "parallel branch in '{node_id}' is missing 'start_node'"
                ))
            })?,
        });
    }

    let wait_strategy = match d.get("wait_strategy") {
        Some(Value::String(s)) if s == "any" => WaitStrategy::Any,
        Some(Value::String(s)) if s == "all" => WaitStrategy::All,
        Some(Value::String(s)) => match s.parse::<usize>() {
            Ok(n) => WaitStrategy::FirstN(n),
            Err(_) => WaitStrategy::All,
        },
        Some(Value::Number(n)) => WaitStrategy::FirstN(n.as_u64().unwrap_or(1) as usize),
        _ => WaitStrategy::All,
    };

    let branch_failure = match get_str(d, "branch_failure").as_deref() {
        Some("fail_fast") => BranchFailure::FailFast,
        _ => BranchFailure::Continue,
    };

    Ok(ParallelPayload {
        branches,
        wait_strategy,
        branch_failure,
        next_node_id: get_str(d, "next_node"),
    })
}

fn parse_processing(d: &Map<String, Value>) -> ProcessingPayload {
    let operations = d
        .get("operations")
        .and_then(Value::as_array)
        .map(|ops| {
            ops.iter()
                .filter_map(Value::as_object)
                .map(|o| ProcessingOp {
                    action: get_str(o, "action").unwrap_or_default(),
                    params: o.clone(),
                })
                .collect()
        })
        .unwrap_or_default();
    ProcessingPayload {
        operations,
        next_node_id: get_str(d, "next_node"),
    }
}

fn parse_verification(d: &Map<String, Value>) -> VerificationPayload {
    let checks = d
        .get("checks")
        .and_then(Value::as_array)
        .map(|checks| {
            checks
                .iter()
                .filter_map(Value::as_object)
                .map(|c| VerificationCheck {
                    id: get_str(c, "id").unwrap_or_default(),
                    condition: get_str(c, "condition").unwrap_or_default(),
                    on_fail: get_str(c, "on_fail").unwrap_or_else(|| "fail_workflow".to_string()),
                    message: get_str(c, "message").unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();
    VerificationPayload {
        checks,
        next_node_id: get_str(d, "next_node"),
    }
}

fn parse_llm_action(d: &Map<String, Value>) -> LlmActionPayload {
    LlmActionPayload {
        prompt: get_str(d, "prompt").unwrap_or_default(),
        model: get_str(d, "model").unwrap_or_else(|| "gpt-4".to_string()),
        temperature: d
            .get("temperature")
            .and_then(Value::as_f64)
            .unwrap_or(0.7),
        max_tokens: get_u64(d, "max_tokens").map(|n| n as u32),
        system_prompt: get_str(d, "system_prompt"),
        json_mode: get_bool(d, "json_mode"),
        output_variable: get_str(d, "output_variable"),
        next_node_id: get_str(d, "next_node"),
    }
}

fn parse_human_approval(d: &Map<String, Value>) -> HumanApprovalPayload {
    HumanApprovalPayload {
        prompt: get_str(d, "prompt").unwrap_or_default(),
        decision_type: get_str(d, "decision_type").unwrap_or_else(|| "approve_reject".to_string()),
        options: d.get("options").and_then(Value::as_array).map(|opts| {
            opts.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        }),
        timeout_ms: get_u64(d, "timeout_ms"),
        context_data: d.get("context_data").cloned(),
        on_approve: get_str(d, "on_approve"),
        on_reject: get_str(d, "on_reject"),
        on_timeout: get_str(d, "on_timeout"),
    }
}

fn parse_transform(node_id: &str, d: &Map<String, Value>) -> OrchResult<TransformPayload> {
    let mut transformations = Vec::new();
    for raw in d
        .get("transformations")
        .and_then(Value::as_array)
        .unwrap_or(&vec![])
    {
        let t = raw.as_object().ok_or_else(|| {
            OrchError::validation(format!("transformation in '{node_id}' must be an object"))
        })?;
        transformations.push(TransformOp {
            source_variable: get_str(t, "source_variable").unwrap_or_default(),
            expression: get_str(t, "expression").unwrap_or_default(),
            output_variable: get_str(t, "output_variable").ok_or_else(|| {
                OrchError::validation(format!(
                    "transformation in '{node_id}' is missing 'output_variable'"
                ))
            })?,
        });
    }
    Ok(TransformPayload {
        transformations,
        next_node_id: get_str(d, "next_node"),
    })
}

fn parse_subflow(d: &Map<String, Value>) -> SubflowPayload {
    SubflowPayload {
        procedure_id: get_str(d, "procedure_id").unwrap_or_default(),
        version: get_str(d, "version"),
        input_mapping: parse_string_map(d.get("input_mapping")),
        output_mapping: parse_string_map(d.get("output_mapping")),
        on_failure: match get_str(d, "on_failure").as_deref() {
            Some("ignore") => SubflowFailure::Ignore,
            _ => SubflowFailure::FailParent,
        },
        next_node_id: get_str(d, "next_node"),
    }
}

fn parse_terminate(d: &Map<String, Value>) -> TerminatePayload {
    TerminatePayload {
        status: get_str(d, "status").unwrap_or_else(|| "success".to_string()),
        outputs: parse_string_map(d.get("outputs")),
    }
}

// ─── Global config & variables schema ─────────────────────────

fn parse_global_config(raw: Option<&Value>) -> GlobalConfig {
    let Some(d) = raw.and_then(Value::as_object) else {
        return GlobalConfig::default();
    };

    let rate_limit_per_minute = d
        .get("rate_limiting")
        .and_then(Value::as_object)
        .and_then(|r| get_u64(r, "max_requests_per_minute"))
        .map(|n| n as u32);

    let retry = d
        .get("retry")
        .and_then(Value::as_object)
        .map(parse_retry)
        .unwrap_or_default();

    GlobalConfig {
        rate_limit_per_minute,
        retry,
        on_failure: get_str(d, "on_failure"),
        workflow_dispatch_mode: parse_dispatch_mode(get_str(d, "workflow_dispatch_mode")),
    }
}

/// Flatten the nested `{required: {...}, optional: {...}}` schema form into
/// a flat map keyed by variable name; a flat map passes through unchanged.
pub fn normalize_variables_schema(raw: Option<&Value>) -> Map<String, Value> {
    let Some(d) = raw.and_then(Value::as_object) else {
        return Map::new();
    };

    let nested = d.get("required").map(Value::is_object).unwrap_or(false)
        || d.get("optional").map(Value::is_object).unwrap_or(false);
    if !nested {
        return d.clone();
    }

    let mut flat = Map::new();
    for (group, required) in [("required", true), ("optional", false)] {
        if let Some(vars) = d.get(group).and_then(Value::as_object) {
            for (name, meta) in vars {
                let mut entry = meta.as_object().cloned().unwrap_or_default();
                entry
                    .entry("required".to_string())
                    .or_insert(Value::Bool(required));
                if required {
                    entry.insert("required".to_string(), Value::Bool(true));
                }
                flat.insert(name.clone(), Value::Object(entry));
            }
        }
    }
    flat
}

// ─── Field helpers ────────────────────────────────────────────

fn require_str(d: &Map<String, Value>, key: &str) -> OrchResult<String> {
    get_str(d, key).ok_or_else(|| OrchError::validation(format!("definition is missing '{key}'")))
}

fn get_str(d: &Map<String, Value>, key: &str) -> Option<String> {
    d.get(key).and_then(Value::as_str).map(str::to_string)
}

fn get_bool(d: &Map<String, Value>, key: &str) -> bool {
    d.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn get_u64(d: &Map<String, Value>, key: &str) -> Option<u64> {
    d.get(key).and_then(Value::as_u64)
}

fn parse_string_map(raw: Option<&Value>) -> BTreeMap<String, String> {
    raw.and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_definition() -> Value {
        json!({
            "procedure_id": "invoice_flow",
            "version": "1.0",
            "workflow_graph": {
                "start_node": "fetch",
                "nodes": {
                    "fetch": {
                        "type": "sequence",
                        "agent": "WEB",
                        "next_node": "done",
                        "steps": [{
                            "step_id": "s1",
                            "action": "navigate",
                            "url": "https://example.test/{{invoice_id}}",
                            "timeout_ms": 30000,
                            "retry_on_failure": true,
                            "output_variable": "page",
                        }],
                    },
                    "done": {"type": "terminate", "status": "success"},
                },
            },
            "global_config": {
                "rate_limiting": {"max_requests_per_minute": 60},
                "on_failure": "cleanup",
            },
        })
    }

    #[test]
    fn parses_nodes_steps_and_params() {
        let ir = parse_procedure(&minimal_definition()).unwrap();
        assert_eq!(ir.procedure_id, "invoice_flow");
        assert_eq!(ir.start_node_id, "fetch");
        assert_eq!(ir.nodes.len(), 2);

        let fetch = &ir.nodes["fetch"];
        // Channel tags are normalized to lowercase.
        assert_eq!(fetch.agent.as_deref(), Some("web"));
        let NodePayload::Sequence(seq) = &fetch.payload else {
            panic!("expected sequence payload");
        };
        let step = &seq.steps[0];
        assert_eq!(step.action, "navigate");
        assert!(step.retry_on_failure);
        assert_eq!(step.timeout_ms, Some(30000));
        // Non-meta fields land in params.
        assert_eq!(step.params["url"], json!("https://example.test/{{invoice_id}}"));
        assert!(!step.params.contains_key("action"));
    }

    #[test]
    fn parses_global_config() {
        let ir = parse_procedure(&minimal_definition()).unwrap();
        assert_eq!(ir.global_config.rate_limit_per_minute, Some(60));
        assert_eq!(ir.global_config.on_failure.as_deref(), Some("cleanup"));
    }

    #[test]
    fn unknown_node_type_is_a_validation_error() {
        let def = json!({
            "procedure_id": "p", "version": "1",
            "workflow_graph": {"start_node": "n", "nodes": {"n": {"type": "magic"}}},
        });
        let err = parse_procedure(&def).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }

    #[test]
    fn logic_rule_without_condition_is_rejected() {
        let def = json!({
            "procedure_id": "p", "version": "1",
            "workflow_graph": {"start_node": "n", "nodes": {
                "n": {"type": "logic", "rules": [{"next_node": "x"}]},
            }},
        });
        assert!(parse_procedure(&def).is_err());
    }

    #[test]
    fn wait_strategy_variants() {
        let def = json!({
            "procedure_id": "p", "version": "1",
            "workflow_graph": {"start_node": "par", "nodes": {
                "par": {
                    "type": "parallel",
                    "wait_strategy": "2",
                    "branch_failure": "fail_fast",
                    "branches": [
                        {"branch_id": "a", "start_node": "x"},
                        {"branch_id": "b", "start_node": "y"},
                    ],
                },
                "x": {"type": "terminate"},
                "y": {"type": "terminate"},
            }},
        });
        let ir = parse_procedure(&def).unwrap();
        let NodePayload::Parallel(par) = &ir.nodes["par"].payload else {
            panic!("expected parallel payload");
        };
        assert_eq!(par.wait_strategy, WaitStrategy::FirstN(2));
        assert_eq!(par.branch_failure, BranchFailure::FailFast);
    }

    #[test]
    fn normalizes_nested_variables_schema() {
        let raw = json!({
            "required": {"invoice_id": {"type": "string"}},
            "optional": {"note": {"type": "string", "default": "none"}},
        });
        let flat = normalize_variables_schema(Some(&raw));
        assert_eq!(flat["invoice_id"]["required"], json!(true));
        assert_eq!(flat["note"]["required"], json!(false));
        assert_eq!(flat["note"]["default"], json!("none"));
    }
}
