//! Processing, verification, llm-action, transform, and subflow executors.

use std::collections::HashSet;

use serde_json::{json, Map, Value};
use tracing::warn;

use crate::compiler;
use crate::compiler::ir::{
    IrNode, IrStep, LlmActionPayload, ProcessingPayload, SequencePayload, SubflowFailure,
    SubflowPayload, TransformPayload, VerificationPayload,
};
use crate::error::{OrchError, OrchResult};
use crate::events::{EventType, RunEvent};
use crate::executors::{sequence, ExecCtx};
use crate::expression::evaluate_condition;
use crate::runner::{run_subgraph, RunOutcome};
use crate::state::RunState;
use crate::template::{render_map, render_str};
use crate::types::{Run, RunStatus};

// ─── Processing ───────────────────────────────────────────────

/// Run a list of internal data operations in order.
pub async fn execute_processing(
    ctx: &ExecCtx,
    node: &IrNode,
    payload: &ProcessingPayload,
    state: &mut RunState,
) -> OrchResult<()> {
    for op in &payload.operations {
        ctx.check_cancelled()?;
        tracing::debug!(node_id = %node.node_id, action = %op.action, "processing operation");
        let template_ctx = state.template_context();
        let params = render_map(&op.params, &template_ctx);
        let result = sequence::execute_internal_action(&op.action, &params, state).await?;
        if let Some(output_variable) = params.get("output_variable").and_then(Value::as_str) {
            state.set_var(output_variable, result);
        }
    }
    Ok(())
}

// ─── Verification ─────────────────────────────────────────────

/// Evaluate each check against the current state. A failing check with
/// `on_fail = fail_workflow` fails the node; otherwise the failure is
/// recorded in telemetry and execution continues.
pub fn execute_verification(
    node: &IrNode,
    payload: &VerificationPayload,
    state: &mut RunState,
) -> OrchResult<()> {
    let template_ctx = state.template_context();
    for check in &payload.checks {
        if evaluate_condition(&check.condition, &template_ctx) {
            continue;
        }
        let message = if check.message.is_empty() {
            format!("verification check '{}' failed", check.id)
        } else {
            render_str(&check.message, &template_ctx)
        };
        if check.on_fail == "fail_workflow" {
            return Err(OrchError::validation(message));
        }
        warn!(node_id = %node.node_id, check = %check.id, "verification check failed (continuing)");
        let failures = state
            .telemetry
            .entry("verification_failures".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = failures {
            items.push(json!({"check": check.id, "message": message}));
        }
    }
    Ok(())
}

// ─── LLM action ───────────────────────────────────────────────

/// LLM actions are ordinary dispatches: the prompt is rendered and the call
/// goes through the resolver like any other step, so an `llm`-channel agent
/// (or the tool fallback) serves it. No bespoke client.
pub async fn execute_llm_action(
    ctx: &ExecCtx,
    node: &IrNode,
    payload: &LlmActionPayload,
    state: &mut RunState,
) -> OrchResult<()> {
    let mut params = Map::new();
    params.insert("prompt".to_string(), json!(payload.prompt));
    params.insert("model".to_string(), json!(payload.model));
    params.insert("temperature".to_string(), json!(payload.temperature));
    params.insert("json_mode".to_string(), json!(payload.json_mode));
    if let Some(max_tokens) = payload.max_tokens {
        params.insert("max_tokens".to_string(), json!(max_tokens));
    }
    if let Some(system_prompt) = &payload.system_prompt {
        params.insert("system_prompt".to_string(), json!(system_prompt));
    }

    let step = IrStep {
        step_id: format!("{}_generate", node.node_id),
        action: "generate".to_string(),
        params,
        output_variable: payload.output_variable.clone(),
        ..Default::default()
    };
    let synthetic = SequencePayload {
        steps: vec![step],
        error_handlers: Vec::new(),
    };
    sequence::execute(ctx, node, &synthetic, state).await
}

// ─── Transform ────────────────────────────────────────────────

/// Apply template transformations over state variables. Rendered output
/// that parses as JSON is stored structurally, otherwise as a string.
pub fn execute_transform(
    node: &IrNode,
    payload: &TransformPayload,
    state: &mut RunState,
) -> OrchResult<()> {
    for op in &payload.transformations {
        let template_ctx = state.template_context();
        if !op.source_variable.is_empty() && !state.vars.contains_key(&op.source_variable) {
            warn!(
                node_id = %node.node_id,
                source = %op.source_variable,
                "transform source variable is missing"
            );
        }
        let rendered = render_str(&op.expression, &template_ctx);
        let value = serde_json::from_str(&rendered).unwrap_or(Value::String(rendered));
        state.set_var(&op.output_variable, value);
    }
    Ok(())
}

// ─── Subflow ──────────────────────────────────────────────────

/// Run a child procedure inline: create a child run, forward mapped inputs,
/// execute its graph to terminal, and map outputs back into the parent.
pub async fn execute_subflow(
    ctx: &ExecCtx,
    node: &IrNode,
    payload: &SubflowPayload,
    state: &mut RunState,
) -> OrchResult<()> {
    ctx.check_cancelled()?;
    let store = &ctx.env.store;

    let record = store
        .get_procedure(&payload.procedure_id, payload.version.as_deref())
        .await
        .map_err(OrchError::from)?
        .ok_or_else(|| {
            OrchError::validation(format!(
                "subflow procedure '{}' not found",
                payload.procedure_id
            ))
        })?;

    let known: HashSet<String> = store
        .list_procedure_ids()
        .await
        .map_err(OrchError::from)?
        .into_iter()
        .collect();
    let child_ir = compiler::compile(&record.definition, &known)?;

    // Forward mapped inputs (child var ← rendered parent expression).
    let template_ctx = state.template_context();
    let mut child_vars = Map::new();
    for (child_var, expression) in &payload.input_mapping {
        let rendered = render_str(expression, &template_ctx);
        let value = serde_json::from_str(&rendered).unwrap_or(Value::String(rendered));
        child_vars.insert(child_var.clone(), value);
    }

    let child_run = Run::new(&record.procedure_id, &record.version, None);
    store.create_run(&child_run).await.map_err(OrchError::from)?;
    store
        .append_event(
            child_run.run_id,
            &RunEvent::of(EventType::RunCreated).payload(json!({
                "parent_run_id": state.run_id,
                "parent_node_id": node.node_id,
            })),
        )
        .await
        .map_err(OrchError::from)?;
    store
        .update_run_status(child_run.run_id, RunStatus::Running)
        .await
        .map_err(OrchError::from)?;

    let mut child_state = RunState::new(
        &child_run.run_id.to_string(),
        &record.procedure_id,
        &record.version,
    );
    child_state.vars = child_vars;
    child_state.secrets = state.secrets.clone();

    let outcome = run_subgraph(
        ctx.env.clone(),
        std::sync::Arc::new(child_ir),
        child_state,
        None,
        Some(child_run.thread_id.clone()),
    )
    .await;

    match outcome {
        Ok((child_state, RunOutcome::Completed)) => {
            store
                .update_run_status(child_run.run_id, RunStatus::Completed)
                .await
                .map_err(OrchError::from)?;
            store
                .append_event(child_run.run_id, &RunEvent::of(EventType::RunCompleted))
                .await
                .map_err(OrchError::from)?;
            for (parent_var, child_var) in &payload.output_mapping {
                let value = child_state
                    .vars
                    .get(child_var)
                    .cloned()
                    .unwrap_or(Value::Null);
                state.set_var(parent_var, value);
            }
            Ok(())
        }
        Ok((_, RunOutcome::Suspended(_))) => {
            let err = OrchError::internal(format!(
                "subflow '{}' suspended; approvals inside subflows are not supported",
                payload.procedure_id
            ));
            fail_child(ctx, child_run.run_id, &err).await;
            Err(err)
        }
        Err(err) => {
            fail_child(ctx, child_run.run_id, &err).await;
            match payload.on_failure {
                SubflowFailure::FailParent => Err(err),
                SubflowFailure::Ignore => {
                    warn!(
                        node_id = %node.node_id,
                        procedure_id = %payload.procedure_id,
                        error = %err,
                        "subflow failed; parent continues"
                    );
                    Ok(())
                }
            }
        }
    }
}

async fn fail_child(ctx: &ExecCtx, child_run_id: uuid::Uuid, err: &OrchError) {
    let store = &ctx.env.store;
    if let Err(e) = store.update_run_status(child_run_id, RunStatus::Failed).await {
        warn!(%child_run_id, error = %e, "failed to mark child run failed");
    }
    let _ = store.set_run_error(child_run_id, &err.message).await;
    let _ = store
        .append_event(
            child_run_id,
            &RunEvent::of(EventType::RunFailed)
                .payload(json!({"error_kind": err.kind.as_str(), "message": err.message})),
        )
        .await;
}
