//! Logic, loop, human-approval, and terminate executors.

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::compiler::ir::{
    HumanApprovalPayload, IrNode, LogicPayload, LoopPayload, TerminatePayload,
};
use crate::error::{OrchError, OrchResult};
use crate::events::{EventType, RunEvent};
use crate::executors::ExecCtx;
use crate::expression::evaluate_condition;
use crate::state::{AwaitingApproval, RunState};
use crate::template::render_str;
use crate::types::{Approval, ApprovalStatus};

// ─── Logic ────────────────────────────────────────────────────

/// Evaluate rules in order; first match wins. Unmatched with no default
/// routes to END (next_node_id stays None).
pub fn execute_logic(
    _ctx: &ExecCtx,
    node: &IrNode,
    payload: &LogicPayload,
    state: &mut RunState,
) -> OrchResult<()> {
    let template_ctx = state.template_context();
    for rule in &payload.rules {
        if evaluate_condition(&rule.condition, &template_ctx) {
            tracing::debug!(
                node_id = %node.node_id,
                condition = %rule.condition,
                next = %rule.next_node_id,
                "logic rule matched"
            );
            state.next_node_id = Some(rule.next_node_id.clone());
            return Ok(());
        }
    }
    state.next_node_id = payload.default_next_node_id.clone();
    Ok(())
}

// ─── Loop ─────────────────────────────────────────────────────

/// Route to the body while items (and the iteration budget) remain; reset
/// and fall through to the exit edge on exhaustion.
pub async fn execute_loop(
    ctx: &ExecCtx,
    node: &IrNode,
    payload: &LoopPayload,
    state: &mut RunState,
) -> OrchResult<()> {
    ctx.check_cancelled()?;

    let items: Vec<Value> = state
        .vars
        .get(&payload.iterator_var)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let index = state.loop_index;
    let within_budget = payload
        .max_iterations
        .map(|max| index < max)
        .unwrap_or(true);

    if index < items.len() && within_budget {
        let item = items[index].clone();
        ctx.emit(
            RunEvent::of(EventType::LoopIteration)
                .node(&node.node_id)
                .payload(json!({
                    "iteration": index,
                    "total": items.len(),
                    "item": item,
                })),
        )
        .await?;

        if !payload.item_variable.is_empty() {
            state.set_var(&payload.item_variable, item.clone());
        }
        if let Some(index_variable) = &payload.index_variable {
            state.set_var(index_variable, json!(index));
        }
        state.loop_item = Some(item);
        // Advance the cursor now so the next entry (after the body chain
        // routes back here) picks up the following item.
        state.loop_index = index + 1;
        state.active_loop = Some(node.node_id.clone());
        state.next_node_id = Some(payload.body_node_id.clone());
    } else {
        state.loop_index = 0;
        state.loop_item = None;
        state.active_loop = None;
        state.next_node_id = payload.next_node_id.clone();
    }
    Ok(())
}

// ─── Human approval ───────────────────────────────────────────

/// First entry: persist a pending approval, emit `approval_requested`, and
/// reify the suspension in state. Re-entry after a decision: route to
/// on_approve / on_reject / on_timeout.
pub async fn execute_human_approval(
    ctx: &ExecCtx,
    node: &IrNode,
    payload: &HumanApprovalPayload,
    state: &mut RunState,
) -> OrchResult<()> {
    ctx.check_cancelled()?;

    // Resuming: inspect the recorded decision.
    if let Some(awaiting) = state.awaiting_approval.clone() {
        if awaiting.node_id == node.node_id {
            let approval_id = Uuid::parse_str(&awaiting.approval_id)
                .map_err(|e| OrchError::internal(format!("bad approval id in state: {e}")))?;
            let approval = ctx
                .env
                .store
                .get_approval(approval_id)
                .await
                .map_err(|e| OrchError::internal(format!("approval lookup failed: {e:#}")))?
                .ok_or_else(|| {
                    OrchError::internal(format!("approval {approval_id} vanished while paused"))
                })?;

            if approval.status == ApprovalStatus::Pending {
                // Decision not recorded yet: stay suspended.
                return Ok(());
            }

            let decision = approval.status.as_str().to_string();
            ctx.emit(
                RunEvent::of(EventType::ApprovalDecisionReceived)
                    .node(&node.node_id)
                    .payload(json!({
                        "approval_id": awaiting.approval_id,
                        "decision": decision,
                        "decided_by": approval.decided_by,
                    })),
            )
            .await?;

            state.set_var("approval_decision", json!(decision));
            if let Some(decision_payload) = approval.decision_payload {
                state.set_var("approval_payload", decision_payload);
            }
            state.approval_decision = Some(decision.clone());
            state.awaiting_approval = None;
            state.next_node_id = route_for_decision(payload, &decision);
            return Ok(());
        }
    }

    // First entry: create the pending approval and suspend.
    let approval = Approval {
        approval_id: Uuid::now_v7(),
        run_id: ctx.run_id,
        node_id: node.node_id.clone(),
        prompt: render_str(&payload.prompt, &state.template_context()),
        decision_type: payload.decision_type.clone(),
        options: payload.options.clone(),
        context_data: payload.context_data.clone(),
        status: ApprovalStatus::Pending,
        decided_by: None,
        decision_payload: None,
        created_at: Utc::now(),
        decided_at: None,
    };
    ctx.env
        .store
        .create_approval(&approval)
        .await
        .map_err(|e| OrchError::internal(format!("failed to create approval: {e:#}")))?;

    ctx.emit(
        RunEvent::of(EventType::ApprovalRequested)
            .node(&node.node_id)
            .payload(json!({
                "approval_id": approval.approval_id,
                "prompt": approval.prompt,
                "decision_type": approval.decision_type,
                "options": approval.options,
            })),
    )
    .await?;

    state.awaiting_approval = Some(AwaitingApproval {
        approval_id: approval.approval_id.to_string(),
        node_id: node.node_id.clone(),
        prompt: approval.prompt,
        decision_type: approval.decision_type,
    });
    Ok(())
}

fn route_for_decision(payload: &HumanApprovalPayload, decision: &str) -> Option<String> {
    match decision {
        "approved" | "approve" => payload.on_approve.clone(),
        "timed_out" | "timeout" => payload.on_timeout.clone(),
        _ => payload.on_reject.clone(),
    }
}

// ─── Terminate ────────────────────────────────────────────────

/// Render declared outputs into vars, record the terminal status, and route
/// to END.
pub fn execute_terminate(
    node: &IrNode,
    payload: &TerminatePayload,
    state: &mut RunState,
) -> OrchResult<()> {
    let template_ctx = state.template_context();
    for (name, expression) in &payload.outputs {
        let rendered = render_str(expression, &template_ctx);
        state.set_var(name, json!(rendered));
    }
    tracing::debug!(node_id = %node.node_id, status = %payload.status, "terminating run");
    state.terminal_status = Some(payload.status.clone());
    state.next_node_id = None;
    Ok(())
}
