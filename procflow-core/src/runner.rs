//! Graph runner: drives a compiled procedure graph over the single run
//! state, handling conditional routing, checkpointing, and suspension.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::compiler::ir::{IrProcedure, NodePayload};
use crate::env::RunnerEnv;
use crate::error::{OrchError, OrchResult};
use crate::events::{EventType, RunEvent};
use crate::executors::{execute_node, ExecCtx};
use crate::state::{ErrorInfo, RunState};

/// Backstop against malformed graphs that cycle without a loop budget.
const MAX_NODE_TRANSITIONS: usize = 10_000;

/// Why a graph parked instead of finishing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Suspension {
    /// Paused for a human decision.
    Approval,
    /// Paused for an asynchronously delegated workflow.
    Workflow,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Suspended(Suspension),
}

/// Boxed entry point used wherever the graph recurses into itself
/// (parallel branches, subflows).
pub fn run_subgraph(
    env: Arc<RunnerEnv>,
    ir: Arc<IrProcedure>,
    state: RunState,
    entry: Option<String>,
    thread_id: Option<String>,
) -> Pin<Box<dyn Future<Output = OrchResult<(RunState, RunOutcome)>> + Send>> {
    Box::pin(run_graph(env, ir, state, entry, thread_id))
}

/// Execute the graph from `entry` (or the procedure start) until it
/// completes, suspends, or fails.
///
/// When `thread_id` is set, a checkpoint is written after every node with
/// `is_checkpoint = true` and on suspension. Branch/recovery sub-graphs run
/// with `thread_id = None` (or their own thread) so checkpoints never mix.
pub async fn run_graph(
    env: Arc<RunnerEnv>,
    ir: Arc<IrProcedure>,
    mut state: RunState,
    entry: Option<String>,
    thread_id: Option<String>,
) -> OrchResult<(RunState, RunOutcome)> {
    let run_id = Uuid::parse_str(&state.run_id)
        .map_err(|e| OrchError::internal(format!("state carries a bad run id: {e}")))?;
    let ctx = ExecCtx {
        env: env.clone(),
        ir: ir.clone(),
        run_id,
    };

    let mut current = entry.unwrap_or_else(|| ir.start_node_id.clone());
    if current.is_empty() {
        return Err(OrchError::validation("procedure has no start node"));
    }

    let mut transitions = 0usize;
    loop {
        transitions += 1;
        if transitions > MAX_NODE_TRANSITIONS {
            return Err(OrchError::internal(format!(
                "node transition limit exceeded at '{current}'"
            )));
        }

        ctx.check_cancelled()?;

        let node = ir
            .nodes
            .get(&current)
            .ok_or_else(|| OrchError::validation(format!("node '{current}' does not exist")))?
            .clone();
        state.current_node_id = current.clone();

        // Re-entering the node a delegated workflow suspended on clears the
        // reified suspension; the step's idempotency record carries the
        // delegated result.
        if state
            .workflow_pending
            .as_ref()
            .map(|wp| wp.resume_node == current)
            .unwrap_or(false)
        {
            state.workflow_pending = None;
        }

        debug!(node_id = %current, node_type = node.payload.type_name(), "executing node");

        if let Err(err) = execute_node(&ctx, &node, &mut state).await {
            // A failing loop body routes back to its loop when the loop
            // collects errors instead of failing.
            if let Some(loop_node_id) = state.active_loop.clone() {
                if err.kind != crate::error::ErrorKind::Cancelled
                    && loop_continues_on_error(&ir, &loop_node_id)
                {
                    warn!(
                        loop_node = %loop_node_id,
                        failed_node = %current,
                        error = %err,
                        "loop body failed; continuing"
                    );
                    state.loop_results.push(json!({
                        "iteration": state.loop_index.saturating_sub(1),
                        "error_kind": err.kind.as_str(),
                        "message": err.message,
                    }));
                    state.next_node_id = None;
                    current = loop_node_id;
                    continue;
                }
            }

            state.error = Some(ErrorInfo {
                kind: err.kind.as_str().to_string(),
                message: err.message.clone(),
                node_id: Some(current.clone()),
                step_id: state.current_step_id.clone(),
            });
            return Err(err);
        }

        // Suspensions park the graph; the worker releases the job.
        if state.awaiting_approval.is_some() {
            checkpoint(&ctx, thread_id.as_deref(), &state).await?;
            return Ok((state, RunOutcome::Suspended(Suspension::Approval)));
        }
        if state.workflow_pending.is_some() {
            checkpoint(&ctx, thread_id.as_deref(), &state).await?;
            return Ok((state, RunOutcome::Suspended(Suspension::Workflow)));
        }

        if node.is_checkpoint {
            checkpoint(&ctx, thread_id.as_deref(), &state).await?;
        }

        if state.terminal_status.is_some() {
            return Ok((state, RunOutcome::Completed));
        }

        // Routing: executor-set key first, then the node's static successor,
        // then the payload default. Nothing left = END.
        let next = state
            .next_node_id
            .take()
            .or_else(|| node.next_node_id.clone())
            .or_else(|| node.payload.next_node_id().map(str::to_string));

        match next {
            Some(next_id) if !next_id.is_empty() => current = next_id,
            _ => return Ok((state, RunOutcome::Completed)),
        }
    }
}

fn loop_continues_on_error(ir: &IrProcedure, loop_node_id: &str) -> bool {
    matches!(
        ir.nodes.get(loop_node_id).map(|n| &n.payload),
        Some(NodePayload::Loop(payload)) if payload.continue_on_error
    )
}

async fn checkpoint(ctx: &ExecCtx, thread_id: Option<&str>, state: &RunState) -> OrchResult<()> {
    let Some(thread_id) = thread_id else {
        return Ok(());
    };
    let saved = ctx
        .env
        .store
        .put_checkpoint(thread_id, state)
        .await
        .map_err(|e| OrchError::internal(format!("checkpoint write failed: {e:#}")))?;
    ctx.emit(
        RunEvent::of(EventType::CheckpointSaved)
            .node(&state.current_node_id)
            .payload(json!({"checkpoint_id": saved.checkpoint_id, "step": saved.step})),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler;
    use crate::config::Settings;
    use crate::store::OrchStore;
    use crate::store_memory::MemoryStore;
    use serde_json::json;
    use std::collections::HashSet;

    fn setup(
        definition: serde_json::Value,
    ) -> (Arc<RunnerEnv>, Arc<IrProcedure>, Arc<dyn OrchStore>) {
        let store: Arc<dyn OrchStore> = Arc::new(MemoryStore::new());
        let env = RunnerEnv::new(store.clone(), Settings::default());
        let ir = Arc::new(compiler::compile(&definition, &HashSet::new()).unwrap());
        (env, ir, store)
    }

    fn fresh_state(ir: &IrProcedure) -> RunState {
        RunState::new(
            &Uuid::now_v7().to_string(),
            &ir.procedure_id,
            &ir.version,
        )
    }

    #[tokio::test]
    async fn runs_a_linear_graph_to_completion() {
        let (env, ir, _store) = setup(json!({
            "procedure_id": "p", "version": "1",
            "workflow_graph": {"start_node": "a", "nodes": {
                "a": {"type": "sequence", "next_node": "b", "steps": [
                    {"step_id": "s1", "action": "set_variable", "name": "x", "value": 1},
                ]},
                "b": {"type": "terminate", "status": "success"},
            }},
        }));
        let state = fresh_state(&ir);
        let (state, outcome) = run_graph(env, ir, state, None, None).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(state.terminal_status.as_deref(), Some("success"));
        assert_eq!(state.vars["x"], json!(1));
    }

    #[tokio::test]
    async fn logic_routes_via_state_key() {
        let (env, ir, _store) = setup(json!({
            "procedure_id": "p", "version": "1",
            "workflow_graph": {"start_node": "set", "nodes": {
                "set": {"type": "sequence", "next_node": "gate", "steps": [
                    {"step_id": "s1", "action": "set_variable",
                     "name": "status", "value": "won"},
                ]},
                "gate": {"type": "logic", "rules": [
                    {"condition": "{{status}} == 'won'", "next_node": "happy"},
                ], "default_next_node": "sad"},
                "happy": {"type": "terminate", "status": "success"},
                "sad": {"type": "terminate", "status": "failure"},
            }},
        }));
        let state = fresh_state(&ir);
        let (state, _) = run_graph(env, ir, state, None, None).await.unwrap();
        assert_eq!(state.terminal_status.as_deref(), Some("success"));
    }

    #[tokio::test]
    async fn loop_iterates_body_per_item() {
        let (env, ir, store) = setup(json!({
            "procedure_id": "p", "version": "1",
            "workflow_graph": {"start_node": "seed", "nodes": {
                "seed": {"type": "sequence", "next_node": "each", "steps": [
                    {"step_id": "s1", "action": "set_variable",
                     "name": "items", "value": ["x", "y", "z"]},
                ]},
                "each": {"type": "loop", "iterator": "items",
                         "iterator_variable": "item", "body_node": "body",
                         "next_node": "end"},
                "body": {"type": "sequence", "next_node": "each", "steps": [
                    {"step_id": "b1", "action": "log", "message": "{{item}}"},
                ]},
                "end": {"type": "terminate"},
            }},
        }));
        let state = fresh_state(&ir);
        let run_id = Uuid::parse_str(&state.run_id).unwrap();
        let (state, outcome) = run_graph(env, ir, state, None, None).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(state.loop_index, 0);

        let events = store.list_events(run_id, 0).await.unwrap();
        let iterations = events
            .iter()
            .filter(|(_, e)| e.event_type == EventType::LoopIteration)
            .count();
        assert_eq!(iterations, 3);
    }

    #[tokio::test]
    async fn continue_on_error_collects_body_failures() {
        let (env, ir, _store) = setup(json!({
            "procedure_id": "p", "version": "1",
            "workflow_graph": {"start_node": "seed", "nodes": {
                "seed": {"type": "sequence", "next_node": "each", "steps": [
                    {"step_id": "s1", "action": "set_variable",
                     "name": "items", "value": [1, 2]},
                ]},
                "each": {"type": "loop", "iterator": "items",
                         "iterator_variable": "item", "body_node": "body",
                         "continue_on_error": true, "next_node": "end"},
                // Body always fails: no agent is registered for "web".
                "body": {"type": "sequence", "agent": "web", "next_node": "each",
                         "steps": [{"step_id": "b1", "action": "click"}]},
                "end": {"type": "terminate"},
            }},
        }));
        let state = fresh_state(&ir);
        let (state, outcome) = run_graph(env, ir, state, None, None).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(state.loop_results.len(), 2);
        assert_eq!(state.loop_results[0]["error_kind"], json!("no-executor"));
    }

    #[tokio::test]
    async fn checkpoint_nodes_snapshot_state() {
        let (env, ir, store) = setup(json!({
            "procedure_id": "p", "version": "1",
            "workflow_graph": {"start_node": "a", "nodes": {
                "a": {"type": "sequence", "is_checkpoint": true, "next_node": "b",
                      "steps": [{"step_id": "s1", "action": "set_variable",
                                 "name": "x", "value": 42}]},
                "b": {"type": "terminate"},
            }},
        }));
        let state = fresh_state(&ir);
        let thread = state.run_id.clone();
        run_graph(env, ir, state, None, Some(thread.clone()))
            .await
            .unwrap();

        let checkpoints = store.list_checkpoints(&thread).await.unwrap();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].state.vars["x"], json!(42));
        assert_eq!(checkpoints[0].step, 1);
    }

    #[tokio::test]
    async fn approval_suspends_with_checkpoint() {
        let (env, ir, store) = setup(json!({
            "procedure_id": "p", "version": "1",
            "workflow_graph": {"start_node": "gate", "nodes": {
                "gate": {"type": "human_approval", "prompt": "ok?",
                         "on_approve": "end", "on_reject": "end"},
                "end": {"type": "terminate"},
            }},
        }));
        let state = fresh_state(&ir);
        let thread = state.run_id.clone();
        let (state, outcome) = run_graph(env, ir, state, None, Some(thread.clone()))
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Suspended(Suspension::Approval));
        assert!(state.awaiting_approval.is_some());

        // The suspension checkpoint is restorable.
        let latest = store.get_checkpoint(&thread, None).await.unwrap().unwrap();
        assert!(latest.state.awaiting_approval.is_some());
    }

    #[tokio::test]
    async fn missing_node_is_a_validation_error() {
        let (env, ir, _store) = setup(json!({
            "procedure_id": "p", "version": "1",
            "workflow_graph": {"start_node": "a", "nodes": {
                "a": {"type": "terminate"},
            }},
        }));
        let state = fresh_state(&ir);
        let err = run_graph(env, ir, state, Some("ghost".to_string()), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn failure_records_error_info_in_kind() {
        let (env, ir, _store) = setup(json!({
            "procedure_id": "p", "version": "1",
            "workflow_graph": {"start_node": "a", "nodes": {
                "a": {"type": "sequence", "agent": "web",
                      "steps": [{"step_id": "s1", "action": "click"}]},
            }},
        }));
        let state = fresh_state(&ir);
        let err = run_graph(env, ir, state, None, None).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NoExecutor);
    }
}
