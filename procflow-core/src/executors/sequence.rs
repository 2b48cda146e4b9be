//! Sequence executor: runs a node's steps in order against the resolved
//! executors, with idempotent replay, resource leasing, rate limiting,
//! per-step retry, and node-level error handlers.

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::compiler::ir::{
    DispatchMode, HandlerAction, IrErrorHandler, IrNode, IrStep, SequencePayload,
};
use crate::dispatch::{resolve_executor, AgentClient, Resolution};
use crate::error::{ErrorKind, OrchError, OrchResult};
use crate::events::{EventType, RunEvent};
use crate::executors::ExecCtx;
use crate::state::{RunState, WorkflowPending};
use crate::template::render_map;
use crate::types::{IdempotencyStatus, StepIdempotency};

/// How often a blocked lease acquisition re-polls the store.
const LEASE_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Control flow after one step completes.
enum StepFlow {
    Continue,
    /// Async workflow delegation: stop here, the runner suspends the graph.
    Suspend,
    /// An error handler routed to a fallback node.
    Reroute,
}

pub async fn execute(
    ctx: &ExecCtx,
    node: &IrNode,
    payload: &SequencePayload,
    state: &mut RunState,
) -> OrchResult<()> {
    for step in &payload.steps {
        match run_step_with_policy(ctx, node, payload, step, state).await? {
            StepFlow::Continue => continue,
            StepFlow::Suspend | StepFlow::Reroute => return Ok(()),
        }
    }
    Ok(())
}

/// Retry/error-handler wrapper around a single step.
async fn run_step_with_policy(
    ctx: &ExecCtx,
    node: &IrNode,
    payload: &SequencePayload,
    step: &IrStep,
    state: &mut RunState,
) -> OrchResult<StepFlow> {
    let retry = ctx.ir.retry_for(step);
    let mut attempt: u32 = 0;
    let mut handler_retries: u32 = 0;

    loop {
        attempt += 1;
        let err = match run_step_once(ctx, node, step, state, attempt).await {
            Ok(flow) => return Ok(flow),
            Err(err) => err,
        };

        // Cancellation unwinds immediately: no retries, no handlers.
        if err.kind == ErrorKind::Cancelled {
            return Err(err);
        }

        ctx.emit(
            RunEvent::of(EventType::StepFailed)
                .node(&node.node_id)
                .step(&step.step_id)
                .attempt(attempt)
                .payload(json!({"error_kind": err.kind.as_str(), "message": err.message})),
        )
        .await?;

        // Per-step retry policy wraps the retryable kinds.
        if step.retry_on_failure && err.kind.is_retryable() && attempt <= retry.max_retries {
            ctx.emit(
                RunEvent::of(EventType::RetryAttempted)
                    .node(&node.node_id)
                    .step(&step.step_id)
                    .attempt(attempt)
                    .payload(json!({"error_kind": err.kind.as_str()})),
            )
            .await?;
            tokio::time::sleep(backoff_with_jitter(retry.base_delay_ms, attempt)).await;
            continue;
        }

        // Retries exhausted: consult node error handlers by error kind.
        let Some(handler) = find_handler(&payload.error_handlers, err.kind) else {
            return Err(err);
        };

        run_recovery_steps(ctx, node, handler, state).await;

        match handler.action {
            HandlerAction::Retry if handler_retries < handler.max_retries => {
                handler_retries += 1;
                if handler.delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(handler.delay_ms)).await;
                }
                continue;
            }
            HandlerAction::Retry | HandlerAction::Fail => return Err(err),
            HandlerAction::Ignore => {
                warn!(
                    node_id = %node.node_id,
                    step_id = %step.step_id,
                    error = %err,
                    "error handler ignored step failure"
                );
                return Ok(StepFlow::Continue);
            }
            HandlerAction::Fallback => {
                state.next_node_id = handler.fallback_node.clone();
                return Ok(StepFlow::Reroute);
            }
            HandlerAction::Escalate => {
                ctx.emit(
                    RunEvent::of(EventType::StepFailed)
                        .node(&node.node_id)
                        .step(&step.step_id)
                        .payload(json!({
                            "escalated": true,
                            "error_kind": err.kind.as_str(),
                            "message": err.message,
                        })),
                )
                .await?;
                return Err(err);
            }
        }
    }
}

/// One attempt at one step: cancellation check → replay cache → pre-delay →
/// render → resolve → lease → rate limit → dispatch → record → post-delay.
async fn run_step_once(
    ctx: &ExecCtx,
    node: &IrNode,
    step: &IrStep,
    state: &mut RunState,
    attempt: u32,
) -> OrchResult<StepFlow> {
    ctx.check_cancelled()?;
    state.current_step_id = Some(step.step_id.clone());

    // Replay: a succeeded record returns the cached result without touching
    // the network.
    if let Some(record) = idem_get(ctx, &node.node_id, &step.step_id).await? {
        if record.status == IdempotencyStatus::Succeeded {
            let cached = record
                .result_json
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or(Value::Null);
            store_step_output(step, state, &cached);
            ctx.emit(
                RunEvent::of(EventType::StepCompleted)
                    .node(&node.node_id)
                    .step(&step.step_id)
                    .payload(json!({"action": step.action, "cached": true, "result": cached})),
            )
            .await?;
            return Ok(StepFlow::Continue);
        }
    }

    if let Some(wait_ms) = step.wait_ms {
        tokio::time::sleep(Duration::from_millis(wait_ms)).await;
    }

    let template_ctx = state.template_context();
    let params = render_map(&step.params, &template_ctx);

    let resolution = resolve_executor(&ctx.env, node, step).await?;
    let external = !matches!(resolution, Resolution::Internal { .. });

    ctx.emit(
        RunEvent::of(EventType::StepStarted)
            .node(&node.node_id)
            .step(&step.step_id)
            .attempt(attempt)
            .payload(json!({"action": step.action})),
    )
    .await?;

    if external {
        idem_put(ctx, node, step, IdempotencyStatus::Started, None).await?;

        // Async workflow delegation: fire the dispatch detached, reify the
        // suspension, and let the runner park the graph.
        let mode = step
            .workflow_dispatch_mode
            .or(ctx.ir.global_config.workflow_dispatch_mode)
            .unwrap_or_default();
        if mode == DispatchMode::Async {
            spawn_delegated_dispatch(ctx, node, step, &resolution, params.clone());
            ctx.emit(
                RunEvent::of(EventType::WorkflowDelegated)
                    .node(&node.node_id)
                    .step(&step.step_id)
                    .payload(json!({"action": step.action, "dispatch_mode": "async"})),
            )
            .await?;
            state.workflow_pending = Some(WorkflowPending {
                resume_node: node.node_id.clone(),
                resume_step: step.step_id.clone(),
            });
            return Ok(StepFlow::Suspend);
        }
    }

    // Per-channel lease gates concurrency on the agent's resource pool.
    let lease = match &resolution {
        Resolution::Agent { agent } => Some(
            acquire_lease_with_budget(ctx, &agent.resource_key, &node.node_id, &step.step_id)
                .await?,
        ),
        _ => None,
    };

    // Everything between lease acquisition and release must not early-return.
    let outcome = dispatch_step(ctx, node, step, state, &resolution, &params).await;

    if let Some(lease) = lease {
        if let Err(e) = ctx.env.store.release_lease(lease.lease_id).await {
            warn!(lease_id = %lease.lease_id, error = %e, "failed to release lease");
        }
    }

    let result = match outcome {
        Ok(result) => result,
        Err(err) => {
            if external {
                idem_put(
                    ctx,
                    node,
                    step,
                    IdempotencyStatus::Failed,
                    Some(json!({"error": err.message}).to_string()),
                )
                .await?;
            }
            return Err(err);
        }
    };

    store_step_output(step, state, &result);
    if external {
        idem_put(
            ctx,
            node,
            step,
            IdempotencyStatus::Succeeded,
            Some(result.to_string()),
        )
        .await?;
        collect_artifacts(ctx, node, step, state, &result).await;
    }

    ctx.emit(
        RunEvent::of(EventType::StepCompleted)
            .node(&node.node_id)
            .step(&step.step_id)
            .attempt(attempt)
            .payload(json!({"action": step.action, "result": result})),
    )
    .await?;

    if let Some(wait_after_ms) = step.wait_after_ms {
        tokio::time::sleep(Duration::from_millis(wait_after_ms)).await;
    }

    Ok(StepFlow::Continue)
}

/// Rate-limit the procedure, then run the step against its executor,
/// reporting agent outcomes to the circuit breaker.
async fn dispatch_step(
    ctx: &ExecCtx,
    node: &IrNode,
    step: &IrStep,
    state: &mut RunState,
    resolution: &Resolution,
    params: &Map<String, Value>,
) -> OrchResult<Value> {
    if let Some(rpm) = ctx.ir.global_config.rate_limit_per_minute {
        let deadline = node
            .sla_ms
            .map(Duration::from_millis)
            .unwrap_or(ctx.env.settings.rate_limit_timeout);
        ctx.env
            .rate_limiter
            .acquire(&ctx.ir.procedure_id, rpm, deadline)
            .await?;
    }

    let timeout = step
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(ctx.env.settings.agent_timeout);
    let run_id = state.run_id.clone();

    match resolution {
        Resolution::Internal { action } => execute_internal_action(action, params, state).await,
        Resolution::Agent { agent } => {
            let client = AgentClient::new(&ctx.env, &agent.base_url, timeout);
            let result = client
                .execute_action(&step.action, params, &run_id, &node.node_id, &step.step_id)
                .await;
            // Circuit accounting: failures open it, success closes it.
            let report = match &result {
                Ok(_) => ctx.env.store.record_agent_success(&agent.agent_id).await,
                Err(_) => {
                    ctx.env
                        .store
                        .record_agent_failure(
                            &agent.agent_id,
                            ctx.env.settings.circuit_failure_threshold,
                        )
                        .await
                }
            };
            if let Err(e) = report {
                warn!(agent_id = %agent.agent_id, error = %e, "failed to record dispatch outcome");
            }
            result
        }
        Resolution::Tool { url } => {
            let client = AgentClient::new(&ctx.env, url, timeout);
            client
                .execute_action(&step.action, params, &run_id, &node.node_id, &step.step_id)
                .await
        }
    }
}

/// Detached dispatch for async workflow delegation. The result is reported
/// back through the event ingress, not here.
fn spawn_delegated_dispatch(
    ctx: &ExecCtx,
    node: &IrNode,
    step: &IrStep,
    resolution: &Resolution,
    params: Map<String, Value>,
) {
    let base_url = match resolution {
        Resolution::Agent { agent } => agent.base_url.clone(),
        Resolution::Tool { url } => url.clone(),
        Resolution::Internal { .. } => return,
    };
    let env = ctx.env.clone();
    let action = step.action.clone();
    let run_id = ctx.run_id.to_string();
    let node_id = node.node_id.clone();
    let step_id = step.step_id.clone();
    let timeout = step
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(env.settings.agent_timeout);

    tokio::spawn(async move {
        let client = AgentClient::new(&env, &base_url, timeout);
        if let Err(e) = client
            .execute_action(&action, &params, &run_id, &node_id, &step_id)
            .await
        {
            warn!(action, run_id, error = %e, "delegated workflow dispatch failed");
        }
    });
}

async fn acquire_lease_with_budget(
    ctx: &ExecCtx,
    resource_key: &str,
    node_id: &str,
    step_id: &str,
) -> OrchResult<crate::types::ResourceLease> {
    let deadline = Instant::now() + ctx.env.settings.lease_acquire_budget;
    loop {
        ctx.check_cancelled()?;
        let lease = ctx
            .env
            .store
            .try_acquire_lease(
                resource_key,
                ctx.run_id,
                Some(node_id),
                Some(step_id),
                ctx.env.settings.lease_ttl,
            )
            .await
            .map_err(|e| OrchError::internal(format!("lease acquisition failed: {e:#}")))?;
        if let Some(lease) = lease {
            return Ok(lease);
        }
        if Instant::now() + LEASE_RETRY_DELAY > deadline {
            return Err(OrchError::lease_timeout(resource_key));
        }
        tokio::time::sleep(LEASE_RETRY_DELAY).await;
    }
}

// ─── Internal actions ─────────────────────────────────────────

/// Actions the orchestrator executes in-process. Pure and cheap: they are
/// deliberately not covered by the idempotency ledger.
pub async fn execute_internal_action(
    action: &str,
    params: &Map<String, Value>,
    state: &mut RunState,
) -> OrchResult<Value> {
    match action {
        "log" => {
            let message = params
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default();
            info!(run_id = %state.run_id, "{message}");
            Ok(json!({"logged": message}))
        }
        "wait" => {
            let ms = params
                .get("duration_ms")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({"waited_ms": ms}))
        }
        "set_variable" => {
            let name = params.get("name").and_then(Value::as_str).ok_or_else(|| {
                OrchError::validation("set_variable requires a 'name' parameter")
            })?;
            let value = params.get("value").cloned().unwrap_or(Value::Null);
            state.set_var(name, value.clone());
            Ok(value)
        }
        "calculate" => {
            let op = params
                .get("operation")
                .and_then(Value::as_str)
                .unwrap_or("add");
            let operands: Vec<f64> = params
                .get("operands")
                .and_then(Value::as_array)
                .map(|ops| ops.iter().filter_map(Value::as_f64).collect())
                .unwrap_or_default();
            if operands.len() < 2 {
                return Err(OrchError::validation(
                    "calculate requires at least two numeric operands",
                ));
            }
            let result = match op {
                "add" => operands.iter().sum(),
                "subtract" => operands[1..].iter().fold(operands[0], |acc, x| acc - x),
                "multiply" => operands.iter().product(),
                "divide" => {
                    if operands[1..].iter().any(|x| *x == 0.0) {
                        return Err(OrchError::validation("calculate: division by zero"));
                    }
                    operands[1..].iter().fold(operands[0], |acc, x| acc / x)
                }
                other => {
                    return Err(OrchError::validation(format!(
                        "calculate: unknown operation '{other}'"
                    )))
                }
            };
            Ok(json!(result))
        }
        // Params were template-rendered before dispatch, so the template
        // parameter already holds the formatted text.
        "format_data" => Ok(params.get("template").cloned().unwrap_or(Value::Null)),
        "parse_json" => {
            let source = params
                .get("source")
                .and_then(Value::as_str)
                .ok_or_else(|| OrchError::validation("parse_json requires a 'source' string"))?;
            serde_json::from_str(source)
                .map_err(|e| OrchError::validation(format!("parse_json: invalid JSON: {e}")))
        }
        "generate_id" => Ok(json!(uuid::Uuid::now_v7().to_string())),
        "get_timestamp" => Ok(json!(Utc::now().to_rfc3339())),
        other => Err(OrchError::internal(format!(
            "unknown internal action '{other}'"
        ))),
    }
}

// ─── Helpers ──────────────────────────────────────────────────

/// Agents attach produced files as `artifacts: [{kind, uri}]` in their
/// result. Persist them against the run and mirror them into state.
async fn collect_artifacts(
    ctx: &ExecCtx,
    node: &IrNode,
    step: &IrStep,
    state: &mut RunState,
    result: &Value,
) {
    let Some(entries) = result.get("artifacts").and_then(Value::as_array) else {
        return;
    };
    for entry in entries {
        let Some(uri) = entry.get("uri").and_then(Value::as_str) else {
            continue;
        };
        let artifact = crate::types::Artifact {
            artifact_id: uuid::Uuid::now_v7(),
            run_id: ctx.run_id,
            node_id: Some(node.node_id.clone()),
            step_id: Some(step.step_id.clone()),
            kind: entry
                .get("kind")
                .and_then(Value::as_str)
                .unwrap_or("file")
                .to_string(),
            uri: uri.to_string(),
            created_at: Utc::now(),
        };
        if let Err(e) = ctx.env.store.add_artifact(&artifact).await {
            warn!(uri, error = %e, "failed to persist artifact");
            continue;
        }
        state
            .artifacts
            .push(json!({"kind": artifact.kind, "uri": artifact.uri, "step_id": step.step_id}));
    }
}

fn store_step_output(step: &IrStep, state: &mut RunState, result: &Value) {
    if let Some(output_variable) = &step.output_variable {
        state.set_var(output_variable, result.clone());
    }
}

fn find_handler(handlers: &[IrErrorHandler], kind: ErrorKind) -> Option<&IrErrorHandler> {
    handlers
        .iter()
        .find(|h| h.error_kind == kind.as_str() || h.error_kind == "*")
}

/// Recovery steps run best-effort before the handler's action is taken;
/// their own failures are logged, never propagated.
async fn run_recovery_steps(
    ctx: &ExecCtx,
    node: &IrNode,
    handler: &IrErrorHandler,
    state: &mut RunState,
) {
    for step in &handler.recovery_steps {
        let template_ctx = state.template_context();
        let params = render_map(&step.params, &template_ctx);
        match execute_internal_action(&step.action, &params, state).await {
            Ok(result) => store_step_output(step, state, &result),
            Err(e) => warn!(
                node_id = %node.node_id,
                step_id = %step.step_id,
                error = %e,
                "recovery step failed"
            ),
        }
    }
}

fn backoff_with_jitter(base_ms: u64, attempt: u32) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << (attempt - 1).min(8));
    let jitter = rand::thread_rng().gen_range(0..=exp / 4 + 1);
    Duration::from_millis(exp + jitter)
}

async fn idem_get(
    ctx: &ExecCtx,
    node_id: &str,
    step_id: &str,
) -> OrchResult<Option<StepIdempotency>> {
    ctx.env
        .store
        .idempotency_get(ctx.run_id, node_id, step_id)
        .await
        .map_err(|e| OrchError::internal(format!("idempotency lookup failed: {e:#}")))
}

async fn idem_put(
    ctx: &ExecCtx,
    node: &IrNode,
    step: &IrStep,
    status: IdempotencyStatus,
    result_json: Option<String>,
) -> OrchResult<()> {
    ctx.env
        .store
        .idempotency_put(&StepIdempotency {
            run_id: ctx.run_id,
            node_id: node.node_id.clone(),
            step_id: step.step_id.clone(),
            status,
            result_json,
            updated_at: Utc::now(),
        })
        .await
        .map_err(|e| OrchError::internal(format!("idempotency update failed: {e:#}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler;
    use crate::config::Settings;
    use crate::env::RunnerEnv;
    use crate::store::OrchStore;
    use crate::store_memory::MemoryStore;
    use std::collections::HashSet;
    use std::sync::Arc;
    use uuid::Uuid;

    fn test_ctx(definition: serde_json::Value) -> (ExecCtx, Arc<dyn OrchStore>) {
        let store: Arc<dyn OrchStore> = Arc::new(MemoryStore::new());
        let env = RunnerEnv::new(store.clone(), Settings::default());
        let ir = compiler::compile(&definition, &HashSet::new()).unwrap();
        let ctx = ExecCtx {
            env,
            ir: Arc::new(ir),
            run_id: Uuid::now_v7(),
        };
        (ctx, store)
    }

    fn seq_definition(steps: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "procedure_id": "p", "version": "1",
            "workflow_graph": {"start_node": "n", "nodes": {
                "n": {"type": "sequence", "agent": "web", "steps": steps, "next_node": "end"},
                "end": {"type": "terminate"},
            }},
        })
    }

    #[tokio::test]
    async fn internal_actions_compute_results() {
        let mut state = RunState::new("r", "p", "1");

        let mut params = Map::new();
        params.insert("operation".into(), json!("multiply"));
        params.insert("operands".into(), json!([6, 7]));
        let result = execute_internal_action("calculate", &params, &mut state)
            .await
            .unwrap();
        assert_eq!(result, json!(42.0));

        let mut params = Map::new();
        params.insert("name".into(), json!("answer"));
        params.insert("value".into(), json!(42));
        execute_internal_action("set_variable", &params, &mut state)
            .await
            .unwrap();
        assert_eq!(state.vars["answer"], json!(42));

        let mut params = Map::new();
        params.insert("source".into(), json!(r#"{"k": [1, 2]}"#));
        let parsed = execute_internal_action("parse_json", &params, &mut state)
            .await
            .unwrap();
        assert_eq!(parsed["k"][1], json!(2));

        let err = execute_internal_action("teleport", &Map::new(), &mut state)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
    }

    #[tokio::test]
    async fn sequence_runs_internal_steps_and_stores_outputs() {
        let (ctx, store) = test_ctx(seq_definition(json!([
            {"step_id": "s1", "action": "log", "message": "hello {{who | world}}"},
            {"step_id": "s2", "action": "generate_id", "output_variable": "req_id"},
        ])));
        let node = ctx.ir.nodes.get("n").unwrap().clone();
        let crate::compiler::ir::NodePayload::Sequence(payload) = node.payload.clone() else {
            panic!("expected sequence");
        };

        let mut state = RunState::new(&ctx.run_id.to_string(), "p", "1");
        execute(&ctx, &node, &payload, &mut state).await.unwrap();

        assert!(state.vars["req_id"].as_str().is_some());

        let events = store.list_events(ctx.run_id, 0).await.unwrap();
        let types: Vec<_> = events
            .iter()
            .map(|(_, e)| e.event_type.as_str())
            .collect();
        assert_eq!(
            types,
            vec![
                "step_started",
                "step_completed",
                "step_started",
                "step_completed",
            ]
        );
    }

    #[tokio::test]
    async fn replay_returns_cached_result_without_resolution() {
        // The step targets channel "web" with no registered agent: a live
        // execution would fail with no-executor. A succeeded idempotency
        // record must short-circuit before resolution ever happens.
        let (ctx, store) = test_ctx(seq_definition(json!([
            {"step_id": "s1", "action": "navigate", "output_variable": "page"},
        ])));
        store
            .idempotency_put(&StepIdempotency {
                run_id: ctx.run_id,
                node_id: "n".into(),
                step_id: "s1".into(),
                status: IdempotencyStatus::Succeeded,
                result_json: Some(r#"{"title": "cached"}"#.into()),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let node = ctx.ir.nodes.get("n").unwrap().clone();
        let crate::compiler::ir::NodePayload::Sequence(payload) = node.payload.clone() else {
            panic!("expected sequence");
        };
        let mut state = RunState::new(&ctx.run_id.to_string(), "p", "1");
        execute(&ctx, &node, &payload, &mut state).await.unwrap();

        assert_eq!(state.vars["page"]["title"], json!("cached"));
        let events = store.list_events(ctx.run_id, 0).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1.event_type, EventType::StepCompleted);
    }

    #[tokio::test]
    async fn no_executor_fails_without_handlers() {
        let (ctx, _store) = test_ctx(seq_definition(json!([
            {"step_id": "s1", "action": "click"},
        ])));
        let node = ctx.ir.nodes.get("n").unwrap().clone();
        let crate::compiler::ir::NodePayload::Sequence(payload) = node.payload.clone() else {
            panic!("expected sequence");
        };
        let mut state = RunState::new(&ctx.run_id.to_string(), "p", "1");
        let err = execute(&ctx, &node, &payload, &mut state)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoExecutor);
    }

    #[tokio::test]
    async fn ignore_handler_swallows_failure() {
        let def = serde_json::json!({
            "procedure_id": "p", "version": "1",
            "workflow_graph": {"start_node": "n", "nodes": {
                "n": {
                    "type": "sequence", "agent": "web",
                    "steps": [
                        {"step_id": "s1", "action": "click"},
                        {"step_id": "s2", "action": "set_variable",
                         "name": "after", "value": true},
                    ],
                    "error_handlers": [
                        {"error_kind": "no-executor", "action": "ignore"},
                    ],
                    "next_node": "end",
                },
                "end": {"type": "terminate"},
            }},
        });
        let (ctx, _store) = test_ctx(def);
        let node = ctx.ir.nodes.get("n").unwrap().clone();
        let crate::compiler::ir::NodePayload::Sequence(payload) = node.payload.clone() else {
            panic!("expected sequence");
        };
        let mut state = RunState::new(&ctx.run_id.to_string(), "p", "1");
        execute(&ctx, &node, &payload, &mut state).await.unwrap();
        // The failing step was swallowed and the sequence continued.
        assert_eq!(state.vars["after"], json!(true));
    }

    #[tokio::test]
    async fn fallback_handler_reroutes() {
        let def = serde_json::json!({
            "procedure_id": "p", "version": "1",
            "workflow_graph": {"start_node": "n", "nodes": {
                "n": {
                    "type": "sequence", "agent": "web",
                    "steps": [{"step_id": "s1", "action": "click"}],
                    "error_handlers": [
                        {"error_kind": "*", "action": "fallback_node",
                         "fallback_node": "recover"},
                    ],
                },
                "recover": {"type": "terminate"},
            }},
        });
        let (ctx, _store) = test_ctx(def);
        let node = ctx.ir.nodes.get("n").unwrap().clone();
        let crate::compiler::ir::NodePayload::Sequence(payload) = node.payload.clone() else {
            panic!("expected sequence");
        };
        let mut state = RunState::new(&ctx.run_id.to_string(), "p", "1");
        execute(&ctx, &node, &payload, &mut state).await.unwrap();
        assert_eq!(state.next_node_id.as_deref(), Some("recover"));
    }

    #[tokio::test]
    async fn cancellation_raises_at_step_boundary() {
        let (ctx, _store) = test_ctx(seq_definition(json!([
            {"step_id": "s1", "action": "log", "message": "never runs"},
        ])));
        ctx.env.cancellations.register(ctx.run_id);
        ctx.env.cancellations.mark_cancelled(ctx.run_id);

        let node = ctx.ir.nodes.get("n").unwrap().clone();
        let crate::compiler::ir::NodePayload::Sequence(payload) = node.payload.clone() else {
            panic!("expected sequence");
        };
        let mut state = RunState::new(&ctx.run_id.to_string(), "p", "1");
        let err = execute(&ctx, &node, &payload, &mut state)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }
}
