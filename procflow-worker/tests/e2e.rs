//! End-to-end scenarios: a live worker loop against the in-memory store and
//! a mock agent served over real HTTP.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::watch;
use uuid::Uuid;

use procflow_core::config::Settings;
use procflow_core::engine::Orchestrator;
use procflow_core::env::RunnerEnv;
use procflow_core::events::EventType;
use procflow_core::store::OrchStore;
use procflow_core::store_memory::MemoryStore;
use procflow_core::types::{ApprovalStatus, IdempotencyStatus, JobStatus, RunStatus};
use procflow_core::worker::Worker;

// ─── Harness ──────────────────────────────────────────────────

struct Harness {
    orchestrator: Orchestrator,
    env: Arc<RunnerEnv>,
    store: Arc<dyn OrchStore>,
    shutdown: watch::Sender<bool>,
}

impl Harness {
    async fn start() -> Self {
        let store: Arc<dyn OrchStore> = Arc::new(MemoryStore::new());
        let mut settings = Settings::default();
        settings.poll_interval = Duration::from_millis(25);
        settings.heartbeat_interval = Duration::from_millis(200);
        settings.lease_acquire_budget = Duration::from_secs(10);
        let env = RunnerEnv::new(store.clone(), settings);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = Worker::new(env.clone(), Some("e2e-worker".to_string()));
        tokio::spawn(async move {
            worker.run(shutdown_rx).await;
        });

        Self {
            orchestrator: Orchestrator::new(env.clone()),
            env,
            store,
            shutdown,
        }
    }

    async fn wait_for_status(&self, run_id: Uuid, status: RunStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        loop {
            let run = self.store.load_run(run_id).await.unwrap().unwrap();
            if run.status == status {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {status:?}; run is {:?} ({:?})",
                run.status,
                run.error_message,
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn event_types(&self, run_id: Uuid) -> Vec<&'static str> {
        self.store
            .list_events(run_id, 0)
            .await
            .unwrap()
            .iter()
            .map(|(_, e)| e.event_type.as_str())
            .collect()
    }

    async fn register_web_agent(&self, base_url: &str, concurrency_limit: i32) {
        procflow_core::registry::register_agent(
            &self.env.store,
            "web-agent-1",
            "web-agent-1",
            "web",
            base_url,
            &[],
            Some("web_default"),
            concurrency_limit,
        )
        .await
        .unwrap();
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

// ─── Mock agent ───────────────────────────────────────────────

#[derive(Clone)]
struct AgentState {
    /// HTTP 500s to serve before succeeding.
    failures_remaining: Arc<AtomicU32>,
    /// Per-request handler delay.
    delay: Duration,
    calls: Arc<AtomicU32>,
    in_flight: Arc<AtomicI32>,
    max_in_flight: Arc<AtomicI32>,
}

async fn execute_handler(
    State(state): State<AgentState>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.calls.fetch_add(1, Ordering::SeqCst);
    let current = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.max_in_flight.fetch_max(current, Ordering::SeqCst);

    tokio::time::sleep(state.delay).await;
    state.in_flight.fetch_sub(1, Ordering::SeqCst);

    if state
        .failures_remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "error", "error": "transient backend failure"})),
        );
    }

    let action = body["action"].as_str().unwrap_or_default().to_string();
    (
        StatusCode::OK,
        Json(json!({"status": "success", "result": {"action": action, "ok": true}})),
    )
}

async fn spawn_agent(failures: u32, delay: Duration) -> (String, AgentState) {
    let state = AgentState {
        failures_remaining: Arc::new(AtomicU32::new(failures)),
        delay,
        calls: Arc::new(AtomicU32::new(0)),
        in_flight: Arc::new(AtomicI32::new(0)),
        max_in_flight: Arc::new(AtomicI32::new(0)),
    };
    let app = Router::new()
        .route("/execute", post(execute_handler))
        .route("/health", get(|| async { StatusCode::OK }))
        .route(
            "/capabilities",
            get(|| async { Json(json!({"capabilities": ["*"]})) }),
        )
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), state)
}

// ─── Agent probes ─────────────────────────────────────────────

#[tokio::test]
async fn agent_health_and_capability_probes_answer() {
    let h = Harness::start().await;
    let (base_url, _state) = spawn_agent(0, Duration::ZERO).await;

    let client =
        procflow_core::dispatch::AgentClient::new(&h.env, &base_url, Duration::from_secs(5));
    assert!(client.health_check().await);
    assert_eq!(client.capabilities().await.unwrap(), vec!["*".to_string()]);

    // Nothing is listening here: the probe reports unhealthy, not an error.
    let dead =
        procflow_core::dispatch::AgentClient::new(&h.env, "http://127.0.0.1:1", Duration::from_secs(1));
    assert!(!dead.health_check().await);
}

// ─── Scenario 1: minimal run ──────────────────────────────────

#[tokio::test]
async fn minimal_run_completes_with_ordered_events() {
    let h = Harness::start().await;
    h.orchestrator
        .publish_procedure(json!({
            "procedure_id": "minimal", "version": "1.0",
            "workflow_graph": {"start_node": "start", "nodes": {
                "start": {"type": "sequence", "next_node": "finish", "steps": [
                    {"step_id": "log_step", "action": "log", "message": "starting"},
                ]},
                "finish": {"type": "terminate", "status": "success"},
            }},
        }))
        .await
        .unwrap();

    let run = h.orchestrator.create_run("minimal", None, None).await.unwrap();
    h.wait_for_status(run.run_id, RunStatus::Completed).await;

    assert_eq!(
        h.event_types(run.run_id).await,
        vec!["run_created", "step_started", "step_completed", "run_completed"]
    );

    // Event ids are strictly increasing.
    let events = h.store.list_events(run.run_id, 0).await.unwrap();
    let ids: Vec<u64> = events.iter().map(|(id, _)| *id).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(ids, sorted);
}

// ─── Scenario 2: agent dispatch with retry ────────────────────

#[tokio::test]
async fn agent_dispatch_retries_through_http_500s() {
    let h = Harness::start().await;
    let (base_url, agent) = spawn_agent(2, Duration::ZERO).await;
    h.register_web_agent(&base_url, 4).await;

    h.orchestrator
        .publish_procedure(json!({
            "procedure_id": "retrying", "version": "1.0",
            "workflow_graph": {"start_node": "fetch", "nodes": {
                "fetch": {"type": "sequence", "agent": "web", "next_node": "finish",
                    "steps": [{
                        "step_id": "nav", "action": "navigate",
                        "url": "https://example.test",
                        "retry_on_failure": true,
                        "retry": {"max_retries": 3, "delay_ms": 10},
                        "output_variable": "page",
                    }],
                },
                "finish": {"type": "terminate", "status": "success"},
            }},
        }))
        .await
        .unwrap();

    let run = h.orchestrator.create_run("retrying", None, None).await.unwrap();
    h.wait_for_status(run.run_id, RunStatus::Completed).await;

    // Two 500s then a success: exactly three calls reach the agent.
    assert_eq!(agent.calls.load(Ordering::SeqCst), 3);

    let types = h.event_types(run.run_id).await;
    let retries = types.iter().filter(|t| **t == "retry_attempted").count();
    let completed = types.iter().filter(|t| **t == "step_completed").count();
    assert_eq!(retries, 2);
    assert_eq!(completed, 1);
    assert_eq!(*types.last().unwrap(), "run_completed");

    let record = h
        .store
        .idempotency_get(run.run_id, "fetch", "nav")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, IdempotencyStatus::Succeeded);
}

// ─── Scenario 3: no executor ──────────────────────────────────

#[tokio::test]
async fn missing_agent_fails_the_run_with_no_executor() {
    let h = Harness::start().await;
    h.orchestrator
        .publish_procedure(json!({
            "procedure_id": "orphan", "version": "1.0",
            "workflow_graph": {"start_node": "click_node", "nodes": {
                "click_node": {"type": "sequence", "agent": "web",
                    "steps": [{"step_id": "s1", "action": "click"}]},
            }},
        }))
        .await
        .unwrap();

    let run = h.orchestrator.create_run("orphan", None, None).await.unwrap();
    h.wait_for_status(run.run_id, RunStatus::Failed).await;

    let events = h.store.list_events(run.run_id, 0).await.unwrap();
    let (_, failed) = events
        .iter()
        .find(|(_, e)| e.event_type == EventType::RunFailed)
        .expect("run_failed event");
    assert_eq!(failed.payload.as_ref().unwrap()["error_kind"], json!("no-executor"));
}

// ─── Scenario 4: concurrency limit ────────────────────────────

#[tokio::test]
async fn concurrency_limit_serializes_agent_access() {
    let h = Harness::start().await;
    let step_duration = Duration::from_millis(300);
    let (base_url, agent) = spawn_agent(0, step_duration).await;
    h.register_web_agent(&base_url, 1).await;

    h.orchestrator
        .publish_procedure(json!({
            "procedure_id": "leased", "version": "1.0",
            "workflow_graph": {"start_node": "work", "nodes": {
                "work": {"type": "sequence", "agent": "web", "next_node": "finish",
                    "steps": [{"step_id": "s1", "action": "navigate"}]},
                "finish": {"type": "terminate"},
            }},
        }))
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let run_a = h.orchestrator.create_run("leased", None, None).await.unwrap();
    let run_b = h.orchestrator.create_run("leased", None, None).await.unwrap();
    h.wait_for_status(run_a.run_id, RunStatus::Completed).await;
    h.wait_for_status(run_b.run_id, RunStatus::Completed).await;
    let elapsed = started.elapsed();

    // The lease admits one dispatch at a time.
    assert_eq!(agent.max_in_flight.load(Ordering::SeqCst), 1);
    // Serialized work takes at least two step durations of wall time.
    assert!(
        elapsed >= step_duration * 2,
        "expected serialized execution, finished in {elapsed:?}"
    );
    // Everything was released at the end.
    assert!(h
        .store
        .list_active_leases(Some("web_default"))
        .await
        .unwrap()
        .is_empty());
}

// ─── Scenario 5: approval pause and resume ────────────────────

#[tokio::test]
async fn approval_pauses_and_resumes_to_completion() {
    let h = Harness::start().await;
    h.orchestrator
        .publish_procedure(json!({
            "procedure_id": "gated", "version": "1.0",
            "workflow_graph": {"start_node": "gate", "nodes": {
                "gate": {"type": "human_approval", "prompt": "continue?",
                         "on_approve": "finish", "on_reject": "abort"},
                "finish": {"type": "terminate", "status": "success"},
                "abort": {"type": "terminate", "status": "failure"},
            }},
        }))
        .await
        .unwrap();

    let run = h.orchestrator.create_run("gated", None, None).await.unwrap();
    h.wait_for_status(run.run_id, RunStatus::WaitingApproval).await;

    let types = h.event_types(run.run_id).await;
    assert!(types.contains(&"approval_requested"));

    // The job was released while the run waits.
    let job = h.store.load_job(run.run_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done);

    let pending = h
        .store
        .list_approvals(Some(ApprovalStatus::Pending))
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);

    h.orchestrator
        .submit_approval_decision(pending[0].approval_id, true, Some("ops"), None)
        .await
        .unwrap();

    h.wait_for_status(run.run_id, RunStatus::Completed).await;

    let types = h.event_types(run.run_id).await;
    assert!(types.contains(&"approval_decision_received"));
    assert_eq!(*types.last().unwrap(), "run_completed");

    // Exactly one approval, now approved.
    let all = h.store.list_approvals(None).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status, ApprovalStatus::Approved);
}

// ─── Scenario 6: cancel in flight ─────────────────────────────

#[tokio::test]
async fn cancel_lands_within_a_step_boundary() {
    let h = Harness::start().await;
    let (base_url, _agent) = spawn_agent(0, Duration::from_millis(100)).await;
    h.register_web_agent(&base_url, 2).await;

    // Many short agent steps so a boundary comes up quickly after cancel.
    let steps: Vec<Value> = (0..40)
        .map(|i| json!({"step_id": format!("s{i}"), "action": "navigate"}))
        .collect();
    h.orchestrator
        .publish_procedure(json!({
            "procedure_id": "long_haul", "version": "1.0",
            "workflow_graph": {"start_node": "work", "nodes": {
                "work": {"type": "sequence", "agent": "web", "next_node": "finish",
                         "steps": steps},
                "finish": {"type": "terminate"},
            }},
        }))
        .await
        .unwrap();

    let run = h.orchestrator.create_run("long_haul", None, None).await.unwrap();
    h.wait_for_status(run.run_id, RunStatus::Running).await;
    tokio::time::sleep(Duration::from_millis(250)).await;

    h.orchestrator.cancel_run(run.run_id).await.unwrap();
    h.wait_for_status(run.run_id, RunStatus::Canceled).await;

    let types = h.event_types(run.run_id).await;
    assert!(types.contains(&"run_canceled"));
    // Not every step ran: cancellation cut the sequence short.
    let completed = types.iter().filter(|t| **t == "step_completed").count();
    assert!(completed < 40, "cancel should interrupt the sequence");

    // All held leases were released.
    assert!(h
        .store
        .list_active_leases(Some("web_default"))
        .await
        .unwrap()
        .is_empty());

    // The job finished non-retryably.
    let job = h.store.load_job(run.run_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done);
}

// ─── Checkpoint restorability across a pause ──────────────────

#[tokio::test]
async fn state_survives_the_approval_pause_via_checkpoint() {
    let h = Harness::start().await;
    h.orchestrator
        .publish_procedure(json!({
            "procedure_id": "remember", "version": "1.0",
            "workflow_graph": {"start_node": "prep", "nodes": {
                "prep": {"type": "sequence", "is_checkpoint": true, "next_node": "gate",
                    "steps": [{"step_id": "s1", "action": "set_variable",
                               "name": "token_count", "value": 99}]},
                "gate": {"type": "human_approval", "prompt": "ok?",
                         "on_approve": "emit", "on_reject": "emit"},
                "emit": {"type": "terminate", "status": "success",
                         "outputs": {"final": "{{token_count}}"}},
            }},
        }))
        .await
        .unwrap();

    let run = h.orchestrator.create_run("remember", None, None).await.unwrap();
    h.wait_for_status(run.run_id, RunStatus::WaitingApproval).await;

    let pending = h
        .store
        .list_approvals(Some(ApprovalStatus::Pending))
        .await
        .unwrap();
    h.orchestrator
        .submit_approval_decision(pending[0].approval_id, true, None, None)
        .await
        .unwrap();
    h.wait_for_status(run.run_id, RunStatus::Completed).await;

    // Variables written before the pause flowed through the checkpoint into
    // the terminate outputs after resume.
    let checkpoints = h.store.list_checkpoints(&run.thread_id).await.unwrap();
    assert!(checkpoints.len() >= 2);
    let last = checkpoints.last().unwrap();
    assert_eq!(last.state.vars["token_count"], json!(99));
}
