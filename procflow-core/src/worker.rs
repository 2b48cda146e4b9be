//! Worker loop: claims jobs from the durable queue, executes their runs,
//! renews locks via the heartbeat, and bridges DB cancellation signals into
//! the in-process registry.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::compiler;
use crate::env::RunnerEnv;
use crate::error::{ErrorKind, OrchError};
use crate::events::{EventType, RunEvent};
use crate::runner::{run_graph, run_subgraph, RunOutcome, Suspension};
use crate::state::{ErrorInfo, RunState};
use crate::types::{Run, RunJob, RunStatus};

/// Backoff after a queue/claim error.
const CLAIM_ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct Worker {
    env: Arc<RunnerEnv>,
    worker_id: String,
}

impl Worker {
    pub fn new(env: Arc<RunnerEnv>, worker_id: Option<String>) -> Self {
        let worker_id = worker_id.unwrap_or_else(|| {
            format!("worker-{}", &Uuid::now_v7().simple().to_string()[..12])
        });
        Self { env, worker_id }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Poll-and-execute loop. Blocks until the shutdown signal flips, then
    /// drains in-flight jobs.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.worker_id, "worker started");
        if let Err(e) = self.env.store.upsert_worker(&self.worker_id).await {
            warn!(error = %e, "failed to announce worker");
        }

        let mut tasks: JoinSet<()> = JoinSet::new();
        loop {
            if *shutdown.borrow() {
                break;
            }

            while tasks.try_join_next().is_some() {}

            let capacity = self
                .env
                .settings
                .worker_concurrency
                .saturating_sub(tasks.len());

            let claimed = if capacity > 0 {
                match self
                    .env
                    .store
                    .claim_jobs(&self.worker_id, capacity, self.env.settings.lock_duration)
                    .await
                {
                    Ok(jobs) => jobs,
                    Err(e) => {
                        error!(error = %e, "job claim failed");
                        tokio::time::sleep(CLAIM_ERROR_BACKOFF).await;
                        continue;
                    }
                }
            } else {
                Vec::new()
            };

            if claimed.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(self.env.settings.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            for job in claimed {
                let env = self.env.clone();
                let worker_id = self.worker_id.clone();
                tasks.spawn(async move {
                    execute_job(env, worker_id, job).await;
                });
            }
        }

        info!(worker_id = %self.worker_id, "worker draining");
        while tasks.join_next().await.is_some() {}
        info!(worker_id = %self.worker_id, "worker stopped");
    }
}

/// Execute one claimed job to suspension or terminal state.
pub async fn execute_job(env: Arc<RunnerEnv>, worker_id: String, job: RunJob) {
    let store = env.store.clone();

    let run = match store.load_run(job.run_id).await {
        Ok(Some(run)) => run,
        Ok(None) => {
            error!(run_id = %job.run_id, "job references a missing run");
            let _ = store.mark_job_failed(job.job_id, "run not found").await;
            return;
        }
        Err(e) => {
            error!(run_id = %job.run_id, error = %e, "failed to load run");
            let _ = store
                .mark_job_retry(job.job_id, &format!("{e:#}"), CLAIM_ERROR_BACKOFF)
                .await;
            return;
        }
    };

    // Cancelled before we even started.
    if run.cancellation_requested {
        finish_cancelled(&env, &run, &job).await;
        return;
    }

    env.cancellations.register(run.run_id);
    let heartbeat = tokio::spawn(heartbeat_loop(
        env.clone(),
        job.job_id,
        run.run_id,
        worker_id.clone(),
    ));

    let outcome = drive_run(&env, &run, &job).await;

    heartbeat.abort();
    env.cancellations.deregister(run.run_id);

    if let Err(e) = outcome {
        error!(run_id = %run.run_id, error = %e, "job execution bookkeeping failed");
    }
}

/// Load, compile, hydrate state from the latest checkpoint, run the graph,
/// and record the outcome on the run and the job.
async fn drive_run(env: &Arc<RunnerEnv>, run: &Run, job: &RunJob) -> anyhow::Result<()> {
    let store = env.store.clone();
    store
        .update_run_status(run.run_id, RunStatus::Running)
        .await?;

    let compiled = load_and_compile(env, run).await;
    let ir = match compiled {
        Ok(ir) => Arc::new(ir),
        Err(err) => {
            fail_run(env, run, job, &err, None).await?;
            return Ok(());
        }
    };

    // Hydrate from the latest checkpoint; a fresh run starts from inputs.
    let (state, entry) = match store.get_checkpoint(&run.thread_id, None).await? {
        Some(checkpoint) => {
            let state = checkpoint.state;
            let entry = if let Some(pending) = &state.workflow_pending {
                Some(pending.resume_node.clone())
            } else if let Some(awaiting) = &state.awaiting_approval {
                Some(awaiting.node_id.clone())
            } else {
                // Stalled-job resume: re-enter the node that was executing.
                // Idempotency records make the replay externally silent.
                Some(state.current_node_id.clone())
            };
            (state, entry)
        }
        None => {
            let mut state = RunState::new(
                &run.run_id.to_string(),
                &run.procedure_id,
                &run.procedure_version,
            );
            if let Some(Value::Object(vars)) = &run.input_vars {
                state.vars = vars.clone();
            }
            (state, None)
        }
    };

    debug!(run_id = %run.run_id, entry = ?entry, "driving graph");

    match run_graph(
        env.clone(),
        ir.clone(),
        state,
        entry,
        Some(run.thread_id.clone()),
    )
    .await
    {
        Ok((state, RunOutcome::Completed)) => {
            store
                .set_run_cursor(
                    run.run_id,
                    Some(&state.current_node_id),
                    state.current_step_id.as_deref(),
                )
                .await?;
            store
                .update_run_status(run.run_id, RunStatus::Completed)
                .await?;
            store
                .append_event(
                    run.run_id,
                    &RunEvent::of(EventType::RunCompleted)
                        .payload(json!({"terminal_status": state.terminal_status})),
                )
                .await?;
            store.mark_job_done(job.job_id).await?;
            info!(run_id = %run.run_id, "run completed");
        }
        Ok((state, RunOutcome::Suspended(suspension))) => {
            store
                .set_run_cursor(
                    run.run_id,
                    Some(&state.current_node_id),
                    state.current_step_id.as_deref(),
                )
                .await?;
            match suspension {
                Suspension::Approval => {
                    store
                        .update_run_status(run.run_id, RunStatus::WaitingApproval)
                        .await?;
                }
                // A delegated workflow leaves the run logically in flight;
                // the ingress re-enqueues it when the agent calls back.
                Suspension::Workflow => {}
            }
            store.mark_job_done(job.job_id).await?;
            info!(run_id = %run.run_id, ?suspension, "run suspended");
        }
        Err(err) if err.kind == ErrorKind::Cancelled => {
            finish_cancelled(env, run, job).await;
        }
        Err(err) => {
            // Transient kinds get the job-level retry budget; everything
            // else (and an exhausted budget) fails the run.
            if err.kind.is_retryable() && job.attempts < job.max_attempts {
                warn!(
                    run_id = %run.run_id,
                    attempts = job.attempts,
                    error = %err,
                    "run attempt failed; scheduling job retry"
                );
                store
                    .mark_job_retry(job.job_id, &err.message, job_backoff(job.attempts))
                    .await?;
                store
                    .update_run_status(run.run_id, RunStatus::Created)
                    .await?;
            } else {
                fail_run(env, run, job, &err, Some(ir)).await?;
            }
        }
    }
    Ok(())
}

async fn load_and_compile(
    env: &Arc<RunnerEnv>,
    run: &Run,
) -> Result<compiler::ir::IrProcedure, OrchError> {
    let store = &env.store;
    let record = store
        .get_procedure(&run.procedure_id, Some(&run.procedure_version))
        .await
        .map_err(OrchError::from)?
        .ok_or_else(|| {
            OrchError::validation(format!(
                "procedure {}@{} not found",
                run.procedure_id, run.procedure_version
            ))
        })?;
    let known: HashSet<String> = store
        .list_procedure_ids()
        .await
        .map_err(OrchError::from)?
        .into_iter()
        .collect();
    compiler::compile(&record.definition, &known)
}

/// Terminal failure path: run the global on_failure recovery sub-graph
/// (its success never masks the original outcome), then mark the run and
/// job failed with a redacted failure payload.
async fn fail_run(
    env: &Arc<RunnerEnv>,
    run: &Run,
    job: &RunJob,
    err: &OrchError,
    ir: Option<Arc<compiler::ir::IrProcedure>>,
) -> anyhow::Result<()> {
    let store = env.store.clone();

    if let Some(ir) = ir {
        run_on_failure_handler(env, &ir, run, err).await;
    }

    store.set_run_error(run.run_id, &err.message).await?;
    store
        .update_run_status(run.run_id, RunStatus::Failed)
        .await?;
    store
        .append_event(
            run.run_id,
            &RunEvent::of(EventType::RunFailed)
                .payload(json!({"error_kind": err.kind.as_str(), "message": err.message})),
        )
        .await?;
    store.mark_job_failed(job.job_id, &err.message).await?;
    store.release_leases_for_run(run.run_id).await?;
    error!(run_id = %run.run_id, error = %err, "run failed");
    Ok(())
}

/// Re-enter the graph at the configured on_failure node under a dedicated
/// `:on_failure` thread. Handler failures are swallowed: cleanup must
/// never obscure the original error.
async fn run_on_failure_handler(
    env: &Arc<RunnerEnv>,
    ir: &Arc<compiler::ir::IrProcedure>,
    run: &Run,
    err: &OrchError,
) {
    let Some(handler_node) = ir.global_config.on_failure.clone() else {
        return;
    };
    if !ir.nodes.contains_key(&handler_node) {
        warn!(
            run_id = %run.run_id,
            handler = %handler_node,
            "on_failure references a node that does not exist"
        );
        return;
    }

    let mut state = RunState::new(
        &run.run_id.to_string(),
        &run.procedure_id,
        &run.procedure_version,
    );
    if let Some(Value::Object(vars)) = &run.input_vars {
        state.vars = vars.clone();
    }
    state.current_node_id = handler_node.clone();
    state.error = Some(ErrorInfo {
        kind: err.kind.as_str().to_string(),
        message: err.message.clone(),
        node_id: run.last_node_id.clone(),
        step_id: run.last_step_id.clone(),
    });

    let thread = format!("{}:on_failure", run.thread_id);
    match run_subgraph(
        env.clone(),
        ir.clone(),
        state,
        Some(handler_node),
        Some(thread),
    )
    .await
    {
        Ok(_) => info!(run_id = %run.run_id, "on_failure recovery completed"),
        Err(recovery_err) => warn!(
            run_id = %run.run_id,
            error = %recovery_err,
            "on_failure recovery itself failed"
        ),
    }
}

async fn finish_cancelled(env: &Arc<RunnerEnv>, run: &Run, job: &RunJob) {
    let store = &env.store;
    let released = store
        .release_leases_for_run(run.run_id)
        .await
        .unwrap_or_default();
    let _ = store
        .update_run_status(run.run_id, RunStatus::Canceled)
        .await;
    let _ = store
        .append_event(
            run.run_id,
            &RunEvent::of(EventType::RunCanceled).payload(json!({"leases_released": released})),
        )
        .await;
    // Cancellation is not retryable.
    let _ = store.mark_job_done(job.job_id).await;
    info!(run_id = %run.run_id, "run canceled");
}

/// Renew the job lock and bridge the DB cancellation flag, every tick,
/// until aborted. The resource leases are deliberately NOT extended: a
/// crashed worker's leases expire on their own and free the resource.
pub async fn heartbeat_loop(env: Arc<RunnerEnv>, job_id: Uuid, run_id: Uuid, worker_id: String) {
    let interval = env.settings.heartbeat_interval;
    debug!(%job_id, %run_id, "heartbeat started");
    loop {
        tokio::time::sleep(interval).await;

        match env
            .store
            .extend_job_lock(job_id, &worker_id, env.settings.lock_duration)
            .await
        {
            Ok(true) => debug!(%job_id, "heartbeat renewed lock"),
            Ok(false) => warn!(%job_id, "heartbeat could not renew lock (job no longer ours?)"),
            Err(e) => warn!(%job_id, error = %e, "heartbeat error (will retry)"),
        }

        match env.store.cancellation_requested(run_id).await {
            Ok(true) => {
                info!(%run_id, "heartbeat detected cancellation request");
                env.cancellations.mark_cancelled(run_id);
            }
            Ok(false) => {}
            Err(e) => warn!(%run_id, error = %e, "cancellation check failed"),
        }

        if let Err(e) = env.store.heartbeat_worker(&worker_id).await {
            warn!(worker_id = %worker_id, error = %e, "worker heartbeat failed");
        }
    }
}

fn job_backoff(attempts: i32) -> Duration {
    let exp = 5u64.saturating_mul(1 << (attempts.max(1) as u32 - 1).min(6));
    Duration::from_secs(exp.min(300))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::engine::Orchestrator;
    use crate::store::OrchStore;
    use crate::store_memory::MemoryStore;

    async fn setup() -> (Orchestrator, Arc<RunnerEnv>, Arc<dyn OrchStore>) {
        let store: Arc<dyn OrchStore> = Arc::new(MemoryStore::new());
        let env = RunnerEnv::new(store.clone(), Settings::default());
        (Orchestrator::new(env.clone()), env, store)
    }

    #[tokio::test]
    async fn executes_a_minimal_run_to_completion() {
        let (orch, env, store) = setup().await;
        orch.publish_procedure(json!({
            "procedure_id": "mini", "version": "1",
            "workflow_graph": {"start_node": "a", "nodes": {
                "a": {"type": "sequence", "next_node": "end", "steps": [
                    {"step_id": "s1", "action": "log", "message": "hello"},
                ]},
                "end": {"type": "terminate", "status": "success"},
            }},
        }))
        .await
        .unwrap();

        let run = orch.create_run("mini", None, None).await.unwrap();
        let jobs = store
            .claim_jobs("w1", 1, Duration::from_secs(60))
            .await
            .unwrap();
        execute_job(env, "w1".to_string(), jobs[0].clone()).await;

        let run = store.load_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);

        let types: Vec<&str> = store
            .list_events(run.run_id, 0)
            .await
            .unwrap()
            .iter()
            .map(|(_, e)| e.event_type.as_str())
            .collect();
        assert_eq!(
            types,
            vec!["run_created", "step_started", "step_completed", "run_completed"]
        );
    }

    #[tokio::test]
    async fn no_executor_fails_the_run_with_kind() {
        let (orch, env, store) = setup().await;
        orch.publish_procedure(json!({
            "procedure_id": "p", "version": "1",
            "workflow_graph": {"start_node": "a", "nodes": {
                "a": {"type": "sequence", "agent": "web",
                      "steps": [{"step_id": "s1", "action": "click"}]},
            }},
        }))
        .await
        .unwrap();

        let run = orch.create_run("p", None, None).await.unwrap();
        let jobs = store
            .claim_jobs("w1", 1, Duration::from_secs(60))
            .await
            .unwrap();
        execute_job(env, "w1".to_string(), jobs[0].clone()).await;

        let run = store.load_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);

        let events = store.list_events(run.run_id, 0).await.unwrap();
        let failed = events
            .iter()
            .find(|(_, e)| e.event_type == EventType::RunFailed)
            .expect("run_failed event");
        assert_eq!(
            failed.1.payload.as_ref().unwrap()["error_kind"],
            json!("no-executor")
        );
        // no-executor is deterministic: the job must not be retried.
        let job = store.load_job(run.run_id).await.unwrap().unwrap();
        assert_eq!(job.status, crate::types::JobStatus::Failed);
    }

    #[tokio::test]
    async fn pre_claim_cancellation_short_circuits() {
        let (orch, env, store) = setup().await;
        orch.publish_procedure(json!({
            "procedure_id": "p", "version": "1",
            "workflow_graph": {"start_node": "a", "nodes": {
                "a": {"type": "terminate"},
            }},
        }))
        .await
        .unwrap();
        let run = orch.create_run("p", None, None).await.unwrap();
        orch.cancel_run(run.run_id).await.unwrap();

        let jobs = store
            .claim_jobs("w1", 1, Duration::from_secs(60))
            .await
            .unwrap();
        execute_job(env, "w1".to_string(), jobs[0].clone()).await;

        let run = store.load_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Canceled);
    }

    #[tokio::test]
    async fn on_failure_handler_runs_but_run_still_fails() {
        let (orch, env, store) = setup().await;
        orch.publish_procedure(json!({
            "procedure_id": "p", "version": "1",
            "global_config": {"on_failure": "cleanup"},
            "workflow_graph": {"start_node": "a", "nodes": {
                "a": {"type": "sequence", "agent": "web",
                      "steps": [{"step_id": "s1", "action": "click"}]},
                "cleanup": {"type": "sequence", "steps": [
                    {"step_id": "c1", "action": "log", "message": "cleaning up"},
                ]},
            }},
        }))
        .await
        .unwrap();

        let run = orch.create_run("p", None, None).await.unwrap();
        let jobs = store
            .claim_jobs("w1", 1, Duration::from_secs(60))
            .await
            .unwrap();
        execute_job(env, "w1".to_string(), jobs[0].clone()).await;

        // Recovery succeeded, but the run is still failed.
        let run_row = store.load_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(run_row.status, RunStatus::Failed);

        // The cleanup step ran and emitted into the run's event stream.
        let events = store.list_events(run.run_id, 0).await.unwrap();
        assert!(events
            .iter()
            .any(|(_, e)| e.event_type == EventType::StepCompleted));
    }

    #[test]
    fn job_backoff_grows_and_caps() {
        assert_eq!(job_backoff(1), Duration::from_secs(5));
        assert_eq!(job_backoff(2), Duration::from_secs(10));
        assert!(job_backoff(12) <= Duration::from_secs(300));
    }
}
