//! Orchestrator facade: the narrow surface the API layer and tests drive:
//! publish procedures, create/cancel/retry runs, resume approvals, complete
//! delegated workflow steps, and read the event stream.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::compiler::{self, ir::IrProcedure};
use crate::env::RunnerEnv;
use crate::error::{OrchError, OrchResult};
use crate::events::{EventType, RunEvent};
use crate::input_vars::{apply_defaults, validate_input_vars};
use crate::types::*;

/// Priority used when an approval decision (or delegated-workflow result)
/// re-enqueues a paused run, so resumes jump the queue.
pub const RESUME_PRIORITY: i32 = 10;

pub struct Orchestrator {
    env: Arc<RunnerEnv>,
}

impl Orchestrator {
    pub fn new(env: Arc<RunnerEnv>) -> Self {
        Self { env }
    }

    pub fn env(&self) -> &Arc<RunnerEnv> {
        &self.env
    }

    /// Compile a definition against everything currently published. The
    /// definition's own procedure_id is admitted so self-recursive subflows
    /// verify.
    pub async fn compile(&self, definition: &Value) -> OrchResult<IrProcedure> {
        let mut known: HashSet<String> = self
            .env
            .store
            .list_procedure_ids()
            .await
            .map_err(OrchError::from)?
            .into_iter()
            .collect();
        if let Some(id) = definition.get("procedure_id").and_then(Value::as_str) {
            known.insert(id.to_string());
        }
        compiler::compile(definition, &known)
    }

    /// Validate and publish a procedure version (immutable once stored).
    pub async fn publish_procedure(&self, definition: Value) -> OrchResult<ProcedureRecord> {
        let ir = self.compile(&definition).await?;
        let record = ProcedureRecord {
            procedure_id: ir.procedure_id.clone(),
            version: ir.version.clone(),
            status: ProcedureStatus::Active,
            definition,
            created_at: Utc::now(),
        };
        self.env
            .store
            .put_procedure(&record)
            .await
            .map_err(|e| OrchError::validation(format!("publish failed: {e:#}")))?;
        info!(procedure_id = %record.procedure_id, version = %record.version, "procedure published");
        Ok(record)
    }

    /// Create a run of a procedure version (None = latest), validate its
    /// input variables, and enqueue the job that will drive it.
    pub async fn create_run(
        &self,
        procedure_id: &str,
        version: Option<&str>,
        input_vars: Option<Map<String, Value>>,
    ) -> OrchResult<Run> {
        let store = &self.env.store;
        let record = store
            .get_procedure(procedure_id, version)
            .await
            .map_err(OrchError::from)?
            .ok_or_else(|| {
                OrchError::validation(format!("procedure '{procedure_id}' not found"))
            })?;

        let ir = self.compile(&record.definition).await?;

        let mut vars = input_vars.unwrap_or_default();
        apply_defaults(&ir.variables_schema, &mut vars);
        let errors = validate_input_vars(&ir.variables_schema, &vars);
        if !errors.is_empty() {
            let detail: Vec<String> = errors
                .iter()
                .map(|(field, message)| format!("{field}: {message}"))
                .collect();
            return Err(OrchError::validation(format!(
                "invalid input variables: {}",
                detail.join("; ")
            )));
        }

        let run = Run::new(&record.procedure_id, &record.version, Some(Value::Object(vars)));
        store.create_run(&run).await.map_err(OrchError::from)?;
        store
            .append_event(run.run_id, &RunEvent::of(EventType::RunCreated))
            .await
            .map_err(OrchError::from)?;
        store
            .enqueue_job(&RunJob::new(
                run.run_id,
                0,
                self.env.settings.max_attempts,
            ))
            .await
            .map_err(OrchError::from)?;

        info!(run_id = %run.run_id, procedure_id = %run.procedure_id, "run created and enqueued");
        Ok(run)
    }

    /// Request cancellation: sets the cross-process DB flag and primes the
    /// in-process event for a worker in this process. Idempotent.
    pub async fn cancel_run(&self, run_id: Uuid) -> OrchResult<bool> {
        let found = self
            .env
            .store
            .request_cancellation(run_id)
            .await
            .map_err(OrchError::from)?;
        if found {
            self.env.cancellations.mark_cancelled(run_id);
        }
        Ok(found)
    }

    /// Reset a terminal run for checkpoint-aware re-execution and re-enqueue
    /// its job. The worker rehydrates from the latest checkpoint; idempotency
    /// records keep already-completed steps externally silent on the replay.
    pub async fn prepare_retry(&self, run_id: Uuid) -> OrchResult<Run> {
        let store = &self.env.store;
        let run = store
            .reset_run_for_retry(run_id)
            .await
            .map_err(OrchError::from)?
            .ok_or_else(|| OrchError::validation(format!("run {run_id} not found")))?;

        store
            .append_event(
                run_id,
                &RunEvent::of(EventType::RunRetryRequested)
                    .payload(json!({"thread_id": run.thread_id})),
            )
            .await
            .map_err(OrchError::from)?;
        store
            .requeue_job(run_id, RESUME_PRIORITY, self.env.settings.max_attempts)
            .await
            .map_err(OrchError::from)?;

        info!(run_id = %run_id, "run reset for retry and re-enqueued");
        Ok(run)
    }

    /// Record a human decision and re-enqueue the paused run. The worker
    /// resumes the graph at the approval node, which routes on the decision.
    pub async fn submit_approval_decision(
        &self,
        approval_id: Uuid,
        approve: bool,
        decided_by: Option<&str>,
        payload: Option<Value>,
    ) -> OrchResult<Approval> {
        let store = &self.env.store;
        let status = if approve {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        let approval = store
            .submit_approval_decision(approval_id, status, decided_by, payload)
            .await
            .map_err(OrchError::from)?
            .ok_or_else(|| {
                OrchError::validation(format!(
                    "approval {approval_id} not found or already decided"
                ))
            })?;

        store
            .update_run_status(approval.run_id, RunStatus::Created)
            .await
            .map_err(OrchError::from)?;
        store
            .requeue_job(
                approval.run_id,
                RESUME_PRIORITY,
                self.env.settings.max_attempts,
            )
            .await
            .map_err(OrchError::from)?;

        info!(
            run_id = %approval.run_id,
            approval_id = %approval_id,
            decision = approval.status.as_str(),
            "approval decided; run re-enqueued"
        );
        Ok(approval)
    }

    /// Event-ingress contract for asynchronously delegated workflow steps:
    /// record the agent's result under the step's idempotency key and
    /// re-enqueue the run. On resume the sequence executor replays the step
    /// from the cache and continues.
    pub async fn complete_delegated_step(
        &self,
        run_id: Uuid,
        node_id: &str,
        step_id: &str,
        result: Value,
    ) -> OrchResult<()> {
        let store = &self.env.store;
        store
            .load_run(run_id)
            .await
            .map_err(OrchError::from)?
            .ok_or_else(|| OrchError::validation(format!("run {run_id} not found")))?;

        store
            .idempotency_put(&StepIdempotency {
                run_id,
                node_id: node_id.to_string(),
                step_id: step_id.to_string(),
                status: IdempotencyStatus::Succeeded,
                result_json: Some(result.to_string()),
                updated_at: Utc::now(),
            })
            .await
            .map_err(OrchError::from)?;

        store
            .append_event(
                run_id,
                &RunEvent::of(EventType::StepCompleted)
                    .node(node_id)
                    .step(step_id)
                    .payload(json!({"delegated": true, "result": result})),
            )
            .await
            .map_err(OrchError::from)?;

        store
            .update_run_status(run_id, RunStatus::Created)
            .await
            .map_err(OrchError::from)?;
        store
            .requeue_job(run_id, RESUME_PRIORITY, self.env.settings.max_attempts)
            .await
            .map_err(OrchError::from)?;
        Ok(())
    }

    pub async fn get_run(&self, run_id: Uuid) -> OrchResult<Option<Run>> {
        self.env.store.load_run(run_id).await.map_err(OrchError::from)
    }

    /// Stream events by cursor (`event_id > after`).
    pub async fn events(&self, run_id: Uuid, after: u64) -> OrchResult<Vec<(u64, RunEvent)>> {
        self.env
            .store
            .list_events(run_id, after)
            .await
            .map_err(OrchError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::error::ErrorKind;
    use crate::store::OrchStore;
    use crate::store_memory::MemoryStore;

    fn orchestrator() -> (Orchestrator, Arc<dyn OrchStore>) {
        let store: Arc<dyn OrchStore> = Arc::new(MemoryStore::new());
        let env = RunnerEnv::new(store.clone(), Settings::default());
        (Orchestrator::new(env), store)
    }

    fn definition() -> Value {
        json!({
            "procedure_id": "p", "version": "1.0",
            "variables_schema": {
                "required": {"city": {"type": "string"}},
                "optional": {"region": {"type": "string", "default": "eu"}},
            },
            "workflow_graph": {"start_node": "a", "nodes": {
                "a": {"type": "sequence", "next_node": "b", "steps": [
                    {"step_id": "s1", "action": "log", "message": "{{city}}"},
                ]},
                "b": {"type": "terminate"},
            }},
        })
    }

    #[tokio::test]
    async fn publish_rejects_invalid_definitions() {
        let (orch, _) = orchestrator();
        let err = orch
            .publish_procedure(json!({
                "procedure_id": "bad", "version": "1",
                "workflow_graph": {"start_node": "ghost", "nodes": {}},
            }))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn create_run_validates_inputs_and_enqueues() {
        let (orch, store) = orchestrator();
        orch.publish_procedure(definition()).await.unwrap();

        // Missing required var fails with a validation kind.
        let err = orch.create_run("p", None, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(err.message.contains("city"));

        let vars = json!({"city": "Oslo"}).as_object().cloned().unwrap();
        let run = orch.create_run("p", None, Some(vars)).await.unwrap();
        assert_eq!(run.status, RunStatus::Created);
        // Defaults were folded in.
        assert_eq!(run.input_vars.as_ref().unwrap()["region"], json!("eu"));

        let job = store.load_job(run.run_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        let events = store.list_events(run.run_id, 0).await.unwrap();
        assert_eq!(events[0].1.event_type, EventType::RunCreated);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let (orch, _) = orchestrator();
        orch.publish_procedure(definition()).await.unwrap();
        let vars = json!({"city": "Oslo"}).as_object().cloned().unwrap();
        let run = orch.create_run("p", None, Some(vars)).await.unwrap();

        assert!(orch.cancel_run(run.run_id).await.unwrap());
        assert!(orch.cancel_run(run.run_id).await.unwrap());
        assert!(!orch.cancel_run(Uuid::now_v7()).await.unwrap());
    }

    #[tokio::test]
    async fn prepare_retry_resets_a_failed_run() {
        let (orch, store) = orchestrator();
        orch.publish_procedure(definition()).await.unwrap();
        let vars = json!({"city": "Oslo"}).as_object().cloned().unwrap();
        let run = orch.create_run("p", None, Some(vars)).await.unwrap();

        // Simulate a worker driving the run to terminal failure.
        let job = store.load_job(run.run_id).await.unwrap().unwrap();
        store
            .update_run_status(run.run_id, RunStatus::Failed)
            .await
            .unwrap();
        store
            .set_run_cursor(run.run_id, Some("a"), Some("s1"))
            .await
            .unwrap();
        store.mark_job_failed(job.job_id, "agent down").await.unwrap();

        let reset = orch.prepare_retry(run.run_id).await.unwrap();
        assert_eq!(reset.status, RunStatus::Created);
        assert!(reset.ended_at.is_none());
        assert!(reset.last_step_id.is_none());
        assert_eq!(reset.thread_id, run.thread_id);

        let job = store.load_job(run.run_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.priority, RESUME_PRIORITY);

        let types: Vec<&str> = store
            .list_events(run.run_id, 0)
            .await
            .unwrap()
            .iter()
            .map(|(_, e)| e.event_type.as_str())
            .collect();
        assert!(types.contains(&"run_retry_requested"));

        // Unknown runs are a validation error.
        assert!(orch.prepare_retry(Uuid::now_v7()).await.is_err());
    }

    #[tokio::test]
    async fn delegated_completion_caches_result_and_requeues() {
        let (orch, store) = orchestrator();
        orch.publish_procedure(definition()).await.unwrap();
        let vars = json!({"city": "Oslo"}).as_object().cloned().unwrap();
        let run = orch.create_run("p", None, Some(vars)).await.unwrap();

        orch.complete_delegated_step(run.run_id, "a", "s1", json!({"ok": true}))
            .await
            .unwrap();

        let record = store
            .idempotency_get(run.run_id, "a", "s1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, IdempotencyStatus::Succeeded);
        let job = store.load_job(run.run_id).await.unwrap().unwrap();
        assert_eq!(job.priority, RESUME_PRIORITY);
    }
}
