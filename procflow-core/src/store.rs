use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::events::RunEvent;
use crate::state::RunState;
use crate::types::*;

/// Persistence trait for all orchestrator state.
///
/// The runner, executors, and worker loop operate exclusively through this
/// trait, enabling pluggable backends: `MemoryStore` for tests and
/// single-process dev, `PostgresStore` for multi-worker production.
#[async_trait]
pub trait OrchStore: Send + Sync {
    // ── Procedures ──

    /// Store a published, immutable procedure version.
    async fn put_procedure(&self, record: &ProcedureRecord) -> Result<()>;
    /// Fetch a version; `None`/`"latest"` resolves the most recently created.
    async fn get_procedure(
        &self,
        procedure_id: &str,
        version: Option<&str>,
    ) -> Result<Option<ProcedureRecord>>;
    async fn list_procedure_ids(&self) -> Result<Vec<String>>;

    // ── Runs ──

    async fn create_run(&self, run: &Run) -> Result<()>;
    async fn load_run(&self, run_id: Uuid) -> Result<Option<Run>>;
    async fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<Run>>;
    /// Update status, stamping `started_at` on first transition to running
    /// and `ended_at` on terminal states.
    async fn update_run_status(&self, run_id: Uuid, status: RunStatus) -> Result<()>;
    async fn set_run_error(&self, run_id: Uuid, message: &str) -> Result<()>;
    async fn set_run_cursor(
        &self,
        run_id: Uuid,
        node_id: Option<&str>,
        step_id: Option<&str>,
    ) -> Result<()>;
    /// Reset a run for checkpoint-aware re-execution: status back to
    /// `created`, terminal timestamp and step cursor cleared, thread id
    /// defaulted. Returns the updated run, `None` when it does not exist.
    async fn reset_run_for_retry(&self, run_id: Uuid) -> Result<Option<Run>>;
    /// Set `cancellation_requested`. Idempotent; returns false if the run
    /// does not exist.
    async fn request_cancellation(&self, run_id: Uuid) -> Result<bool>;
    async fn cancellation_requested(&self, run_id: Uuid) -> Result<bool>;
    /// Delete a run and everything it owns (events, approvals, artifacts,
    /// leases, idempotency records, checkpoints).
    async fn delete_run(&self, run_id: Uuid) -> Result<bool>;
    /// Prune terminal runs created before the cutoff. Returns count pruned.
    async fn prune_runs_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    // ── Job queue ──

    /// Insert a queue row for a new run. `run_id` is unique: enqueueing a
    /// run that already has a job is an error; use `requeue_job`.
    async fn enqueue_job(&self, job: &RunJob) -> Result<()>;
    /// Reset an existing job row back to queued (approval resume). Falls
    /// back to insert when no row exists.
    async fn requeue_job(&self, run_id: Uuid, priority: i32, max_attempts: i32) -> Result<RunJob>;
    /// Atomically claim up to `max` due jobs for `worker_id`: queued rows
    /// plus running rows whose lock has expired (stalled-job recovery).
    /// Claimed rows become running with `locked_until = now + lock_duration`
    /// and `attempts` incremented.
    async fn claim_jobs(
        &self,
        worker_id: &str,
        max: usize,
        lock_duration: std::time::Duration,
    ) -> Result<Vec<RunJob>>;
    async fn load_job(&self, run_id: Uuid) -> Result<Option<RunJob>>;
    async fn mark_job_done(&self, job_id: Uuid) -> Result<()>;
    /// Terminal failure: no more retries.
    async fn mark_job_failed(&self, job_id: Uuid, error: &str) -> Result<()>;
    /// Schedule a retry: back to queued with `available_at = now + backoff`.
    async fn mark_job_retry(
        &self,
        job_id: Uuid,
        error: &str,
        backoff: std::time::Duration,
    ) -> Result<()>;
    /// Renew the lock while the job is running. Returns false if the job is
    /// no longer running under this worker.
    async fn extend_job_lock(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lock_duration: std::time::Duration,
    ) -> Result<bool>;

    // ── Event log (append-only) ──

    /// Append an event, assigning the next monotonic event id for the run.
    async fn append_event(&self, run_id: Uuid, event: &RunEvent) -> Result<u64>;
    /// Events with `event_id > after`, ordered ascending.
    async fn list_events(&self, run_id: Uuid, after: u64) -> Result<Vec<(u64, RunEvent)>>;

    // ── Approvals ──

    async fn create_approval(&self, approval: &Approval) -> Result<()>;
    async fn get_approval(&self, approval_id: Uuid) -> Result<Option<Approval>>;
    async fn list_approvals(&self, status: Option<ApprovalStatus>) -> Result<Vec<Approval>>;
    /// Record a decision on a pending approval. Returns the updated row, or
    /// `None` when the approval is missing or already decided.
    async fn submit_approval_decision(
        &self,
        approval_id: Uuid,
        status: ApprovalStatus,
        decided_by: Option<&str>,
        payload: Option<Value>,
    ) -> Result<Option<Approval>>;

    // ── Artifacts ──

    async fn add_artifact(&self, artifact: &Artifact) -> Result<()>;
    async fn list_artifacts(&self, run_id: Uuid) -> Result<Vec<Artifact>>;

    // ── Agent registry ──

    async fn upsert_agent(&self, agent: &AgentInstance) -> Result<()>;
    async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentInstance>>;
    async fn list_agents(&self, channel: Option<&str>) -> Result<Vec<AgentInstance>>;
    async fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> Result<()>;
    /// Increment consecutive failures; open the circuit at the threshold.
    async fn record_agent_failure(&self, agent_id: &str, circuit_threshold: i32) -> Result<()>;
    /// Reset consecutive failures and close the circuit.
    async fn record_agent_success(&self, agent_id: &str) -> Result<()>;
    async fn agent_by_resource_key(&self, resource_key: &str) -> Result<Option<AgentInstance>>;

    // ── Resource leases ──

    /// Atomic count-and-insert: if the number of active leases on the key is
    /// below the owning agent's concurrency limit (default 1), insert a
    /// lease expiring after `ttl` and return it; otherwise `None`.
    async fn try_acquire_lease(
        &self,
        resource_key: &str,
        run_id: Uuid,
        node_id: Option<&str>,
        step_id: Option<&str>,
        ttl: std::time::Duration,
    ) -> Result<Option<ResourceLease>>;
    async fn release_lease(&self, lease_id: Uuid) -> Result<()>;
    /// Release every open lease held by a run (cancellation cleanup).
    async fn release_leases_for_run(&self, run_id: Uuid) -> Result<u64>;
    async fn list_active_leases(&self, resource_key: Option<&str>) -> Result<Vec<ResourceLease>>;
    /// Drop leases already past expiry. Returns count removed.
    async fn prune_expired_leases(&self) -> Result<u64>;

    // ── Step idempotency ──

    async fn idempotency_get(
        &self,
        run_id: Uuid,
        node_id: &str,
        step_id: &str,
    ) -> Result<Option<StepIdempotency>>;
    async fn idempotency_put(&self, record: &StepIdempotency) -> Result<()>;

    // ── Checkpoints ──

    /// Append a checkpoint for the thread, assigning checkpoint_id, the next
    /// monotonic step, and the parent pointer. Returns the new checkpoint.
    async fn put_checkpoint(&self, thread_id: &str, state: &RunState) -> Result<Checkpoint>;
    /// Ordered by step ascending.
    async fn list_checkpoints(&self, thread_id: &str) -> Result<Vec<Checkpoint>>;
    /// Fetch one checkpoint (latest when `checkpoint_id` is `None`).
    async fn get_checkpoint(
        &self,
        thread_id: &str,
        checkpoint_id: Option<&str>,
    ) -> Result<Option<Checkpoint>>;

    // ── Orchestrator workers ──

    async fn upsert_worker(&self, worker_id: &str) -> Result<()>;
    async fn heartbeat_worker(&self, worker_id: &str) -> Result<()>;
    async fn prune_stale_workers(&self, stale_after: std::time::Duration) -> Result<u64>;
}
