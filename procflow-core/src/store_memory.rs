use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::events::RunEvent;
use crate::state::RunState;
use crate::store::OrchStore;
use crate::types::*;

struct Inner {
    procedures: Vec<ProcedureRecord>,
    runs: HashMap<Uuid, Run>,
    jobs: HashMap<Uuid, RunJob>,
    events: HashMap<Uuid, Vec<(u64, RunEvent)>>,
    event_seq: HashMap<Uuid, u64>,
    approvals: HashMap<Uuid, Approval>,
    artifacts: HashMap<Uuid, Vec<Artifact>>,
    agents: HashMap<String, AgentInstance>,
    leases: HashMap<Uuid, ResourceLease>,
    idempotency: HashMap<(Uuid, String, String), StepIdempotency>,
    checkpoints: HashMap<String, Vec<Checkpoint>>,
    workers: HashMap<String, OrchWorker>,
}

/// In-memory implementation of `OrchStore` for tests and single-process
/// development. Job claiming is optimistic under one write lock: safe
/// because a single process serializes all writers, the role SQLite plays
/// in multi-backend deployments.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                procedures: Vec::new(),
                runs: HashMap::new(),
                jobs: HashMap::new(),
                events: HashMap::new(),
                event_seq: HashMap::new(),
                approvals: HashMap::new(),
                artifacts: HashMap::new(),
                agents: HashMap::new(),
                leases: HashMap::new(),
                idempotency: HashMap::new(),
                checkpoints: HashMap::new(),
                workers: HashMap::new(),
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::seconds(300))
}

#[async_trait]
impl OrchStore for MemoryStore {
    // ── Procedures ──

    async fn put_procedure(&self, record: &ProcedureRecord) -> Result<()> {
        let mut w = self.inner.write().await;
        if w.procedures
            .iter()
            .any(|p| p.procedure_id == record.procedure_id && p.version == record.version)
        {
            return Err(anyhow!(
                "procedure {}@{} already published",
                record.procedure_id,
                record.version
            ));
        }
        w.procedures.push(record.clone());
        Ok(())
    }

    async fn get_procedure(
        &self,
        procedure_id: &str,
        version: Option<&str>,
    ) -> Result<Option<ProcedureRecord>> {
        let r = self.inner.read().await;
        let wanted = version.filter(|v| *v != "latest");
        match wanted {
            Some(v) => Ok(r
                .procedures
                .iter()
                .find(|p| p.procedure_id == procedure_id && p.version == v)
                .cloned()),
            None => Ok(r
                .procedures
                .iter()
                .filter(|p| p.procedure_id == procedure_id)
                .max_by_key(|p| p.created_at)
                .cloned()),
        }
    }

    async fn list_procedure_ids(&self) -> Result<Vec<String>> {
        let r = self.inner.read().await;
        let mut ids: Vec<String> = r
            .procedures
            .iter()
            .map(|p| p.procedure_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    // ── Runs ──

    async fn create_run(&self, run: &Run) -> Result<()> {
        let mut w = self.inner.write().await;
        w.runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        let r = self.inner.read().await;
        Ok(r.runs.get(&run_id).cloned())
    }

    async fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<Run>> {
        let r = self.inner.read().await;
        let mut runs: Vec<Run> = r
            .runs
            .values()
            .filter(|run| status.map(|s| run.status == s).unwrap_or(true))
            .cloned()
            .collect();
        runs.sort_by_key(|run| run.created_at);
        Ok(runs)
    }

    async fn update_run_status(&self, run_id: Uuid, status: RunStatus) -> Result<()> {
        let mut w = self.inner.write().await;
        let run = w
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| anyhow!("run not found: {run_id}"))?;
        run.status = status;
        if status == RunStatus::Running && run.started_at.is_none() {
            run.started_at = Some(Utc::now());
        }
        if status.is_terminal() {
            run.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn set_run_error(&self, run_id: Uuid, message: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        let run = w
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| anyhow!("run not found: {run_id}"))?;
        run.error_message = Some(message.to_string());
        Ok(())
    }

    async fn set_run_cursor(
        &self,
        run_id: Uuid,
        node_id: Option<&str>,
        step_id: Option<&str>,
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        let run = w
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| anyhow!("run not found: {run_id}"))?;
        run.last_node_id = node_id.map(str::to_string);
        run.last_step_id = step_id.map(str::to_string);
        Ok(())
    }

    async fn reset_run_for_retry(&self, run_id: Uuid) -> Result<Option<Run>> {
        let mut w = self.inner.write().await;
        let Some(run) = w.runs.get_mut(&run_id) else {
            return Ok(None);
        };
        run.status = RunStatus::Created;
        run.ended_at = None;
        run.last_step_id = None;
        if run.thread_id.is_empty() {
            run.thread_id = run.run_id.to_string();
        }
        Ok(Some(run.clone()))
    }

    async fn request_cancellation(&self, run_id: Uuid) -> Result<bool> {
        let mut w = self.inner.write().await;
        match w.runs.get_mut(&run_id) {
            Some(run) => {
                run.cancellation_requested = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn cancellation_requested(&self, run_id: Uuid) -> Result<bool> {
        let r = self.inner.read().await;
        Ok(r.runs
            .get(&run_id)
            .map(|run| run.cancellation_requested)
            .unwrap_or(false))
    }

    async fn delete_run(&self, run_id: Uuid) -> Result<bool> {
        let mut w = self.inner.write().await;
        let Some(run) = w.runs.remove(&run_id) else {
            return Ok(false);
        };
        w.jobs.retain(|_, job| job.run_id != run_id);
        w.events.remove(&run_id);
        w.event_seq.remove(&run_id);
        w.approvals.retain(|_, a| a.run_id != run_id);
        w.artifacts.remove(&run_id);
        w.leases.retain(|_, l| l.run_id != run_id);
        w.idempotency.retain(|(rid, _, _), _| *rid != run_id);
        w.checkpoints
            .retain(|thread, _| !thread.starts_with(&run.thread_id));
        Ok(true)
    }

    async fn prune_runs_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let ids: Vec<Uuid> = {
            let r = self.inner.read().await;
            r.runs
                .values()
                .filter(|run| run.status.is_terminal() && run.created_at < cutoff)
                .map(|run| run.run_id)
                .collect()
        };
        let mut pruned = 0;
        for id in ids {
            if self.delete_run(id).await? {
                pruned += 1;
            }
        }
        Ok(pruned)
    }

    // ── Job queue ──

    async fn enqueue_job(&self, job: &RunJob) -> Result<()> {
        let mut w = self.inner.write().await;
        if w.jobs.values().any(|j| j.run_id == job.run_id) {
            return Err(anyhow!("job already exists for run {}", job.run_id));
        }
        w.jobs.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn requeue_job(&self, run_id: Uuid, priority: i32, max_attempts: i32) -> Result<RunJob> {
        let mut w = self.inner.write().await;
        let now = Utc::now();
        if let Some(job) = w.jobs.values_mut().find(|j| j.run_id == run_id) {
            job.status = JobStatus::Queued;
            job.priority = priority;
            job.attempts = 0;
            job.max_attempts = max_attempts;
            job.available_at = now;
            job.locked_by = None;
            job.locked_until = None;
            job.error_message = None;
            job.updated_at = now;
            return Ok(job.clone());
        }
        let job = RunJob::new(run_id, priority, max_attempts);
        w.jobs.insert(job.job_id, job.clone());
        Ok(job)
    }

    async fn claim_jobs(
        &self,
        worker_id: &str,
        max: usize,
        lock_duration: Duration,
    ) -> Result<Vec<RunJob>> {
        let mut w = self.inner.write().await;
        let now = Utc::now();

        let mut due: Vec<Uuid> = w
            .jobs
            .values()
            .filter(|job| match job.status {
                JobStatus::Queued => job.available_at <= now,
                // Stalled-job recovery: the previous worker's lock expired.
                JobStatus::Running => job.locked_until.map(|t| t < now).unwrap_or(true),
                _ => false,
            })
            .map(|job| job.job_id)
            .collect();

        due.sort_by(|a, b| {
            let ja = &w.jobs[a];
            let jb = &w.jobs[b];
            jb.priority
                .cmp(&ja.priority)
                .then(ja.available_at.cmp(&jb.available_at))
        });

        let mut claimed = Vec::new();
        for job_id in due.into_iter().take(max) {
            if let Some(job) = w.jobs.get_mut(&job_id) {
                job.status = JobStatus::Running;
                job.locked_by = Some(worker_id.to_string());
                job.locked_until = Some(now + to_chrono(lock_duration));
                job.attempts += 1;
                job.updated_at = now;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn load_job(&self, run_id: Uuid) -> Result<Option<RunJob>> {
        let r = self.inner.read().await;
        Ok(r.jobs.values().find(|j| j.run_id == run_id).cloned())
    }

    async fn mark_job_done(&self, job_id: Uuid) -> Result<()> {
        let mut w = self.inner.write().await;
        let job = w
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| anyhow!("job not found: {job_id}"))?;
        job.status = JobStatus::Done;
        job.locked_by = None;
        job.locked_until = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_job_failed(&self, job_id: Uuid, error: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        let job = w
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| anyhow!("job not found: {job_id}"))?;
        job.status = JobStatus::Failed;
        job.error_message = Some(error.to_string());
        job.locked_by = None;
        job.locked_until = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_job_retry(&self, job_id: Uuid, error: &str, backoff: Duration) -> Result<()> {
        let mut w = self.inner.write().await;
        let now = Utc::now();
        let job = w
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| anyhow!("job not found: {job_id}"))?;
        job.status = JobStatus::Queued;
        job.error_message = Some(error.to_string());
        job.available_at = now + to_chrono(backoff);
        job.locked_by = None;
        job.locked_until = None;
        job.updated_at = now;
        Ok(())
    }

    async fn extend_job_lock(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<bool> {
        let mut w = self.inner.write().await;
        let now = Utc::now();
        match w.jobs.get_mut(&job_id) {
            Some(job)
                if job.status == JobStatus::Running
                    && job.locked_by.as_deref() == Some(worker_id) =>
            {
                job.locked_until = Some(now + to_chrono(lock_duration));
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    // ── Event log ──

    async fn append_event(&self, run_id: Uuid, event: &RunEvent) -> Result<u64> {
        let mut w = self.inner.write().await;
        let seq = w.event_seq.entry(run_id).or_insert(0);
        *seq += 1;
        let event_id = *seq;
        w.events
            .entry(run_id)
            .or_default()
            .push((event_id, event.clone()));
        Ok(event_id)
    }

    async fn list_events(&self, run_id: Uuid, after: u64) -> Result<Vec<(u64, RunEvent)>> {
        let r = self.inner.read().await;
        Ok(r.events
            .get(&run_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|(id, _)| *id > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    // ── Approvals ──

    async fn create_approval(&self, approval: &Approval) -> Result<()> {
        let mut w = self.inner.write().await;
        w.approvals.insert(approval.approval_id, approval.clone());
        Ok(())
    }

    async fn get_approval(&self, approval_id: Uuid) -> Result<Option<Approval>> {
        let r = self.inner.read().await;
        Ok(r.approvals.get(&approval_id).cloned())
    }

    async fn list_approvals(&self, status: Option<ApprovalStatus>) -> Result<Vec<Approval>> {
        let r = self.inner.read().await;
        let mut approvals: Vec<Approval> = r
            .approvals
            .values()
            .filter(|a| status.map(|s| a.status == s).unwrap_or(true))
            .cloned()
            .collect();
        approvals.sort_by_key(|a| a.created_at);
        Ok(approvals)
    }

    async fn submit_approval_decision(
        &self,
        approval_id: Uuid,
        status: ApprovalStatus,
        decided_by: Option<&str>,
        payload: Option<Value>,
    ) -> Result<Option<Approval>> {
        let mut w = self.inner.write().await;
        match w.approvals.get_mut(&approval_id) {
            Some(approval) if approval.status == ApprovalStatus::Pending => {
                approval.status = status;
                approval.decided_by = decided_by.map(str::to_string);
                approval.decision_payload = payload;
                approval.decided_at = Some(Utc::now());
                Ok(Some(approval.clone()))
            }
            _ => Ok(None),
        }
    }

    // ── Artifacts ──

    async fn add_artifact(&self, artifact: &Artifact) -> Result<()> {
        let mut w = self.inner.write().await;
        w.artifacts
            .entry(artifact.run_id)
            .or_default()
            .push(artifact.clone());
        Ok(())
    }

    async fn list_artifacts(&self, run_id: Uuid) -> Result<Vec<Artifact>> {
        let r = self.inner.read().await;
        Ok(r.artifacts.get(&run_id).cloned().unwrap_or_default())
    }

    // ── Agent registry ──

    async fn upsert_agent(&self, agent: &AgentInstance) -> Result<()> {
        let mut w = self.inner.write().await;
        w.agents.insert(agent.agent_id.clone(), agent.clone());
        Ok(())
    }

    async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentInstance>> {
        let r = self.inner.read().await;
        Ok(r.agents.get(agent_id).cloned())
    }

    async fn list_agents(&self, channel: Option<&str>) -> Result<Vec<AgentInstance>> {
        let r = self.inner.read().await;
        let mut agents: Vec<AgentInstance> = r
            .agents
            .values()
            .filter(|a| channel.map(|c| a.channel == c).unwrap_or(true))
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(agents)
    }

    async fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> Result<()> {
        let mut w = self.inner.write().await;
        if let Some(agent) = w.agents.get_mut(agent_id) {
            agent.status = status;
        }
        Ok(())
    }

    async fn record_agent_failure(&self, agent_id: &str, circuit_threshold: i32) -> Result<()> {
        let mut w = self.inner.write().await;
        if let Some(agent) = w.agents.get_mut(agent_id) {
            agent.consecutive_failures += 1;
            if agent.consecutive_failures >= circuit_threshold && agent.circuit_open_at.is_none() {
                agent.circuit_open_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn record_agent_success(&self, agent_id: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        if let Some(agent) = w.agents.get_mut(agent_id) {
            agent.consecutive_failures = 0;
            agent.circuit_open_at = None;
        }
        Ok(())
    }

    async fn agent_by_resource_key(&self, resource_key: &str) -> Result<Option<AgentInstance>> {
        let r = self.inner.read().await;
        Ok(r.agents
            .values()
            .find(|a| a.resource_key == resource_key)
            .cloned())
    }

    // ── Resource leases ──

    async fn try_acquire_lease(
        &self,
        resource_key: &str,
        run_id: Uuid,
        node_id: Option<&str>,
        step_id: Option<&str>,
        ttl: Duration,
    ) -> Result<Option<ResourceLease>> {
        // Count and insert under one write lock: the memory-store
        // equivalent of the single-transaction requirement.
        let mut w = self.inner.write().await;
        let now = Utc::now();

        let active = w
            .leases
            .values()
            .filter(|l| l.resource_key == resource_key && l.is_active(now))
            .count() as i32;

        let limit = w
            .agents
            .values()
            .find(|a| a.resource_key == resource_key)
            .map(|a| a.concurrency_limit)
            .unwrap_or(1);

        if active >= limit {
            return Ok(None);
        }

        let lease = ResourceLease {
            lease_id: Uuid::now_v7(),
            resource_key: resource_key.to_string(),
            run_id,
            node_id: node_id.map(str::to_string),
            step_id: step_id.map(str::to_string),
            acquired_at: now,
            expires_at: now + to_chrono(ttl),
            released_at: None,
        };
        w.leases.insert(lease.lease_id, lease.clone());
        Ok(Some(lease))
    }

    async fn release_lease(&self, lease_id: Uuid) -> Result<()> {
        let mut w = self.inner.write().await;
        if let Some(lease) = w.leases.get_mut(&lease_id) {
            if lease.released_at.is_none() {
                lease.released_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn release_leases_for_run(&self, run_id: Uuid) -> Result<u64> {
        let mut w = self.inner.write().await;
        let now = Utc::now();
        let mut released = 0;
        for lease in w.leases.values_mut() {
            if lease.run_id == run_id && lease.released_at.is_none() {
                lease.released_at = Some(now);
                released += 1;
            }
        }
        Ok(released)
    }

    async fn list_active_leases(&self, resource_key: Option<&str>) -> Result<Vec<ResourceLease>> {
        let r = self.inner.read().await;
        let now = Utc::now();
        Ok(r.leases
            .values()
            .filter(|l| l.is_active(now))
            .filter(|l| resource_key.map(|k| l.resource_key == k).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn prune_expired_leases(&self) -> Result<u64> {
        let mut w = self.inner.write().await;
        let now = Utc::now();
        let before = w.leases.len();
        w.leases
            .retain(|_, l| l.released_at.is_none() && l.expires_at > now);
        Ok((before - w.leases.len()) as u64)
    }

    // ── Step idempotency ──

    async fn idempotency_get(
        &self,
        run_id: Uuid,
        node_id: &str,
        step_id: &str,
    ) -> Result<Option<StepIdempotency>> {
        let r = self.inner.read().await;
        Ok(r.idempotency
            .get(&(run_id, node_id.to_string(), step_id.to_string()))
            .cloned())
    }

    async fn idempotency_put(&self, record: &StepIdempotency) -> Result<()> {
        let mut w = self.inner.write().await;
        w.idempotency.insert(
            (
                record.run_id,
                record.node_id.clone(),
                record.step_id.clone(),
            ),
            record.clone(),
        );
        Ok(())
    }

    // ── Checkpoints ──

    async fn put_checkpoint(&self, thread_id: &str, state: &RunState) -> Result<Checkpoint> {
        let mut w = self.inner.write().await;
        let chain = w.checkpoints.entry(thread_id.to_string()).or_default();
        let last = chain.last();
        let checkpoint = Checkpoint {
            checkpoint_id: Uuid::now_v7().to_string(),
            thread_id: thread_id.to_string(),
            parent_checkpoint_id: last.map(|c| c.checkpoint_id.clone()),
            step: last.map(|c| c.step + 1).unwrap_or(1),
            state: state.clone(),
            created_at: Utc::now(),
        };
        chain.push(checkpoint.clone());
        Ok(checkpoint)
    }

    async fn list_checkpoints(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        let r = self.inner.read().await;
        Ok(r.checkpoints.get(thread_id).cloned().unwrap_or_default())
    }

    async fn get_checkpoint(
        &self,
        thread_id: &str,
        checkpoint_id: Option<&str>,
    ) -> Result<Option<Checkpoint>> {
        let r = self.inner.read().await;
        let Some(chain) = r.checkpoints.get(thread_id) else {
            return Ok(None);
        };
        Ok(match checkpoint_id {
            Some(id) => chain.iter().find(|c| c.checkpoint_id == id).cloned(),
            None => chain.last().cloned(),
        })
    }

    // ── Orchestrator workers ──

    async fn upsert_worker(&self, worker_id: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        w.workers.insert(
            worker_id.to_string(),
            OrchWorker {
                worker_id: worker_id.to_string(),
                status: "online".to_string(),
                last_heartbeat_at: Utc::now(),
                is_leader: false,
            },
        );
        Ok(())
    }

    async fn heartbeat_worker(&self, worker_id: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        if let Some(worker) = w.workers.get_mut(worker_id) {
            worker.last_heartbeat_at = Utc::now();
        }
        Ok(())
    }

    async fn prune_stale_workers(&self, stale_after: Duration) -> Result<u64> {
        let mut w = self.inner.write().await;
        let cutoff = Utc::now() - to_chrono(stale_after);
        let before = w.workers.len();
        w.workers.retain(|_, wk| wk.last_heartbeat_at >= cutoff);
        Ok((before - w.workers.len()) as u64)
    }
}
