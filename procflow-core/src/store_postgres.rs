use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::events::{EventType, RunEvent};
use crate::state::RunState;
use crate::store::OrchStore;
use crate::types::*;

/// PostgreSQL-backed implementation of `OrchStore`.
///
/// All queries are runtime-checked `sqlx::query` (the tables come from
/// embedded migrations that may not exist at compile time). Job claiming
/// uses `FOR UPDATE SKIP LOCKED`; lease acquisition serializes per resource
/// key with an advisory transaction lock so count-and-insert is atomic.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run procflow migrations")?;
        Ok(())
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::seconds(300))
}

// ─── Status conversions ───────────────────────────────────────

fn run_status_from_str(s: &str) -> Result<RunStatus> {
    Ok(match s {
        "created" => RunStatus::Created,
        "running" => RunStatus::Running,
        "waiting_approval" => RunStatus::WaitingApproval,
        "completed" => RunStatus::Completed,
        "failed" => RunStatus::Failed,
        "canceled" => RunStatus::Canceled,
        other => return Err(anyhow!("unknown run status '{other}'")),
    })
}

fn job_status_from_str(s: &str) -> Result<JobStatus> {
    Ok(match s {
        "queued" => JobStatus::Queued,
        "running" => JobStatus::Running,
        "done" => JobStatus::Done,
        "failed" => JobStatus::Failed,
        other => return Err(anyhow!("unknown job status '{other}'")),
    })
}

fn approval_status_from_str(s: &str) -> Result<ApprovalStatus> {
    Ok(match s {
        "pending" => ApprovalStatus::Pending,
        "approved" => ApprovalStatus::Approved,
        "rejected" => ApprovalStatus::Rejected,
        "timed_out" => ApprovalStatus::TimedOut,
        other => return Err(anyhow!("unknown approval status '{other}'")),
    })
}

fn agent_status_from_str(s: &str) -> Result<AgentStatus> {
    Ok(match s {
        "online" => AgentStatus::Online,
        "offline" => AgentStatus::Offline,
        "degraded" => AgentStatus::Degraded,
        other => return Err(anyhow!("unknown agent status '{other}'")),
    })
}

fn agent_status_str(s: AgentStatus) -> &'static str {
    match s {
        AgentStatus::Online => "online",
        AgentStatus::Offline => "offline",
        AgentStatus::Degraded => "degraded",
    }
}

fn procedure_status_from_str(s: &str) -> Result<ProcedureStatus> {
    Ok(match s {
        "draft" => ProcedureStatus::Draft,
        "active" => ProcedureStatus::Active,
        "deprecated" => ProcedureStatus::Deprecated,
        "archived" => ProcedureStatus::Archived,
        other => return Err(anyhow!("unknown procedure status '{other}'")),
    })
}

fn procedure_status_str(s: ProcedureStatus) -> &'static str {
    match s {
        ProcedureStatus::Draft => "draft",
        ProcedureStatus::Active => "active",
        ProcedureStatus::Deprecated => "deprecated",
        ProcedureStatus::Archived => "archived",
    }
}

fn event_type_from_str(s: &str) -> Result<EventType> {
    serde_json::from_value(Value::String(s.to_string()))
        .map_err(|_| anyhow!("unknown event type '{s}'"))
}

// ─── Row decoders ─────────────────────────────────────────────

fn run_from_row(row: &PgRow) -> Result<Run> {
    let status: String = row.get("status");
    Ok(Run {
        run_id: row.get("run_id"),
        thread_id: row.get("thread_id"),
        procedure_id: row.get("procedure_id"),
        procedure_version: row.get("procedure_version"),
        status: run_status_from_str(&status)?,
        input_vars: row.get("input_vars"),
        cancellation_requested: row.get("cancellation_requested"),
        last_node_id: row.get("last_node_id"),
        last_step_id: row.get("last_step_id"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
    })
}

fn job_from_row(row: &PgRow) -> Result<RunJob> {
    let status: String = row.get("status");
    Ok(RunJob {
        job_id: row.get("job_id"),
        run_id: row.get("run_id"),
        status: job_status_from_str(&status)?,
        priority: row.get("priority"),
        attempts: row.get("attempts"),
        max_attempts: row.get("max_attempts"),
        available_at: row.get("available_at"),
        locked_by: row.get("locked_by"),
        locked_until: row.get("locked_until"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn approval_from_row(row: &PgRow) -> Result<Approval> {
    let status: String = row.get("status");
    let options: Option<Value> = row.get("options");
    Ok(Approval {
        approval_id: row.get("approval_id"),
        run_id: row.get("run_id"),
        node_id: row.get("node_id"),
        prompt: row.get("prompt"),
        decision_type: row.get("decision_type"),
        options: options.and_then(|v| serde_json::from_value(v).ok()),
        context_data: row.get("context_data"),
        status: approval_status_from_str(&status)?,
        decided_by: row.get("decided_by"),
        decision_payload: row.get("decision_payload"),
        created_at: row.get("created_at"),
        decided_at: row.get("decided_at"),
    })
}

fn agent_from_row(row: &PgRow) -> Result<AgentInstance> {
    let status: String = row.get("status");
    Ok(AgentInstance {
        agent_id: row.get("agent_id"),
        name: row.get("name"),
        channel: row.get("channel"),
        base_url: row.get("base_url"),
        status: agent_status_from_str(&status)?,
        capabilities: row.get("capabilities"),
        resource_key: row.get("resource_key"),
        concurrency_limit: row.get("concurrency_limit"),
        consecutive_failures: row.get("consecutive_failures"),
        circuit_open_at: row.get("circuit_open_at"),
        pool_id: row.get("pool_id"),
    })
}

fn lease_from_row(row: &PgRow) -> ResourceLease {
    ResourceLease {
        lease_id: row.get("lease_id"),
        resource_key: row.get("resource_key"),
        run_id: row.get("run_id"),
        node_id: row.get("node_id"),
        step_id: row.get("step_id"),
        acquired_at: row.get("acquired_at"),
        expires_at: row.get("expires_at"),
        released_at: row.get("released_at"),
    }
}

fn checkpoint_from_row(row: &PgRow) -> Result<Checkpoint> {
    let state_json: Value = row.get("state");
    let step: i64 = row.get("step");
    Ok(Checkpoint {
        checkpoint_id: row.get("checkpoint_id"),
        thread_id: row.get("thread_id"),
        parent_checkpoint_id: row.get("parent_checkpoint_id"),
        step: step as u64,
        state: serde_json::from_value(state_json).context("failed to decode checkpoint state")?,
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl OrchStore for PostgresStore {
    // ── Procedures ──

    async fn put_procedure(&self, record: &ProcedureRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO procedures (procedure_id, version, status, definition, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (procedure_id, version) DO NOTHING
            "#,
        )
        .bind(&record.procedure_id)
        .bind(&record.version)
        .bind(procedure_status_str(record.status))
        .bind(&record.definition)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow!(
                "procedure {}@{} already published",
                record.procedure_id,
                record.version
            ));
        }
        Ok(())
    }

    async fn get_procedure(
        &self,
        procedure_id: &str,
        version: Option<&str>,
    ) -> Result<Option<ProcedureRecord>> {
        let wanted = version.filter(|v| *v != "latest");
        let row = match wanted {
            Some(v) => {
                sqlx::query(
                    "SELECT * FROM procedures WHERE procedure_id = $1 AND version = $2",
                )
                .bind(procedure_id)
                .bind(v)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT * FROM procedures WHERE procedure_id = $1
                    ORDER BY created_at DESC LIMIT 1
                    "#,
                )
                .bind(procedure_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        match row {
            None => Ok(None),
            Some(row) => {
                let status: String = row.get("status");
                Ok(Some(ProcedureRecord {
                    procedure_id: row.get("procedure_id"),
                    version: row.get("version"),
                    status: procedure_status_from_str(&status)?,
                    definition: row.get("definition"),
                    created_at: row.get("created_at"),
                }))
            }
        }
    }

    async fn list_procedure_ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT procedure_id FROM procedures ORDER BY procedure_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("procedure_id")).collect())
    }

    // ── Runs ──

    async fn create_run(&self, run: &Run) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (
                run_id, thread_id, procedure_id, procedure_version, status,
                input_vars, cancellation_requested, last_node_id, last_step_id,
                error_message, created_at, started_at, ended_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(run.run_id)
        .bind(&run.thread_id)
        .bind(&run.procedure_id)
        .bind(&run.procedure_version)
        .bind(run.status.as_str())
        .bind(&run.input_vars)
        .bind(run.cancellation_requested)
        .bind(&run.last_node_id)
        .bind(&run.last_step_id)
        .bind(&run.error_message)
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.ended_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        let row = sqlx::query("SELECT * FROM runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<Run>> {
        let rows = match status {
            Some(status) => {
                sqlx::query("SELECT * FROM runs WHERE status = $1 ORDER BY created_at")
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM runs ORDER BY created_at")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(run_from_row).collect()
    }

    async fn update_run_status(&self, run_id: Uuid, status: RunStatus) -> Result<()> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE runs SET
                status = $2,
                started_at = CASE WHEN $2 = 'running' THEN COALESCE(started_at, $3)
                                  ELSE started_at END,
                ended_at = CASE WHEN $2 IN ('completed', 'failed', 'canceled') THEN $3
                                ELSE ended_at END
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow!("run not found: {run_id}"));
        }
        Ok(())
    }

    async fn set_run_error(&self, run_id: Uuid, message: &str) -> Result<()> {
        sqlx::query("UPDATE runs SET error_message = $2 WHERE run_id = $1")
            .bind(run_id)
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_run_cursor(
        &self,
        run_id: Uuid,
        node_id: Option<&str>,
        step_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE runs SET last_node_id = $2, last_step_id = $3 WHERE run_id = $1")
            .bind(run_id)
            .bind(node_id)
            .bind(step_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reset_run_for_retry(&self, run_id: Uuid) -> Result<Option<Run>> {
        let row = sqlx::query(
            r#"
            UPDATE runs SET
                status = 'created',
                ended_at = NULL,
                last_step_id = NULL,
                thread_id = CASE WHEN thread_id = '' THEN run_id::text ELSE thread_id END
            WHERE run_id = $1
            RETURNING *
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn request_cancellation(&self, run_id: Uuid) -> Result<bool> {
        let result =
            sqlx::query("UPDATE runs SET cancellation_requested = TRUE WHERE run_id = $1")
                .bind(run_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn cancellation_requested(&self, run_id: Uuid) -> Result<bool> {
        let row = sqlx::query("SELECT cancellation_requested FROM runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|r| r.get::<bool, _>("cancellation_requested"))
            .unwrap_or(false))
    }

    async fn delete_run(&self, run_id: Uuid) -> Result<bool> {
        let Some(run) = self.load_run(run_id).await? else {
            return Ok(false);
        };
        // Checkpoints are keyed by thread, not run: delete the run's thread
        // and any derived threads (e.g. `:on_failure`).
        sqlx::query("DELETE FROM checkpoints WHERE thread_id = $1 OR thread_id LIKE $1 || ':%'")
            .bind(&run.thread_id)
            .execute(&self.pool)
            .await?;
        // Everything else cascades from the runs row.
        sqlx::query("DELETE FROM runs WHERE run_id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(true)
    }

    async fn prune_runs_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let rows = sqlx::query(
            r#"
            SELECT run_id FROM runs
            WHERE status IN ('completed', 'failed', 'canceled') AND created_at < $1
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut pruned = 0;
        for row in rows {
            if self.delete_run(row.get("run_id")).await? {
                pruned += 1;
            }
        }
        Ok(pruned)
    }

    // ── Job queue ──

    async fn enqueue_job(&self, job: &RunJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO run_jobs (
                job_id, run_id, status, priority, attempts, max_attempts,
                available_at, locked_by, locked_until, error_message,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(job.job_id)
        .bind(job.run_id)
        .bind(job.status.as_str())
        .bind(job.priority)
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.available_at)
        .bind(&job.locked_by)
        .bind(job.locked_until)
        .bind(&job.error_message)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn requeue_job(&self, run_id: Uuid, priority: i32, max_attempts: i32) -> Result<RunJob> {
        let now = Utc::now();
        // run_id is unique: reset the existing row in place so the resume
        // reuses the same queue slot.
        let row = sqlx::query(
            r#"
            UPDATE run_jobs SET
                status = 'queued', priority = $2, attempts = 0, max_attempts = $3,
                available_at = $4, locked_by = NULL, locked_until = NULL,
                error_message = NULL, updated_at = $4
            WHERE run_id = $1
            RETURNING *
            "#,
        )
        .bind(run_id)
        .bind(priority)
        .bind(max_attempts)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => job_from_row(&row),
            None => {
                let job = RunJob::new(run_id, priority, max_attempts);
                self.enqueue_job(&job).await?;
                Ok(job)
            }
        }
    }

    async fn claim_jobs(
        &self,
        worker_id: &str,
        max: usize,
        lock_duration: Duration,
    ) -> Result<Vec<RunJob>> {
        let now = Utc::now();
        let locked_until = now + to_chrono(lock_duration);
        let rows = sqlx::query(
            r#"
            WITH claimed AS (
                SELECT job_id
                FROM run_jobs
                WHERE (status = 'queued' AND available_at <= $3)
                   OR (status = 'running' AND locked_until < $3)
                ORDER BY priority DESC, available_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE run_jobs j
            SET status = 'running', locked_by = $1, locked_until = $4,
                attempts = j.attempts + 1, updated_at = $3
            FROM claimed
            WHERE j.job_id = claimed.job_id
            RETURNING j.*
            "#,
        )
        .bind(worker_id)
        .bind(max as i64)
        .bind(now)
        .bind(locked_until)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn load_job(&self, run_id: Uuid) -> Result<Option<RunJob>> {
        let row = sqlx::query("SELECT * FROM run_jobs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn mark_job_done(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE run_jobs SET status = 'done', locked_by = NULL,
                locked_until = NULL, updated_at = $2
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_job_failed(&self, job_id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE run_jobs SET status = 'failed', error_message = $2,
                locked_by = NULL, locked_until = NULL, updated_at = $3
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_job_retry(&self, job_id: Uuid, error: &str, backoff: Duration) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE run_jobs SET status = 'queued', error_message = $2,
                available_at = $3, locked_by = NULL, locked_until = NULL,
                updated_at = $4
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(error)
        .bind(now + to_chrono(backoff))
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn extend_job_lock(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE run_jobs SET locked_until = $3, updated_at = $4
            WHERE job_id = $1 AND status = 'running' AND locked_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(now + to_chrono(lock_duration))
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── Event log ──

    async fn append_event(&self, run_id: Uuid, event: &RunEvent) -> Result<u64> {
        // Per-run monotonic ids. A run has at most one executing worker at a
        // time (the job lock), so max+1 does not race in practice; the
        // primary key makes a theoretical race an error, not a corruption.
        let row = sqlx::query(
            r#"
            INSERT INTO run_events (run_id, event_id, event_type, node_id, step_id, attempt, payload)
            SELECT $1, COALESCE(MAX(event_id), 0) + 1, $2, $3, $4, $5, $6
            FROM run_events WHERE run_id = $1
            RETURNING event_id
            "#,
        )
        .bind(run_id)
        .bind(event.event_type.as_str())
        .bind(&event.node_id)
        .bind(&event.step_id)
        .bind(event.attempt.map(|a| a as i32))
        .bind(&event.payload)
        .fetch_one(&self.pool)
        .await?;

        let event_id: i64 = row.get("event_id");
        Ok(event_id as u64)
    }

    async fn list_events(&self, run_id: Uuid, after: u64) -> Result<Vec<(u64, RunEvent)>> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, event_type, node_id, step_id, attempt, payload
            FROM run_events
            WHERE run_id = $1 AND event_id > $2
            ORDER BY event_id ASC
            "#,
        )
        .bind(run_id)
        .bind(after as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let event_id: i64 = row.get("event_id");
            let event_type: String = row.get("event_type");
            let attempt: Option<i32> = row.get("attempt");
            events.push((
                event_id as u64,
                RunEvent {
                    event_type: event_type_from_str(&event_type)?,
                    node_id: row.get("node_id"),
                    step_id: row.get("step_id"),
                    attempt: attempt.map(|a| a as u32),
                    payload: row.get("payload"),
                },
            ));
        }
        Ok(events)
    }

    // ── Approvals ──

    async fn create_approval(&self, approval: &Approval) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO approvals (
                approval_id, run_id, node_id, prompt, decision_type, options,
                context_data, status, decided_by, decision_payload,
                created_at, decided_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(approval.approval_id)
        .bind(approval.run_id)
        .bind(&approval.node_id)
        .bind(&approval.prompt)
        .bind(&approval.decision_type)
        .bind(approval.options.as_ref().map(|o| serde_json::json!(o)))
        .bind(&approval.context_data)
        .bind(approval.status.as_str())
        .bind(&approval.decided_by)
        .bind(&approval.decision_payload)
        .bind(approval.created_at)
        .bind(approval.decided_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_approval(&self, approval_id: Uuid) -> Result<Option<Approval>> {
        let row = sqlx::query("SELECT * FROM approvals WHERE approval_id = $1")
            .bind(approval_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(approval_from_row).transpose()
    }

    async fn list_approvals(&self, status: Option<ApprovalStatus>) -> Result<Vec<Approval>> {
        let rows = match status {
            Some(status) => {
                sqlx::query("SELECT * FROM approvals WHERE status = $1 ORDER BY created_at")
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM approvals ORDER BY created_at")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(approval_from_row).collect()
    }

    async fn submit_approval_decision(
        &self,
        approval_id: Uuid,
        status: ApprovalStatus,
        decided_by: Option<&str>,
        payload: Option<Value>,
    ) -> Result<Option<Approval>> {
        let row = sqlx::query(
            r#"
            UPDATE approvals SET status = $2, decided_by = $3,
                decision_payload = $4, decided_at = $5
            WHERE approval_id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(approval_id)
        .bind(status.as_str())
        .bind(decided_by)
        .bind(payload)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(approval_from_row).transpose()
    }

    // ── Artifacts ──

    async fn add_artifact(&self, artifact: &Artifact) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO artifacts (artifact_id, run_id, node_id, step_id, kind, uri, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(artifact.artifact_id)
        .bind(artifact.run_id)
        .bind(&artifact.node_id)
        .bind(&artifact.step_id)
        .bind(&artifact.kind)
        .bind(&artifact.uri)
        .bind(artifact.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_artifacts(&self, run_id: Uuid) -> Result<Vec<Artifact>> {
        let rows =
            sqlx::query("SELECT * FROM artifacts WHERE run_id = $1 ORDER BY created_at ASC")
                .bind(run_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .iter()
            .map(|row| Artifact {
                artifact_id: row.get("artifact_id"),
                run_id: row.get("run_id"),
                node_id: row.get("node_id"),
                step_id: row.get("step_id"),
                kind: row.get("kind"),
                uri: row.get("uri"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    // ── Agent registry ──

    async fn upsert_agent(&self, agent: &AgentInstance) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agent_instances (
                agent_id, name, channel, base_url, status, capabilities,
                resource_key, concurrency_limit, consecutive_failures,
                circuit_open_at, pool_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (agent_id) DO UPDATE SET
                name = EXCLUDED.name,
                channel = EXCLUDED.channel,
                base_url = EXCLUDED.base_url,
                status = EXCLUDED.status,
                capabilities = EXCLUDED.capabilities,
                resource_key = EXCLUDED.resource_key,
                concurrency_limit = EXCLUDED.concurrency_limit
            "#,
        )
        .bind(&agent.agent_id)
        .bind(&agent.name)
        .bind(&agent.channel)
        .bind(&agent.base_url)
        .bind(agent_status_str(agent.status))
        .bind(&agent.capabilities)
        .bind(&agent.resource_key)
        .bind(agent.concurrency_limit)
        .bind(agent.consecutive_failures)
        .bind(agent.circuit_open_at)
        .bind(&agent.pool_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentInstance>> {
        let row = sqlx::query("SELECT * FROM agent_instances WHERE agent_id = $1")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(agent_from_row).transpose()
    }

    async fn list_agents(&self, channel: Option<&str>) -> Result<Vec<AgentInstance>> {
        let rows = match channel {
            Some(channel) => {
                sqlx::query("SELECT * FROM agent_instances WHERE channel = $1 ORDER BY name")
                    .bind(channel)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM agent_instances ORDER BY name")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(agent_from_row).collect()
    }

    async fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> Result<()> {
        sqlx::query("UPDATE agent_instances SET status = $2 WHERE agent_id = $1")
            .bind(agent_id)
            .bind(agent_status_str(status))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_agent_failure(&self, agent_id: &str, circuit_threshold: i32) -> Result<()> {
        // Last writer wins on the open timestamp; conservative either way.
        sqlx::query(
            r#"
            UPDATE agent_instances SET
                consecutive_failures = consecutive_failures + 1,
                circuit_open_at = CASE
                    WHEN consecutive_failures + 1 >= $2 AND circuit_open_at IS NULL THEN $3
                    ELSE circuit_open_at
                END
            WHERE agent_id = $1
            "#,
        )
        .bind(agent_id)
        .bind(circuit_threshold)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_agent_success(&self, agent_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE agent_instances SET consecutive_failures = 0, circuit_open_at = NULL
            WHERE agent_id = $1
            "#,
        )
        .bind(agent_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn agent_by_resource_key(&self, resource_key: &str) -> Result<Option<AgentInstance>> {
        let row = sqlx::query("SELECT * FROM agent_instances WHERE resource_key = $1 LIMIT 1")
            .bind(resource_key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(agent_from_row).transpose()
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
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // Serialize count-and-insert per resource key; without this two
        // concurrent acquirers could both pass the count check.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(resource_key)
            .execute(&mut *tx)
            .await?;

        let active: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS active FROM resource_leases
            WHERE resource_key = $1 AND released_at IS NULL AND expires_at > $2
            "#,
        )
        .bind(resource_key)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?
        .get("active");

        let limit: i32 = sqlx::query(
            "SELECT concurrency_limit FROM agent_instances WHERE resource_key = $1 LIMIT 1",
        )
        .bind(resource_key)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row.get("concurrency_limit"))
        .unwrap_or(1);

        if active >= limit as i64 {
            tx.rollback().await?;
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
        sqlx::query(
            r#"
            INSERT INTO resource_leases (
                lease_id, resource_key, run_id, node_id, step_id,
                acquired_at, expires_at, released_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(lease.lease_id)
        .bind(&lease.resource_key)
        .bind(lease.run_id)
        .bind(&lease.node_id)
        .bind(&lease.step_id)
        .bind(lease.acquired_at)
        .bind(lease.expires_at)
        .bind(lease.released_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(lease))
    }

    async fn release_lease(&self, lease_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE resource_leases SET released_at = $2 WHERE lease_id = $1 AND released_at IS NULL",
        )
        .bind(lease_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_leases_for_run(&self, run_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE resource_leases SET released_at = $2 WHERE run_id = $1 AND released_at IS NULL",
        )
        .bind(run_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_active_leases(&self, resource_key: Option<&str>) -> Result<Vec<ResourceLease>> {
        let now = Utc::now();
        let rows = match resource_key {
            Some(key) => {
                sqlx::query(
                    r#"
                    SELECT * FROM resource_leases
                    WHERE resource_key = $1 AND released_at IS NULL AND expires_at > $2
                    "#,
                )
                .bind(key)
                .bind(now)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM resource_leases WHERE released_at IS NULL AND expires_at > $1",
                )
                .bind(now)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows.iter().map(lease_from_row).collect())
    }

    async fn prune_expired_leases(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM resource_leases WHERE released_at IS NOT NULL OR expires_at <= $1",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ── Step idempotency ──

    async fn idempotency_get(
        &self,
        run_id: Uuid,
        node_id: &str,
        step_id: &str,
    ) -> Result<Option<StepIdempotency>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM step_idempotency
            WHERE run_id = $1 AND node_id = $2 AND step_id = $3
            "#,
        )
        .bind(run_id)
        .bind(node_id)
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(None),
            Some(row) => {
                let status: String = row.get("status");
                let status = match status.as_str() {
                    "started" => IdempotencyStatus::Started,
                    "succeeded" => IdempotencyStatus::Succeeded,
                    "failed" => IdempotencyStatus::Failed,
                    other => return Err(anyhow!("unknown idempotency status '{other}'")),
                };
                Ok(Some(StepIdempotency {
                    run_id: row.get("run_id"),
                    node_id: row.get("node_id"),
                    step_id: row.get("step_id"),
                    status,
                    result_json: row.get("result_json"),
                    updated_at: row.get("updated_at"),
                }))
            }
        }
    }

    async fn idempotency_put(&self, record: &StepIdempotency) -> Result<()> {
        let status = match record.status {
            IdempotencyStatus::Started => "started",
            IdempotencyStatus::Succeeded => "succeeded",
            IdempotencyStatus::Failed => "failed",
        };
        sqlx::query(
            r#"
            INSERT INTO step_idempotency (run_id, node_id, step_id, status, result_json, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (run_id, node_id, step_id) DO UPDATE SET
                status = EXCLUDED.status,
                result_json = EXCLUDED.result_json,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(record.run_id)
        .bind(&record.node_id)
        .bind(&record.step_id)
        .bind(status)
        .bind(&record.result_json)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Checkpoints ──

    async fn put_checkpoint(&self, thread_id: &str, state: &RunState) -> Result<Checkpoint> {
        let mut tx = self.pool.begin().await?;

        let last = sqlx::query(
            r#"
            SELECT checkpoint_id, step FROM checkpoints
            WHERE thread_id = $1 ORDER BY step DESC LIMIT 1
            "#,
        )
        .bind(thread_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (parent, step) = match last {
            Some(row) => {
                let step: i64 = row.get("step");
                (Some(row.get::<String, _>("checkpoint_id")), step + 1)
            }
            None => (None, 1),
        };

        let checkpoint = Checkpoint {
            checkpoint_id: Uuid::now_v7().to_string(),
            thread_id: thread_id.to_string(),
            parent_checkpoint_id: parent,
            step: step as u64,
            state: state.clone(),
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO checkpoints (
                thread_id, checkpoint_id, parent_checkpoint_id, step, state, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&checkpoint.thread_id)
        .bind(&checkpoint.checkpoint_id)
        .bind(&checkpoint.parent_checkpoint_id)
        .bind(step)
        .bind(serde_json::to_value(&checkpoint.state)?)
        .bind(checkpoint.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(checkpoint)
    }

    async fn list_checkpoints(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        let rows =
            sqlx::query("SELECT * FROM checkpoints WHERE thread_id = $1 ORDER BY step ASC")
                .bind(thread_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(checkpoint_from_row).collect()
    }

    async fn get_checkpoint(
        &self,
        thread_id: &str,
        checkpoint_id: Option<&str>,
    ) -> Result<Option<Checkpoint>> {
        let row = match checkpoint_id {
            Some(id) => {
                sqlx::query("SELECT * FROM checkpoints WHERE thread_id = $1 AND checkpoint_id = $2")
                    .bind(thread_id)
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT * FROM checkpoints WHERE thread_id = $1
                    ORDER BY step DESC LIMIT 1
                    "#,
                )
                .bind(thread_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        row.as_ref().map(checkpoint_from_row).transpose()
    }

    // ── Orchestrator workers ──

    async fn upsert_worker(&self, worker_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orchestrator_workers (worker_id, status, last_heartbeat_at, is_leader)
            VALUES ($1, 'online', $2, FALSE)
            ON CONFLICT (worker_id) DO UPDATE SET
                status = 'online', last_heartbeat_at = EXCLUDED.last_heartbeat_at
            "#,
        )
        .bind(worker_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn heartbeat_worker(&self, worker_id: &str) -> Result<()> {
        sqlx::query("UPDATE orchestrator_workers SET last_heartbeat_at = $2 WHERE worker_id = $1")
            .bind(worker_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn prune_stale_workers(&self, stale_after: Duration) -> Result<u64> {
        let cutoff = Utc::now() - to_chrono(stale_after);
        let result = sqlx::query("DELETE FROM orchestrator_workers WHERE last_heartbeat_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
