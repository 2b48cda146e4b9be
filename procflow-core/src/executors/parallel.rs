//! Parallel executor: branches run as sibling tasks against copies of the
//! state, joined according to the wait strategy.
//!
//! State merge is a set-union of variables written by the branches with
//! last-writer-wins (in branch completion order) for scalars written by
//! more than one branch. Completion order is non-deterministic, so
//! conflicting scalar writes are too.

use serde_json::{json, Value};
use tokio::task::JoinSet;
use tracing::warn;

use crate::compiler::ir::{BranchFailure, IrNode, ParallelPayload, WaitStrategy};
use crate::error::{OrchError, OrchResult};
use crate::executors::ExecCtx;
use crate::runner::{run_subgraph, RunOutcome};
use crate::state::RunState;

pub async fn execute(
    ctx: &ExecCtx,
    node: &IrNode,
    payload: &ParallelPayload,
    state: &mut RunState,
) -> OrchResult<()> {
    ctx.check_cancelled()?;

    let mut tasks: JoinSet<(String, OrchResult<(RunState, RunOutcome)>)> = JoinSet::new();
    for branch in &payload.branches {
        let env = ctx.env.clone();
        let ir = ctx.ir.clone();
        let branch_id = branch.branch_id.clone();
        let entry = branch.start_node_id.clone();

        let mut branch_state = state.clone();
        branch_state.next_node_id = None;
        branch_state.terminal_status = None;

        tasks.spawn(async move {
            // Branches run without their own checkpoint thread; the parent
            // checkpoints at the node boundary after the join.
            let result = run_subgraph(env, ir, branch_state, Some(entry), None).await;
            (branch_id, result)
        });
    }

    let needed = match payload.wait_strategy {
        WaitStrategy::All => payload.branches.len(),
        WaitStrategy::Any => 1,
        WaitStrategy::FirstN(n) => n.clamp(1, payload.branches.len()),
    };

    let mut successes = 0usize;
    let mut first_error: Option<OrchError> = None;

    while let Some(joined) = tasks.join_next().await {
        let Ok((branch_id, result)) = joined else {
            // A branch task was aborted after the strategy was satisfied.
            continue;
        };
        match result {
            Ok((branch_state, RunOutcome::Completed)) => {
                merge_branch_state(state, branch_state);
                successes += 1;
                if successes >= needed {
                    tasks.abort_all();
                    break;
                }
            }
            Ok((_, RunOutcome::Suspended(_))) => {
                let err = OrchError::internal(format!(
                    "branch '{branch_id}' suspended; approvals inside parallel branches \
                     are not supported"
                ));
                record_branch_error(state, &branch_id, &err);
                if payload.branch_failure == BranchFailure::FailFast {
                    tasks.abort_all();
                    return Err(err);
                }
                first_error.get_or_insert(err);
            }
            Err(err) => {
                if err.kind == crate::error::ErrorKind::Cancelled {
                    tasks.abort_all();
                    return Err(err);
                }
                warn!(node_id = %node.node_id, branch_id = %branch_id, error = %err, "branch failed");
                record_branch_error(state, &branch_id, &err);
                if payload.branch_failure == BranchFailure::FailFast {
                    tasks.abort_all();
                    return Err(err);
                }
                first_error.get_or_insert(err);
            }
        }
    }

    // `any` / first-N joins must actually reach their quota; with every
    // branch exhausted the node fails with the first branch error.
    if successes < needed && !matches!(payload.wait_strategy, WaitStrategy::All) {
        return Err(first_error.unwrap_or_else(|| {
            OrchError::internal("parallel node finished without enough successful branches")
        }));
    }

    Ok(())
}

/// Set-union of variables; last writer wins for scalars written by multiple
/// branches. Artifacts and telemetry are appended.
fn merge_branch_state(parent: &mut RunState, branch: RunState) {
    for (key, value) in branch.vars {
        parent.vars.insert(key, value);
    }
    parent.artifacts.extend(branch.artifacts);
    for (key, value) in branch.telemetry {
        parent.telemetry.insert(key, value);
    }
}

fn record_branch_error(state: &mut RunState, branch_id: &str, err: &OrchError) {
    let errors = state
        .telemetry
        .entry("branch_errors".to_string())
        .or_insert_with(|| Value::Object(Default::default()));
    if let Value::Object(map) = errors {
        map.insert(
            branch_id.to_string(),
            json!({"error_kind": err.kind.as_str(), "message": err.message}),
        );
    }
}
