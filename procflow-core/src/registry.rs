//! Agent registry helpers: selection of a live agent for a (channel,
//! action) pair, and registration upserts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use rand::seq::SliceRandom;
use tracing::debug;

use crate::store::OrchStore;
use crate::types::{AgentInstance, AgentStatus};

/// Register or update an agent instance. The resource key defaults to
/// `{channel}_default` so a channel's agents share one lease pool unless
/// the caller says otherwise.
pub async fn register_agent(
    store: &Arc<dyn OrchStore>,
    agent_id: &str,
    name: &str,
    channel: &str,
    base_url: &str,
    capabilities: &[String],
    resource_key: Option<&str>,
    concurrency_limit: i32,
) -> Result<AgentInstance> {
    let channel = channel.to_lowercase();
    let agent = AgentInstance {
        agent_id: agent_id.to_string(),
        name: name.to_string(),
        resource_key: resource_key
            .map(str::to_string)
            .unwrap_or_else(|| format!("{channel}_default")),
        channel,
        base_url: base_url.trim_end_matches('/').to_string(),
        status: AgentStatus::Online,
        capabilities: capabilities.join(","),
        concurrency_limit,
        consecutive_failures: 0,
        circuit_open_at: None,
        pool_id: None,
    };
    store.upsert_agent(&agent).await?;
    Ok(agent)
}

/// Find one online agent whose channel matches and whose capabilities cover
/// the action, skipping agents with a currently-open circuit.
///
/// Candidates are shuffled before the first-match pick so that many
/// equally-capable agents share load.
pub async fn find_capable_agent(
    store: &Arc<dyn OrchStore>,
    channel: &str,
    action: &str,
    circuit_reset: Duration,
) -> Result<Option<AgentInstance>> {
    let mut agents = store.list_agents(Some(channel)).await?;
    agents.shuffle(&mut rand::thread_rng());

    let now = Utc::now();
    for agent in agents {
        if agent.status != AgentStatus::Online {
            continue;
        }
        if let Some(opened_at) = agent.circuit_open_at {
            let elapsed = (now - opened_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            // Opens past the reset window are stale and ignored.
            if elapsed < circuit_reset {
                debug!(
                    agent_id = %agent.agent_id,
                    elapsed_secs = elapsed.as_secs(),
                    "skipping circuit-open agent"
                );
                continue;
            }
        }
        if agent.can_handle(action) {
            return Ok(Some(agent));
        }
    }
    Ok(None)
}
