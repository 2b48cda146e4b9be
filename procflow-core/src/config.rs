use std::time::Duration;

/// Orchestrator settings, loaded from environment variables with defaults
/// suitable for single-process development.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Concurrent execution tasks per worker process.
    pub worker_concurrency: usize,
    /// Idle sleep between queue polls.
    pub poll_interval: Duration,
    /// Default `max_attempts` for new jobs.
    pub max_attempts: i32,
    /// Job lock duration; `locked_until = now + lock_duration` on claim and
    /// on every heartbeat renewal.
    pub lock_duration: Duration,
    /// Interval between heartbeat ticks.
    pub heartbeat_interval: Duration,
    /// Resource lease TTL. The heartbeat deliberately does NOT extend leases:
    /// a crashed worker frees its resources when they expire.
    pub lease_ttl: Duration,
    /// How long a sequence step waits for a busy resource before giving up
    /// with a `lease-timeout` error.
    pub lease_acquire_budget: Duration,
    /// Default rate-limit acquisition deadline when a node declares no SLA.
    pub rate_limit_timeout: Duration,
    /// Default HTTP timeout for agent dispatch (per-step `timeout_ms` wins).
    pub agent_timeout: Duration,
    /// Reject agent responses that are not a valid envelope. Disable to
    /// accept bare result objects from legacy agents.
    pub agent_strict_envelope: bool,
    /// Optional tool-server fallback used when no agent matches.
    pub tool_base_url: Option<String>,
    /// Consecutive dispatch failures that open an agent's circuit.
    pub circuit_failure_threshold: i32,
    /// How long an open circuit excludes an agent from resolution.
    pub circuit_reset: Duration,
    /// Terminal runs older than this are pruned by the retention loop.
    pub retention: Duration,
    /// Workers with a heartbeat older than this are pruned.
    pub worker_stale_after: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            worker_concurrency: 4,
            poll_interval: Duration::from_millis(500),
            max_attempts: 3,
            lock_duration: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(15),
            lease_ttl: Duration::from_secs(300),
            lease_acquire_budget: Duration::from_secs(60),
            rate_limit_timeout: Duration::from_secs(5),
            agent_timeout: Duration::from_secs(120),
            agent_strict_envelope: true,
            tool_base_url: None,
            circuit_failure_threshold: 3,
            circuit_reset: Duration::from_secs(300),
            retention: Duration::from_secs(30 * 24 * 3600),
            worker_stale_after: Duration::from_secs(300),
        }
    }
}

impl Settings {
    /// Read settings from the environment, falling back to defaults for
    /// anything unset or unparsable.
    pub fn from_env() -> Self {
        let d = Settings::default();
        Self {
            worker_concurrency: env_parse("WORKER_CONCURRENCY", d.worker_concurrency),
            poll_interval: Duration::from_millis(env_parse(
                "WORKER_POLL_INTERVAL_MS",
                d.poll_interval.as_millis() as u64,
            )),
            max_attempts: env_parse("WORKER_MAX_ATTEMPTS", d.max_attempts),
            lock_duration: Duration::from_secs(env_parse(
                "WORKER_LOCK_SECONDS",
                d.lock_duration.as_secs(),
            )),
            heartbeat_interval: Duration::from_secs(env_parse(
                "HEARTBEAT_INTERVAL_SECONDS",
                d.heartbeat_interval.as_secs(),
            )),
            lease_ttl: Duration::from_secs(env_parse("LEASE_TTL_SECONDS", d.lease_ttl.as_secs())),
            lease_acquire_budget: Duration::from_millis(env_parse(
                "LEASE_ACQUIRE_BUDGET_MS",
                d.lease_acquire_budget.as_millis() as u64,
            )),
            rate_limit_timeout: Duration::from_millis(env_parse(
                "RATE_LIMIT_TIMEOUT_MS",
                d.rate_limit_timeout.as_millis() as u64,
            )),
            agent_timeout: Duration::from_secs(env_parse(
                "AGENT_TIMEOUT_SECONDS",
                d.agent_timeout.as_secs(),
            )),
            agent_strict_envelope: env_parse("AGENT_STRICT_ENVELOPE", d.agent_strict_envelope),
            tool_base_url: std::env::var("TOOL_BASE_URL").ok().filter(|s| !s.is_empty()),
            circuit_failure_threshold: env_parse(
                "CIRCUIT_FAILURE_THRESHOLD",
                d.circuit_failure_threshold,
            ),
            circuit_reset: Duration::from_secs(env_parse(
                "CIRCUIT_RESET_SECONDS",
                d.circuit_reset.as_secs(),
            )),
            retention: Duration::from_secs(
                env_parse("RETENTION_DAYS", 30u64).saturating_mul(24 * 3600),
            ),
            worker_stale_after: d.worker_stale_after,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.circuit_failure_threshold, 3);
        assert_eq!(s.circuit_reset, Duration::from_secs(300));
        assert!(s.agent_strict_envelope);
    }

    #[test]
    fn env_overrides_parse() {
        std::env::set_var("WORKER_CONCURRENCY", "9");
        std::env::set_var("AGENT_STRICT_ENVELOPE", "false");
        let s = Settings::from_env();
        assert_eq!(s.worker_concurrency, 9);
        assert!(!s.agent_strict_envelope);
        std::env::remove_var("WORKER_CONCURRENCY");
        std::env::remove_var("AGENT_STRICT_ENVELOPE");
    }
}
