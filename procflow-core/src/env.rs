use std::sync::Arc;

use crate::cancel::CancellationRegistry;
use crate::config::Settings;
use crate::rate_limit::RateLimiter;
use crate::store::OrchStore;

/// Process-wide execution environment: the store, settings, and the
/// in-memory singletons (token buckets, cancellation registry, HTTP client).
///
/// Constructed once per worker process and passed by `Arc` everywhere;
/// tests build their own instance so global state never leaks between them.
pub struct RunnerEnv {
    pub store: Arc<dyn OrchStore>,
    pub settings: Settings,
    pub rate_limiter: RateLimiter,
    pub cancellations: CancellationRegistry,
    pub http: reqwest::Client,
}

impl RunnerEnv {
    pub fn new(store: Arc<dyn OrchStore>, settings: Settings) -> Arc<Self> {
        Arc::new(Self {
            store,
            settings,
            rate_limiter: RateLimiter::new(),
            cancellations: CancellationRegistry::new(),
            http: reqwest::Client::new(),
        })
    }
}
