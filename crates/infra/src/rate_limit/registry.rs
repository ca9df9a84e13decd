use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info};

use crate::config::{RateLimitConfig, ResilienceConfig};

use super::limiter::{RateLimiter, RateLimiterStats};

/// Rate limiter lookup error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("unknown API: {api} (available: {})", available.join(", "))]
    UnknownApi { api: String, available: Vec<String> },
}

/// Owns one [`RateLimiter`] per configured API name.
///
/// Limiters are created lazily on first use. The registry mutex only guards the
/// name → limiter map; each limiter has its own bucket lock, so APIs never
/// contend with each other.
#[derive(Debug)]
pub struct RateLimiterRegistry {
    limits: BTreeMap<String, RateLimitConfig>,
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
}

impl RateLimiterRegistry {
    pub fn new(limits: impl IntoIterator<Item = (String, RateLimitConfig)>) -> Self {
        Self {
            limits: limits.into_iter().collect(),
            limiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self::new(config.rate_limits.clone())
    }

    /// Configured API names, sorted.
    pub fn apis(&self) -> Vec<&str> {
        self.limits.keys().map(String::as_str).collect()
    }

    /// Get (or create) the limiter for `api`.
    pub fn limiter(&self, api: &str) -> Result<Arc<RateLimiter>, RateLimitError> {
        let limit = self.limits.get(api).ok_or_else(|| RateLimitError::UnknownApi {
            api: api.to_string(),
            available: self.limits.keys().cloned().collect(),
        })?;

        let mut limiters = self.limiters.lock().unwrap_or_else(PoisonError::into_inner);
        let limiter = limiters.entry(api.to_string()).or_insert_with(|| {
            info!(
                api,
                requests_per_minute = limit.requests_per_minute,
                "rate limiter created"
            );
            Arc::new(RateLimiter::new(api, limit.requests_per_minute))
        });
        Ok(Arc::clone(limiter))
    }

    /// Wait for a token for `api`. Returns how long the caller waited.
    pub async fn acquire(&self, api: &str) -> Result<Duration, RateLimitError> {
        let limiter = self.limiter(api)?;
        Ok(limiter.acquire().await)
    }

    /// Wait for a token for `api`, then run `operation`.
    pub async fn call<F, T>(&self, api: &str, operation: F) -> Result<T, RateLimitError>
    where
        F: Future<Output = T>,
    {
        let waited = self.acquire(api).await?;
        if !waited.is_zero() {
            debug!(api, waited_ms = waited.as_millis() as u64, "rate limiter wait");
        }
        Ok(operation.await)
    }

    /// Stats for every limiter created so far.
    pub fn all_stats(&self) -> BTreeMap<String, RateLimiterStats> {
        let limiters: Vec<Arc<RateLimiter>> = self
            .limiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        limiters
            .into_iter()
            .map(|l| (l.api().to_string(), l.stats()))
            .collect()
    }
}
