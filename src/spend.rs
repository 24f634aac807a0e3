use crate::cache::{Cache, CacheError, CounterOutcome};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

/// Bounds aggregate committed offer value per calendar day across all
/// concurrently-processing pipelines. The only cross-offer coordination
/// point: one atomic check-and-increment, never a separate read then write.
pub struct SpendGuard {
    cache: Arc<dyn Cache>,
    ceiling: f64,
    ttl_secs: u64,
}

impl SpendGuard {
    pub fn new(cache: Arc<dyn Cache>, ceiling: f64, ttl_secs: u64) -> Self {
        Self {
            cache,
            ceiling,
            ttl_secs,
        }
    }

    /// Commits `amount` against today's counter if the total stays within
    /// the ceiling. On `allowed: false` nothing was added.
    pub async fn try_commit(&self, amount: f64) -> Result<CounterOutcome, CacheError> {
        let key = Self::today_key();
        let outcome = self
            .cache
            .incr_if_under(&key, amount, self.ceiling, self.ttl_secs)
            .await?;
        info!(
            target = "pawnshop.spend",
            key,
            amount,
            allowed = outcome.allowed,
            total = outcome.new_total,
            "daily spend check"
        );
        Ok(outcome)
    }

    fn today_key() -> String {
        format!("spending:daily:{}", Utc::now().format("%Y-%m-%d"))
    }
}
