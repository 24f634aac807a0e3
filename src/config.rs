use std::time::Duration;

/// Business rules and timing knobs for the offer pipeline. Everything is
/// env-overridable with the defaults the shop runs in production.
#[derive(Debug, Clone)]
pub struct BusinessRules {
    /// Offers above this are always escalated for human review.
    pub high_value_threshold: f64,
    /// Aggregate payout ceiling per calendar day, across all offers.
    pub daily_spend_limit: f64,
    pub offer_expiry_hours: i64,
    /// Vision confidence below this escalates instead of advancing.
    pub min_vision_confidence: f32,
    /// Fewer comparable listings than this escalates instead of pricing.
    pub min_comparables: u32,
    /// Fraud `review` verdicts at or above this risk get a soft flag.
    pub fraud_soft_flag_risk: f32,
    /// Stage ledger TTL. Transient processing data only.
    pub stage_ttl_secs: u64,
    pub spend_ttl_secs: u64,
    /// Read-model TTL for the plain offer view.
    pub offer_view_ttl_secs: u64,
    pub stream_poll_interval: Duration,
    /// Absolute cap on a stream connection, regardless of progress.
    pub stream_max_lifetime: Duration,
    /// Pause between the enriched final frame and `{complete:true}`.
    pub final_frame_delay: Duration,
    pub push_connect_timeout: Duration,
    pub fallback_poll_interval: Duration,
}

impl BusinessRules {
    pub fn from_env() -> Self {
        let max_offer = env_f64("MAX_OFFER_AMOUNT", 2000.0);
        Self {
            high_value_threshold: env_f64("HIGH_VALUE_THRESHOLD", 500.0),
            daily_spend_limit: env_f64("MAX_DAILY_SPEND", max_offer * 10.0),
            offer_expiry_hours: env_u64("OFFER_EXPIRY_HOURS", 24) as i64,
            min_vision_confidence: env_f64("MIN_VISION_CONFIDENCE", 50.0) as f32,
            min_comparables: env_u64("MIN_COMPARABLES", 3) as u32,
            fraud_soft_flag_risk: env_f64("FRAUD_SOFT_FLAG_RISK", 60.0) as f32,
            stage_ttl_secs: env_u64("STAGE_CACHE_TTL_SECS", 600),
            spend_ttl_secs: env_u64("SPEND_COUNTER_TTL_SECS", 86_400),
            offer_view_ttl_secs: env_u64("OFFER_VIEW_TTL_SECS", 120),
            stream_poll_interval: Duration::from_millis(env_u64("STREAM_POLL_INTERVAL_MS", 2_000)),
            stream_max_lifetime: Duration::from_millis(env_u64("STREAM_TIMEOUT_MS", 300_000)),
            final_frame_delay: Duration::from_millis(env_u64("FINAL_FRAME_DELAY_MS", 500)),
            push_connect_timeout: Duration::from_millis(env_u64("PUSH_CONNECT_TIMEOUT_MS", 5_000)),
            fallback_poll_interval: Duration::from_millis(env_u64(
                "FALLBACK_POLL_INTERVAL_MS",
                3_000,
            )),
        }
    }

    /// Defaults without touching the environment. Used by tests.
    pub fn demo() -> Self {
        Self {
            high_value_threshold: 500.0,
            daily_spend_limit: 20_000.0,
            offer_expiry_hours: 24,
            min_vision_confidence: 50.0,
            min_comparables: 3,
            fraud_soft_flag_risk: 60.0,
            stage_ttl_secs: 600,
            spend_ttl_secs: 86_400,
            offer_view_ttl_secs: 120,
            stream_poll_interval: Duration::from_secs(2),
            stream_max_lifetime: Duration::from_secs(300),
            final_frame_delay: Duration::from_millis(500),
            push_connect_timeout: Duration::from_secs(5),
            fallback_poll_interval: Duration::from_secs(3),
        }
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| *v > 0.0)
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
