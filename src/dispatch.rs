use crate::models::MarketStats;
use crate::orchestrator::OfferOrchestrator;
use crate::workers::{StageWorkers, VoiceBrief};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("queue send failed: worker not available")]
    QueueClosed,
}

/// Retry policy forwarded to the job system. The dispatcher owns the
/// retry/backoff engine; we only carry the options.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct JobOptions {
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 2,
            backoff_ms: 3_000,
        }
    }
}

/// One unit of stage work. The job id is a pure function of
/// `(offer, stage)`, so duplicate enqueues collapse instead of forking the
/// pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "kebab-case")]
pub enum JobPayload {
    VisionIdentify {
        offer_id: Uuid,
        photo_urls: Vec<String>,
        user_description: Option<String>,
    },
    MarketplaceResearch {
        offer_id: Uuid,
        brand: String,
        model: String,
        category: String,
        condition: String,
    },
    PricingCalculate {
        offer_id: Uuid,
        stats: MarketStats,
        category: String,
        condition: String,
    },
    JakeVoice { brief: VoiceBrief },
}

impl JobPayload {
    pub fn offer_id(&self) -> Uuid {
        match self {
            JobPayload::VisionIdentify { offer_id, .. }
            | JobPayload::MarketplaceResearch { offer_id, .. }
            | JobPayload::PricingCalculate { offer_id, .. } => *offer_id,
            JobPayload::JakeVoice { brief } => brief.offer_id,
        }
    }

    pub fn stage_name(&self) -> &'static str {
        match self {
            JobPayload::VisionIdentify { .. } => "vision",
            JobPayload::MarketplaceResearch { .. } => "marketplace",
            JobPayload::PricingCalculate { .. } => "pricing",
            JobPayload::JakeVoice { .. } => "jake",
        }
    }

    /// Deterministic idempotency key, e.g. `vision-<offer id>`.
    pub fn job_id(&self) -> String {
        format!("{}-{}", self.stage_name(), self.offer_id())
    }
}

#[async_trait]
pub trait JobDispatcher: Send + Sync {
    /// Returns `false` when the job id was already enqueued and the call
    /// was deduplicated.
    async fn enqueue(&self, payload: JobPayload, options: JobOptions) -> Result<bool, DispatchError>;
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub payload: JobPayload,
    pub options: JobOptions,
}

/// In-process stand-in for the external job system: an mpsc queue plus the
/// job-id dedup the external dispatcher guarantees.
#[derive(Clone)]
pub struct InProcessQueue {
    tx: mpsc::Sender<Job>,
    seen: Arc<Mutex<HashSet<String>>>,
}

impl InProcessQueue {
    pub fn new() -> (Self, mpsc::Receiver<Job>) {
        let (tx, rx) = mpsc::channel(queue_capacity_from_env());
        (
            Self {
                tx,
                seen: Arc::new(Mutex::new(HashSet::new())),
            },
            rx,
        )
    }
}

#[async_trait]
impl JobDispatcher for InProcessQueue {
    async fn enqueue(&self, payload: JobPayload, options: JobOptions) -> Result<bool, DispatchError> {
        let id = payload.job_id();
        {
            let mut seen = self.seen.lock().await;
            if !seen.insert(id.clone()) {
                debug!(target = "pawnshop.jobs", job_id = %id, "duplicate enqueue dropped");
                return Ok(false);
            }
        }
        self.tx
            .send(Job {
                id,
                payload,
                options,
            })
            .await
            .map_err(|_| DispatchError::QueueClosed)?;
        Ok(true)
    }
}

/// Background worker: runs each stage's collaborator and feeds the result
/// back into the orchestrator. A worker error is final here (the external
/// system owns retries) and is routed through `fail`.
pub fn spawn_worker(
    mut rx: mpsc::Receiver<Job>,
    workers: Arc<dyn StageWorkers>,
    orchestrator: Arc<OfferOrchestrator>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            info!(
                target = "pawnshop.jobs",
                job_id = %job.id,
                attempts = job.options.attempts,
                backoff_ms = job.options.backoff_ms,
                "job started"
            );
            let offer_id = job.payload.offer_id();
            match job.payload {
                JobPayload::VisionIdentify {
                    photo_urls,
                    user_description,
                    ..
                } => {
                    match workers
                        .identify(offer_id, &photo_urls, user_description.as_deref())
                        .await
                    {
                        Ok(result) => orchestrator.on_vision_complete(offer_id, result).await,
                        Err(err) => {
                            warn!(target = "pawnshop.jobs", job_id = %job.id, error = %err, "vision job failed");
                            orchestrator
                                .fail(offer_id, format!("Vision failed: {err}"))
                                .await;
                        }
                    }
                }
                JobPayload::MarketplaceResearch {
                    brand,
                    model,
                    category,
                    condition,
                    ..
                } => {
                    match workers
                        .research(offer_id, &brand, &model, &category, &condition)
                        .await
                    {
                        Ok(result) => orchestrator.on_marketplace_complete(offer_id, result).await,
                        Err(err) => {
                            warn!(target = "pawnshop.jobs", job_id = %job.id, error = %err, "marketplace job failed");
                            orchestrator
                                .fail(offer_id, format!("Marketplace research failed: {err}"))
                                .await;
                        }
                    }
                }
                JobPayload::PricingCalculate {
                    stats,
                    category,
                    condition,
                    ..
                } => match workers.price(offer_id, &stats, &category, &condition).await {
                    Ok(result) => orchestrator.on_pricing_complete(offer_id, result).await,
                    Err(err) => {
                        warn!(target = "pawnshop.jobs", job_id = %job.id, error = %err, "pricing job failed");
                        orchestrator
                            .fail(offer_id, format!("Pricing failed: {err}"))
                            .await;
                    }
                },
                JobPayload::JakeVoice { brief } => match workers.compose_voice(&brief).await {
                    Ok(result) => orchestrator.on_jake_voice_complete(offer_id, result).await,
                    Err(err) => {
                        warn!(target = "pawnshop.jobs", job_id = %job.id, error = %err, "voice job failed");
                        orchestrator
                            .fail(offer_id, format!("Voice generation failed: {err}"))
                            .await;
                    }
                },
            }
        }
    })
}

fn queue_capacity_from_env() -> usize {
    std::env::var("QUEUE_CAPACITY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vision_payload(offer_id: Uuid) -> JobPayload {
        JobPayload::VisionIdentify {
            offer_id,
            photo_urls: vec!["https://cdn.example/a.jpg".into()],
            user_description: None,
        }
    }

    #[test]
    fn job_id_is_pure_function_of_offer_and_stage() {
        let id = Uuid::new_v4();
        let a = vision_payload(id).job_id();
        let b = vision_payload(id).job_id();
        assert_eq!(a, b);
        assert!(a.starts_with("vision-"));
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_dropped() {
        let (queue, mut rx) = InProcessQueue::new();
        let id = Uuid::new_v4();
        let first = queue
            .enqueue(vision_payload(id), JobOptions::default())
            .await
            .unwrap();
        let second = queue
            .enqueue(vision_payload(id), JobOptions::default())
            .await
            .unwrap();
        assert!(first);
        assert!(!second);

        // Only one job reaches the worker
        let job = rx.recv().await.unwrap();
        assert_eq!(job.id, format!("vision-{id}"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn distinct_stages_share_no_keys() {
        let (queue, _rx) = InProcessQueue::new();
        let id = Uuid::new_v4();
        assert!(queue
            .enqueue(vision_payload(id), JobOptions::default())
            .await
            .unwrap());
        let pricing = JobPayload::PricingCalculate {
            offer_id: id,
            stats: MarketStats {
                count: 5,
                median: 100.0,
                mean: 100.0,
                std_dev: 10.0,
            },
            category: "Watches".into(),
            condition: "good".into(),
        };
        assert!(queue.enqueue(pricing, JobOptions::default()).await.unwrap());
    }
}
