use crate::cache::{Cache, CacheError};
use crate::config::BusinessRules;
use crate::dispatch::{DispatchError, JobDispatcher, JobOptions, JobPayload};
use crate::models::{
    EscalationEntry, FraudAction, MarketResult, Offer, OfferStatus, OfferView, PricingResult,
    SubmitOfferRequest, VisionResult, VoiceResult,
};
use crate::notify::{self, Notification, Notifier};
use crate::spend::SpendGuard;
use crate::stage::{PipelineStage, StageRecord};
use crate::store::{OfferPatch, OfferStore, StoreError};
use crate::workers::{FraudCheckRequest, FraudScorer, VoiceBrief, jake_scenario};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OfferError {
    #[error("invalid offer id")]
    InvalidId,
    #[error("offer {0} not found")]
    NotFound(Uuid),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("spend check failed: {0}")]
    Spend(#[from] CacheError),
}

/// Drives one offer through vision, marketplace, pricing, fraud and voice.
/// Each stage runs in a background job; this service owns the transitions
/// between them, the guard checks, and the two absorbing exits (escalated,
/// failed).
pub struct OfferOrchestrator {
    store: Arc<dyn OfferStore>,
    cache: Arc<dyn Cache>,
    queue: Arc<dyn JobDispatcher>,
    fraud: Arc<dyn FraudScorer>,
    notifier: Arc<dyn Notifier>,
    spend: SpendGuard,
    rules: BusinessRules,
}

impl OfferOrchestrator {
    pub fn new(
        store: Arc<dyn OfferStore>,
        cache: Arc<dyn Cache>,
        queue: Arc<dyn JobDispatcher>,
        fraud: Arc<dyn FraudScorer>,
        notifier: Arc<dyn Notifier>,
        rules: BusinessRules,
    ) -> Self {
        let spend = SpendGuard::new(
            cache.clone(),
            rules.daily_spend_limit,
            rules.spend_ttl_secs,
        );
        Self {
            store,
            cache,
            queue,
            fraud,
            notifier,
            spend,
            rules,
        }
    }

    /// Accepts a submission, records it, and kicks off the vision stage.
    pub async fn create_offer(&self, request: SubmitOfferRequest) -> Result<Uuid, OfferError> {
        if request.photo_urls.is_empty() {
            return Err(OfferError::InvalidInput("at least one photo required".into()));
        }
        let offer = Offer::new(
            request.user_id,
            request.photo_urls.clone(),
            request.user_description.clone(),
            self.rules.offer_expiry_hours,
        );
        let id = offer.id;
        self.store.insert(offer).await?;
        self.set_stage(id, PipelineStage::Uploaded).await;

        self.queue
            .enqueue(
                JobPayload::VisionIdentify {
                    offer_id: id,
                    photo_urls: request.photo_urls,
                    user_description: request.user_description,
                },
                JobOptions::default(),
            )
            .await?;
        self.set_stage(id, PipelineStage::Vision).await;
        info!(target = "pawnshop.pipeline", offer_id = %id, "offer created, vision queued");
        Ok(id)
    }

    // ---- Stage completion callbacks ----
    //
    // Each public callback wraps its step so that any error inside a
    // transition lands the offer in `failed` instead of leaving it wedged
    // mid-pipeline.

    pub async fn on_vision_complete(&self, id: Uuid, result: VisionResult) {
        if let Err(err) = self.vision_step(id, result).await {
            self.fail(id, format!("vision transition failed: {err}")).await;
        }
    }

    pub async fn on_marketplace_complete(&self, id: Uuid, result: MarketResult) {
        if let Err(err) = self.marketplace_step(id, result).await {
            self.fail(id, format!("marketplace transition failed: {err}"))
                .await;
        }
    }

    pub async fn on_pricing_complete(&self, id: Uuid, result: PricingResult) {
        if let Err(err) = self.pricing_step(id, result).await {
            self.fail(id, format!("pricing transition failed: {err}")).await;
        }
    }

    pub async fn on_jake_voice_complete(&self, id: Uuid, result: VoiceResult) {
        if let Err(err) = self.voice_step(id, result).await {
            self.fail(id, format!("voice transition failed: {err}")).await;
        }
    }

    async fn vision_step(&self, id: Uuid, result: VisionResult) -> Result<(), OfferError> {
        let started = Instant::now();
        let confidence = result.confidence;
        let brand = result.brand.clone();
        let model = result.model.clone();
        let category = result.category.clone();
        let condition = result.condition.clone();
        self.store
            .patch(
                id,
                OfferPatch {
                    identification: Some(result),
                    ..OfferPatch::default()
                },
            )
            .await?;

        if confidence < self.rules.min_vision_confidence {
            self.escalate(
                id,
                "low_confidence",
                format!("vision confidence {confidence:.1} below threshold"),
            )
            .await;
            return Ok(());
        }

        self.set_stage(id, PipelineStage::Marketplace).await;
        self.queue
            .enqueue(
                JobPayload::MarketplaceResearch {
                    offer_id: id,
                    brand,
                    model,
                    category,
                    condition,
                },
                JobOptions::default(),
            )
            .await?;
        crate::metrics::stage_elapsed("vision", started.elapsed().as_millis());
        Ok(())
    }

    async fn marketplace_step(&self, id: Uuid, result: MarketResult) -> Result<(), OfferError> {
        let started = Instant::now();
        let stats = result.stats.clone();
        self.store
            .patch(
                id,
                OfferPatch {
                    market: Some(result),
                    ..OfferPatch::default()
                },
            )
            .await?;

        if stats.count < self.rules.min_comparables {
            self.escalate(
                id,
                "few_comparables",
                format!("only {} comparable listings found", stats.count),
            )
            .await;
            return Ok(());
        }

        let offer = self.require_offer(id).await?;
        self.set_stage(id, PipelineStage::Pricing).await;
        self.queue
            .enqueue(
                JobPayload::PricingCalculate {
                    offer_id: id,
                    stats,
                    category: offer.item_category.unwrap_or_default(),
                    condition: offer.item_condition.unwrap_or_default(),
                },
                JobOptions::default(),
            )
            .await?;
        crate::metrics::stage_elapsed("marketplace", started.elapsed().as_millis());
        Ok(())
    }

    /// Pricing completion is the gate stage: high-value check, the daily
    /// spend commit, and the fraud verdict all happen here, in that order.
    /// The spend counter is only charged for offers that passed the
    /// high-value check, so escalated amounts never consume budget.
    async fn pricing_step(&self, id: Uuid, result: PricingResult) -> Result<(), OfferError> {
        let started = Instant::now();
        let amount = result.offer_amount;
        let fmv = result.fmv;
        let ratio = result.offer_to_market_ratio;
        self.store
            .patch(
                id,
                OfferPatch {
                    pricing: Some(result),
                    estimated_profit: Some(fmv - amount),
                    ..OfferPatch::default()
                },
            )
            .await?;

        if amount > self.rules.high_value_threshold {
            self.escalate(
                id,
                "high_value",
                format!(
                    "offer ${amount:.2} exceeds ${:.2} auto-approval cap",
                    self.rules.high_value_threshold
                ),
            )
            .await;
            return Ok(());
        }

        let outcome = self.spend.try_commit(amount).await?;
        if !outcome.allowed {
            self.escalate(
                id,
                "daily_limit",
                format!(
                    "daily spend ${:.2} cannot absorb ${amount:.2}",
                    outcome.new_total
                ),
            )
            .await;
            return Ok(());
        }

        let offer = self.require_offer(id).await?;
        self.set_stage(id, PipelineStage::FraudCheck).await;
        if !self.fraud_gate(&offer, amount, fmv).await {
            return Ok(());
        }

        self.set_stage(id, PipelineStage::JakeVoice).await;
        let item_name = match (&offer.item_brand, &offer.item_model) {
            (Some(brand), Some(model)) => format!("{brand} {model}"),
            (Some(brand), None) => brand.clone(),
            _ => offer.item_category.clone().unwrap_or_else(|| "this item".into()),
        };
        self.queue
            .enqueue(
                JobPayload::JakeVoice {
                    brief: VoiceBrief {
                        offer_id: id,
                        scenario: jake_scenario(ratio).to_string(),
                        item_name,
                        offer_amount: amount,
                        fmv,
                        brand: offer.item_brand,
                        category: offer.item_category,
                        condition: offer.item_condition,
                    },
                },
                JobOptions::default(),
            )
            .await?;
        crate::metrics::stage_elapsed("pricing", started.elapsed().as_millis());
        Ok(())
    }

    /// Returns `true` when the pipeline may continue. A scorer outage is a
    /// degraded pass, never a block: the soft flag exists for follow-up
    /// review, the hard verdicts go through the escalation path.
    async fn fraud_gate(&self, offer: &Offer, amount: f64, fmv: f64) -> bool {
        let report = match self
            .fraud
            .analyze(&FraudCheckRequest {
                offer_id: offer.id,
                user_id: offer.user_id,
                offer_amount: amount,
                fmv,
                category: offer.item_category.clone(),
                condition: offer.item_condition.clone(),
            })
            .await
        {
            Ok(report) => report,
            Err(err) => {
                warn!(
                    target = "pawnshop.pipeline",
                    offer_id = %offer.id,
                    error = %err,
                    "fraud scorer unavailable, continuing unscored"
                );
                return true;
            }
        };

        let score_patch = OfferPatch {
            fraud_risk_score: Some(report.risk_score),
            ..OfferPatch::default()
        };
        match report.recommended_action {
            FraudAction::Reject => {
                let _ = self.store.patch(offer.id, score_patch).await;
                self.escalate(
                    offer.id,
                    "fraud_rejected",
                    format!("fraud verdict reject, risk {:.0}", report.risk_score),
                )
                .await;
                false
            }
            FraudAction::Escalate => {
                let _ = self.store.patch(offer.id, score_patch).await;
                self.escalate(
                    offer.id,
                    "fraud_high_risk",
                    format!("fraud verdict escalate, risk {:.0}", report.risk_score),
                )
                .await;
                false
            }
            FraudAction::Review => {
                let flagged = report.risk_score >= self.rules.fraud_soft_flag_risk;
                let _ = self
                    .store
                    .patch(
                        offer.id,
                        OfferPatch {
                            fraud_flagged: Some(flagged),
                            ..score_patch
                        },
                    )
                    .await;
                info!(
                    target = "pawnshop.pipeline",
                    offer_id = %offer.id,
                    risk = report.risk_score,
                    flagged,
                    "fraud review verdict, pipeline continues"
                );
                true
            }
            FraudAction::Approve => {
                let _ = self.store.patch(offer.id, score_patch).await;
                true
            }
        }
    }

    async fn voice_step(&self, id: Uuid, result: VoiceResult) -> Result<(), OfferError> {
        let started = Instant::now();
        self.store
            .patch(
                id,
                OfferPatch {
                    voice: Some(result),
                    status: Some(OfferStatus::Ready),
                    ..OfferPatch::default()
                },
            )
            .await?;
        self.set_stage(id, PipelineStage::Ready).await;
        // The cached read model predates the final fields
        self.cache.del(&view_key(id)).await;
        crate::metrics::stage_elapsed("jake-voice", started.elapsed().as_millis());
        info!(target = "pawnshop.pipeline", offer_id = %id, "offer ready");
        Ok(())
    }

    // ---- Absorbing exits ----

    /// Hands the offer to a human. Status stays `processing` so the review
    /// queue picks it up; the ledger jumps to `escalated` so live streams
    /// stop. Multiple causes on one offer accumulate in the log.
    pub async fn escalate(&self, id: Uuid, reason: &str, note: String) {
        if let Err(err) = self
            .store
            .append_escalation(id, EscalationEntry::now(note.clone()))
            .await
        {
            error!(target = "pawnshop.pipeline", offer_id = %id, error = %err, "escalation log append failed");
        }
        if let Err(err) = self
            .store
            .patch(
                id,
                OfferPatch {
                    escalated: Some(true),
                    escalation_reason: Some(reason.to_string()),
                    ..OfferPatch::default()
                },
            )
            .await
        {
            error!(target = "pawnshop.pipeline", offer_id = %id, error = %err, "escalation patch failed");
        }
        self.set_stage(id, PipelineStage::Escalated).await;
        self.cache.del(&view_key(id)).await;
        crate::metrics::inc_escalations(reason);
        warn!(target = "pawnshop.pipeline", offer_id = %id, reason, "offer escalated");
        notify::dispatch(
            self.notifier.clone(),
            Notification::Escalation {
                offer_id: id,
                reason: reason.to_string(),
                notes: note,
            },
        );
    }

    /// Unrecoverable pipeline error. Best-effort bookkeeping: every write
    /// here is allowed to fail without masking the original error.
    pub async fn fail(&self, id: Uuid, cause: String) {
        error!(target = "pawnshop.pipeline", offer_id = %id, cause, "pipeline failed");
        if let Err(err) = self
            .store
            .append_escalation(id, EscalationEntry::now(cause.clone()))
            .await
        {
            error!(target = "pawnshop.pipeline", offer_id = %id, error = %err, "failure log append failed");
        }
        if let Err(err) = self
            .store
            .patch(
                id,
                OfferPatch {
                    escalated: Some(true),
                    escalation_reason: Some("pipeline_error".to_string()),
                    ..OfferPatch::default()
                },
            )
            .await
        {
            error!(target = "pawnshop.pipeline", offer_id = %id, error = %err, "failure patch failed");
        }
        self.set_stage(id, PipelineStage::Failed).await;
        self.cache.del(&view_key(id)).await;
        notify::dispatch(
            self.notifier.clone(),
            Notification::PipelineFailure {
                offer_id: id,
                error: cause,
            },
        );
    }

    // ---- Stage ledger ----

    pub async fn set_stage(&self, id: Uuid, stage: PipelineStage) {
        let record = StageRecord::now(stage);
        if let Ok(value) = serde_json::to_value(&record) {
            self.cache
                .set_json(&stage_key(id), value, self.rules.stage_ttl_secs)
                .await;
        }
        info!(target = "pawnshop.pipeline", offer_id = %id, stage = stage.as_str(), "stage");
    }

    /// Ledger read. `None` means expired or never written, not an error.
    pub async fn get_stage(&self, id: Uuid) -> Option<PipelineStage> {
        let value = self.cache.get_json(&stage_key(id)).await?;
        serde_json::from_value::<StageRecord>(value)
            .ok()
            .map(|record| record.stage)
    }

    // ---- Reads ----

    pub async fn offer(&self, id: Uuid) -> Result<Offer, OfferError> {
        self.store
            .get(id)
            .await?
            .ok_or(OfferError::NotFound(id))
    }

    /// Read model for polling clients: cached snapshot plus a fresh ledger
    /// stage. Ready offers past their expiry read back as expired without a
    /// store write.
    pub async fn offer_view(&self, id: Uuid) -> Result<OfferView, OfferError> {
        let mut view = match self.cache.get_json(&view_key(id)).await {
            Some(value) => match serde_json::from_value::<OfferView>(value) {
                Ok(view) => view,
                Err(_) => self.build_view(id).await?,
            },
            None => self.build_view(id).await?,
        };
        view.processing_stage = self.get_stage(id).await;
        if view.status == OfferStatus::Ready && view.expires_at < Utc::now() {
            view.status = OfferStatus::Expired;
        }
        Ok(view)
    }

    async fn build_view(&self, id: Uuid) -> Result<OfferView, OfferError> {
        let offer = self.require_offer(id).await?;
        let view = OfferView::from_offer(&offer, None);
        if let Ok(value) = serde_json::to_value(&view) {
            self.cache
                .set_json(&view_key(id), value, self.rules.offer_view_ttl_secs)
                .await;
        }
        Ok(view)
    }

    async fn require_offer(&self, id: Uuid) -> Result<Offer, OfferError> {
        self.store
            .get(id)
            .await?
            .ok_or(OfferError::NotFound(id))
    }
}

fn stage_key(id: Uuid) -> String {
    format!("offer:{id}:stage")
}

fn view_key(id: Uuid) -> String {
    format!("offer:{id}:view")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::models::{FraudReport, MarketStats};
    use crate::store::MemoryStore;
    use crate::workers::WorkerError;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    struct RecordingDispatcher {
        jobs: Mutex<Vec<JobPayload>>,
    }

    impl RecordingDispatcher {
        fn new() -> Self {
            Self {
                jobs: Mutex::new(Vec::new()),
            }
        }

        async fn last(&self) -> Option<JobPayload> {
            self.jobs.lock().await.last().cloned()
        }

        async fn count(&self) -> usize {
            self.jobs.lock().await.len()
        }
    }

    #[async_trait]
    impl JobDispatcher for RecordingDispatcher {
        async fn enqueue(
            &self,
            payload: JobPayload,
            _options: JobOptions,
        ) -> Result<bool, DispatchError> {
            self.jobs.lock().await.push(payload);
            Ok(true)
        }
    }

    struct StaticFraud(FraudReport);

    #[async_trait]
    impl FraudScorer for StaticFraud {
        async fn analyze(&self, _request: &FraudCheckRequest) -> Result<FraudReport, WorkerError> {
            Ok(self.0.clone())
        }
    }

    struct FailingFraud;

    #[async_trait]
    impl FraudScorer for FailingFraud {
        async fn analyze(&self, _request: &FraudCheckRequest) -> Result<FraudReport, WorkerError> {
            Err(WorkerError::Unavailable("fraud", "connection refused".into()))
        }
    }

    fn approve_report() -> FraudReport {
        FraudReport {
            risk_score: 10.0,
            risk_level: "low".into(),
            confidence: 0.9,
            explanation: "clean".into(),
            recommended_action: FraudAction::Approve,
        }
    }

    struct Rig {
        store: Arc<MemoryStore>,
        cache: Arc<MemoryCache>,
        queue: Arc<RecordingDispatcher>,
        orchestrator: OfferOrchestrator,
    }

    fn rig_with(rules: BusinessRules, fraud: Arc<dyn FraudScorer>) -> Rig {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let queue = Arc::new(RecordingDispatcher::new());
        let orchestrator = OfferOrchestrator::new(
            store.clone(),
            cache.clone(),
            queue.clone(),
            fraud,
            Arc::new(crate::notify::LogNotifier),
            rules,
        );
        Rig {
            store,
            cache,
            queue,
            orchestrator,
        }
    }

    fn rig() -> Rig {
        rig_with(BusinessRules::demo(), Arc::new(StaticFraud(approve_report())))
    }

    fn vision_ok() -> VisionResult {
        VisionResult {
            category: "Watches".into(),
            subcategory: "Watches / dive".into(),
            brand: "Seiko".into(),
            model: "SKX007".into(),
            condition: "good".into(),
            features: vec![],
            damage: vec![],
            confidence: 82.0,
            identifiers: Default::default(),
            model_used: "demo-vision-1".into(),
        }
    }

    fn market_ok(count: u32) -> MarketResult {
        MarketResult {
            stats: MarketStats {
                count,
                median: 200.0,
                mean: 205.0,
                std_dev: 25.0,
            },
            sources_checked: vec!["ebay".into()],
            cache_hit: false,
        }
    }

    fn pricing_of(amount: f64) -> PricingResult {
        PricingResult {
            fmv: amount / 0.45,
            fmv_confidence: 0.8,
            offer_amount: amount,
            offer_to_market_ratio: 0.55,
            condition_multiplier: 0.85,
            category_margin: 0.45,
            data_quality: "high".into(),
        }
    }

    fn voice_ok() -> VoiceResult {
        VoiceResult {
            script: "Alright, cash in hand.".into(),
            tone: "folksy".into(),
            animation_state: "talking".into(),
            tier: 2,
            audio_url: None,
        }
    }

    async fn submit(rig: &Rig) -> Uuid {
        rig.orchestrator
            .create_offer(SubmitOfferRequest {
                photo_urls: vec!["https://cdn.example/a.jpg".into()],
                user_description: None,
                user_id: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn happy_path_runs_to_ready() {
        let rig = rig();
        let id = submit(&rig).await;
        assert_eq!(
            rig.orchestrator.get_stage(id).await,
            Some(PipelineStage::Vision)
        );
        assert!(matches!(
            rig.queue.last().await,
            Some(JobPayload::VisionIdentify { .. })
        ));

        rig.orchestrator.on_vision_complete(id, vision_ok()).await;
        assert_eq!(
            rig.orchestrator.get_stage(id).await,
            Some(PipelineStage::Marketplace)
        );
        assert!(matches!(
            rig.queue.last().await,
            Some(JobPayload::MarketplaceResearch { .. })
        ));

        rig.orchestrator.on_marketplace_complete(id, market_ok(6)).await;
        assert_eq!(
            rig.orchestrator.get_stage(id).await,
            Some(PipelineStage::Pricing)
        );

        rig.orchestrator.on_pricing_complete(id, pricing_of(120.0)).await;
        assert_eq!(
            rig.orchestrator.get_stage(id).await,
            Some(PipelineStage::JakeVoice)
        );
        assert!(matches!(
            rig.queue.last().await,
            Some(JobPayload::JakeVoice { .. })
        ));

        rig.orchestrator.on_jake_voice_complete(id, voice_ok()).await;
        assert_eq!(
            rig.orchestrator.get_stage(id).await,
            Some(PipelineStage::Ready)
        );
        let offer = rig.orchestrator.offer(id).await.unwrap();
        assert_eq!(offer.status, OfferStatus::Ready);
        assert!(offer.jake_script.is_some());
        assert_eq!(offer.estimated_profit, Some(offer.fmv.unwrap() - 120.0));
        assert!(!offer.escalated);
    }

    #[tokio::test]
    async fn low_confidence_escalates_and_stops() {
        let rig = rig();
        let id = submit(&rig).await;
        let jobs_before = rig.queue.count().await;

        let mut result = vision_ok();
        result.confidence = 31.0;
        rig.orchestrator.on_vision_complete(id, result).await;

        let offer = rig.orchestrator.offer(id).await.unwrap();
        assert_eq!(offer.status, OfferStatus::Processing);
        assert!(offer.escalated);
        assert_eq!(offer.escalation_reason.as_deref(), Some("low_confidence"));
        assert_eq!(offer.escalation_log.len(), 1);
        // Vision output is kept for the reviewer even on the escalation path
        assert_eq!(offer.item_brand.as_deref(), Some("Seiko"));
        assert_eq!(
            rig.orchestrator.get_stage(id).await,
            Some(PipelineStage::Escalated)
        );
        assert_eq!(rig.queue.count().await, jobs_before, "no further jobs queued");
    }

    #[tokio::test]
    async fn few_comparables_escalates() {
        let rig = rig();
        let id = submit(&rig).await;
        rig.orchestrator.on_vision_complete(id, vision_ok()).await;
        rig.orchestrator.on_marketplace_complete(id, market_ok(2)).await;

        let offer = rig.orchestrator.offer(id).await.unwrap();
        assert!(offer.escalated);
        assert_eq!(offer.escalation_reason.as_deref(), Some("few_comparables"));
        assert_eq!(
            rig.orchestrator.get_stage(id).await,
            Some(PipelineStage::Escalated)
        );
    }

    #[tokio::test]
    async fn high_value_escalates_without_charging_spend() {
        let rig = rig();
        let id = submit(&rig).await;
        rig.orchestrator.on_vision_complete(id, vision_ok()).await;
        rig.orchestrator.on_marketplace_complete(id, market_ok(6)).await;
        rig.orchestrator.on_pricing_complete(id, pricing_of(650.0)).await;

        let offer = rig.orchestrator.offer(id).await.unwrap();
        assert!(offer.escalated);
        assert_eq!(offer.escalation_reason.as_deref(), Some("high_value"));
        // Pricing fields still recorded for the reviewer
        assert_eq!(offer.offer_amount, 650.0);

        // The daily counter was never touched
        let key = format!("spending:daily:{}", Utc::now().format("%Y-%m-%d"));
        let counter = rig
            .cache
            .incr_if_under(&key, 0.0, 20_000.0, 60)
            .await
            .unwrap();
        assert_eq!(counter.new_total, 0.0);
    }

    #[tokio::test]
    async fn daily_limit_escalates_when_budget_exhausted() {
        let mut rules = BusinessRules::demo();
        rules.daily_spend_limit = 100.0;
        let rig = rig_with(rules, Arc::new(StaticFraud(approve_report())));
        let id = submit(&rig).await;
        rig.orchestrator.on_vision_complete(id, vision_ok()).await;
        rig.orchestrator.on_marketplace_complete(id, market_ok(6)).await;
        rig.orchestrator.on_pricing_complete(id, pricing_of(120.0)).await;

        let offer = rig.orchestrator.offer(id).await.unwrap();
        assert!(offer.escalated);
        assert_eq!(offer.escalation_reason.as_deref(), Some("daily_limit"));
    }

    #[tokio::test]
    async fn fraud_reject_escalates() {
        let report = FraudReport {
            risk_score: 92.0,
            risk_level: "critical".into(),
            confidence: 0.95,
            explanation: "stolen goods pattern".into(),
            recommended_action: FraudAction::Reject,
        };
        let rig = rig_with(BusinessRules::demo(), Arc::new(StaticFraud(report)));
        let id = submit(&rig).await;
        rig.orchestrator.on_vision_complete(id, vision_ok()).await;
        rig.orchestrator.on_marketplace_complete(id, market_ok(6)).await;
        rig.orchestrator.on_pricing_complete(id, pricing_of(120.0)).await;

        let offer = rig.orchestrator.offer(id).await.unwrap();
        assert!(offer.escalated);
        assert_eq!(offer.escalation_reason.as_deref(), Some("fraud_rejected"));
        assert_eq!(offer.fraud_risk_score, Some(92.0));
    }

    #[tokio::test]
    async fn fraud_review_soft_flags_and_continues() {
        let report = FraudReport {
            risk_score: 71.0,
            risk_level: "elevated".into(),
            confidence: 0.7,
            explanation: "velocity anomaly".into(),
            recommended_action: FraudAction::Review,
        };
        let rig = rig_with(BusinessRules::demo(), Arc::new(StaticFraud(report)));
        let id = submit(&rig).await;
        rig.orchestrator.on_vision_complete(id, vision_ok()).await;
        rig.orchestrator.on_marketplace_complete(id, market_ok(6)).await;
        rig.orchestrator.on_pricing_complete(id, pricing_of(120.0)).await;

        let offer = rig.orchestrator.offer(id).await.unwrap();
        assert!(!offer.escalated);
        assert!(offer.fraud_flagged);
        assert_eq!(
            rig.orchestrator.get_stage(id).await,
            Some(PipelineStage::JakeVoice)
        );
    }

    #[tokio::test]
    async fn fraud_outage_continues_unscored() {
        let rig = rig_with(BusinessRules::demo(), Arc::new(FailingFraud));
        let id = submit(&rig).await;
        rig.orchestrator.on_vision_complete(id, vision_ok()).await;
        rig.orchestrator.on_marketplace_complete(id, market_ok(6)).await;
        rig.orchestrator.on_pricing_complete(id, pricing_of(120.0)).await;

        let offer = rig.orchestrator.offer(id).await.unwrap();
        assert!(!offer.escalated);
        assert_eq!(offer.fraud_risk_score, None);
        assert_eq!(
            rig.orchestrator.get_stage(id).await,
            Some(PipelineStage::JakeVoice)
        );
    }

    #[tokio::test]
    async fn callback_for_unknown_offer_lands_in_failed() {
        let rig = rig();
        let ghost = Uuid::new_v4();
        rig.orchestrator.on_marketplace_complete(ghost, market_ok(6)).await;
        assert_eq!(
            rig.orchestrator.get_stage(ghost).await,
            Some(PipelineStage::Failed)
        );
    }

    #[tokio::test]
    async fn multiple_escalation_causes_accumulate() {
        let rig = rig();
        let id = submit(&rig).await;
        rig.orchestrator
            .escalate(id, "low_confidence", "confidence 40".into())
            .await;
        rig.orchestrator
            .escalate(id, "high_value", "amount 900".into())
            .await;

        let offer = rig.orchestrator.offer(id).await.unwrap();
        assert_eq!(offer.escalation_log.len(), 2);
        // Latest reason wins the summary field, log keeps the history
        assert_eq!(offer.escalation_reason.as_deref(), Some("high_value"));
    }

    #[tokio::test]
    async fn create_offer_rejects_empty_photos() {
        let rig = rig();
        let err = rig
            .orchestrator
            .create_offer(SubmitOfferRequest {
                photo_urls: vec![],
                user_description: None,
                user_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OfferError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn offer_view_carries_fresh_ledger_stage() {
        let rig = rig();
        let id = submit(&rig).await;

        let view = rig.orchestrator.offer_view(id).await.unwrap();
        assert_eq!(view.processing_stage, Some(PipelineStage::Vision));

        // Cached snapshot, but the stage must not be stale
        rig.orchestrator.on_vision_complete(id, vision_ok()).await;
        let view = rig.orchestrator.offer_view(id).await.unwrap();
        assert_eq!(view.processing_stage, Some(PipelineStage::Marketplace));
    }

    #[tokio::test]
    async fn missing_offer_view_is_not_found() {
        let rig = rig();
        let err = rig.orchestrator.offer_view(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, OfferError::NotFound(_)));
    }
}
