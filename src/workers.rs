use crate::models::{
    FraudAction, FraudReport, MarketResult, MarketStats, PricingResult, VisionResult, VoiceResult,
};
use async_trait::async_trait;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use thiserror::Error;
use tokio::time::{Duration, sleep};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("{0} unavailable: {1}")]
    Unavailable(&'static str, String),
    #[error("{0} rejected input: {1}")]
    Invalid(&'static str, String),
}

/// Inputs for the voice stage, assembled by the orchestrator from the
/// priced offer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceBrief {
    pub offer_id: Uuid,
    pub scenario: String,
    pub item_name: String,
    pub offer_amount: f64,
    pub fmv: f64,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FraudCheckRequest {
    pub offer_id: Uuid,
    pub user_id: Option<Uuid>,
    pub offer_amount: f64,
    pub fmv: f64,
    pub category: Option<String>,
    pub condition: Option<String>,
}

/// The five evaluation collaborators. Their algorithms live in external
/// services; these traits are the callback contracts the pipeline drives.
#[async_trait]
pub trait StageWorkers: Send + Sync {
    async fn identify(
        &self,
        offer_id: Uuid,
        photo_urls: &[String],
        user_description: Option<&str>,
    ) -> Result<VisionResult, WorkerError>;

    async fn research(
        &self,
        offer_id: Uuid,
        brand: &str,
        model: &str,
        category: &str,
        condition: &str,
    ) -> Result<MarketResult, WorkerError>;

    async fn price(
        &self,
        offer_id: Uuid,
        stats: &MarketStats,
        category: &str,
        condition: &str,
    ) -> Result<PricingResult, WorkerError>;

    async fn compose_voice(&self, brief: &VoiceBrief) -> Result<VoiceResult, WorkerError>;
}

#[async_trait]
pub trait FraudScorer: Send + Sync {
    async fn analyze(&self, request: &FraudCheckRequest) -> Result<FraudReport, WorkerError>;
}

/// Jake reads the room from the offer/market ratio.
pub fn jake_scenario(ratio: f64) -> &'static str {
    if ratio >= 0.7 {
        "offer_high"
    } else if ratio >= 0.5 {
        "offer_standard"
    } else if ratio >= 0.3 {
        "offer_low"
    } else {
        "offer_very_low"
    }
}

// ---- Deterministic demo workers ----

const DEMO_BRANDS: [(&str, &str, &str); 5] = [
    ("Seiko", "SKX007", "Watches"),
    ("DeWalt", "DCD791", "Power Tools"),
    ("Nintendo", "Switch OLED", "Video Game Consoles"),
    ("Fender", "Player Stratocaster", "Guitars"),
    ("Canon", "EOS R50", "Cameras"),
];

fn seed_for(offer_id: Uuid, salt: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    offer_id.hash(&mut hasher);
    salt.hash(&mut hasher);
    hasher.finish()
}

fn short_pause(ms: u64) -> impl std::future::Future<Output = ()> {
    sleep(Duration::from_millis(ms))
}

/// Offline stand-ins for the external evaluators. Results are seeded from
/// the offer id so repeated runs of one offer agree.
pub struct DemoWorkers;

#[async_trait]
impl StageWorkers for DemoWorkers {
    async fn identify(
        &self,
        offer_id: Uuid,
        photo_urls: &[String],
        _user_description: Option<&str>,
    ) -> Result<VisionResult, WorkerError> {
        short_pause(30).await;
        if photo_urls.is_empty() {
            return Err(WorkerError::Invalid("vision", "no photos".into()));
        }
        let mut rng = SmallRng::seed_from_u64(seed_for(offer_id, "vision"));
        let (brand, model, category) = DEMO_BRANDS[rng.random_range(0..DEMO_BRANDS.len())];
        let condition = ["good", "excellent", "fair"][rng.random_range(0..3)];
        Ok(VisionResult {
            category: category.to_string(),
            subcategory: format!("{category} / general"),
            brand: brand.to_string(),
            model: model.to_string(),
            condition: condition.to_string(),
            features: vec!["original box".into()],
            damage: Vec::new(),
            confidence: rng.random_range(62.0..95.0),
            identifiers: HashMap::new(),
            model_used: "demo-vision-1".to_string(),
        })
    }

    async fn research(
        &self,
        offer_id: Uuid,
        _brand: &str,
        _model: &str,
        _category: &str,
        _condition: &str,
    ) -> Result<MarketResult, WorkerError> {
        short_pause(40).await;
        let mut rng = SmallRng::seed_from_u64(seed_for(offer_id, "marketplace"));
        let count = rng.random_range(4..12);
        let median = rng.random_range(80.0..420.0_f64);
        Ok(MarketResult {
            stats: MarketStats {
                count,
                median,
                mean: median * 1.04,
                std_dev: median * 0.18,
            },
            sources_checked: vec!["ebay".into(), "facebook".into()],
            cache_hit: false,
        })
    }

    async fn price(
        &self,
        _offer_id: Uuid,
        stats: &MarketStats,
        _category: &str,
        condition: &str,
    ) -> Result<PricingResult, WorkerError> {
        short_pause(25).await;
        let condition_multiplier = match condition {
            "excellent" => 0.95,
            "good" => 0.85,
            _ => 0.7,
        };
        let fmv = stats.median * condition_multiplier;
        let category_margin = 0.45;
        let offer_amount = (fmv * category_margin * 100.0).round() / 100.0;
        Ok(PricingResult {
            fmv,
            fmv_confidence: 0.8,
            offer_amount,
            offer_to_market_ratio: offer_amount / stats.median,
            condition_multiplier,
            category_margin,
            data_quality: if stats.count >= 8 { "high" } else { "medium" }.to_string(),
        })
    }

    async fn compose_voice(&self, brief: &VoiceBrief) -> Result<VoiceResult, WorkerError> {
        short_pause(20).await;
        let script = match brief.scenario.as_str() {
            "offer_high" => format!(
                "Now THIS is what I like to see. {} — clean piece. I can do ${:.0} right now.",
                brief.item_name, brief.offer_amount
            ),
            "offer_standard" => format!(
                "Alright, {} — seen a few of these move. ${:.0}, cash in hand.",
                brief.item_name, brief.offer_amount
            ),
            "offer_low" => format!(
                "I'll be straight with ya — {} ain't flying off shelves. Best I can do is ${:.0}.",
                brief.item_name, brief.offer_amount
            ),
            _ => format!(
                "Look, partner. {} is a tough sell. ${:.0}, take it or leave it.",
                brief.item_name, brief.offer_amount
            ),
        };
        Ok(VoiceResult {
            script,
            tone: "folksy".to_string(),
            animation_state: "talking".to_string(),
            tier: match brief.scenario.as_str() {
                "offer_high" => 1,
                "offer_standard" => 2,
                "offer_low" => 3,
                _ => 4,
            },
            audio_url: None,
        })
    }
}

/// Offline fraud scorer: always low risk. The real scorer is a separate
/// service reached over HTTP.
pub struct DemoFraudScorer;

#[async_trait]
impl FraudScorer for DemoFraudScorer {
    async fn analyze(&self, request: &FraudCheckRequest) -> Result<FraudReport, WorkerError> {
        short_pause(15).await;
        let mut rng = SmallRng::seed_from_u64(seed_for(request.offer_id, "fraud"));
        Ok(FraudReport {
            risk_score: rng.random_range(2.0..25.0),
            risk_level: "low".to_string(),
            confidence: 0.9,
            explanation: "no anomalous signals".to_string(),
            recommended_action: FraudAction::Approve,
        })
    }
}
