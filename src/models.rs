use crate::stage::{PipelineStage, PublicPhase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Durable offer status. `Processing` doubles as the "needs human" sentinel
/// when `escalated` is set; every other value is terminal and written at
/// most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    Processing,
    Ready,
    Accepted,
    Declined,
    Expired,
}

impl OfferStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OfferStatus::Processing)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoRef {
    pub url: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Append-only escalation log entry. Never overwritten; multiple causes on
/// one offer accumulate chronologically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationEntry {
    pub note: String,
    pub at: DateTime<Utc>,
}

impl EscalationEntry {
    pub fn now(note: impl Into<String>) -> Self {
        Self {
            note: note.into(),
            at: Utc::now(),
        }
    }
}

/// The durable offer record. Pricing fields are populated incrementally by
/// the pipeline stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub status: OfferStatus,
    pub photos: Vec<PhotoRef>,
    pub user_description: Option<String>,

    // Vision
    pub item_category: Option<String>,
    pub item_subcategory: Option<String>,
    pub item_brand: Option<String>,
    pub item_model: Option<String>,
    pub item_condition: Option<String>,
    pub item_features: Vec<String>,
    pub item_damage: Vec<String>,
    /// Serials, model numbers and similar identifiers the vision stage
    /// extracted from the photos.
    #[serde(default)]
    pub item_identifiers: HashMap<String, String>,
    pub ai_confidence: Option<f32>,
    pub ai_model_used: Option<String>,

    // Marketplace
    pub market_data: Option<MarketResult>,

    // Pricing
    pub fmv: Option<f64>,
    pub fmv_confidence: Option<f32>,
    pub offer_amount: f64,
    pub offer_to_market_ratio: Option<f64>,
    pub condition_multiplier: Option<f64>,
    pub category_margin: Option<f64>,
    pub estimated_profit: Option<f64>,

    // Fraud soft flag
    pub fraud_risk_score: Option<f32>,
    pub fraud_flagged: bool,

    // Voice
    pub jake_script: Option<String>,
    pub jake_animation_state: Option<String>,
    pub jake_voice_url: Option<String>,
    pub jake_tier: Option<u8>,

    pub escalated: bool,
    pub escalation_reason: Option<String>,
    pub escalation_log: Vec<EscalationEntry>,

    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Offer {
    pub fn new(
        user_id: Option<Uuid>,
        photo_urls: Vec<String>,
        user_description: Option<String>,
        expiry_hours: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            status: OfferStatus::Processing,
            photos: photo_urls
                .into_iter()
                .map(|url| PhotoRef {
                    url,
                    uploaded_at: now,
                })
                .collect(),
            user_description,
            item_category: None,
            item_subcategory: None,
            item_brand: None,
            item_model: None,
            item_condition: None,
            item_features: Vec::new(),
            item_damage: Vec::new(),
            item_identifiers: HashMap::new(),
            ai_confidence: None,
            ai_model_used: None,
            market_data: None,
            fmv: None,
            fmv_confidence: None,
            offer_amount: 0.0,
            offer_to_market_ratio: None,
            condition_multiplier: None,
            category_margin: None,
            estimated_profit: None,
            fraud_risk_score: None,
            fraud_flagged: false,
            jake_script: None,
            jake_animation_state: None,
            jake_voice_url: None,
            jake_tier: None,
            escalated: false,
            escalation_reason: None,
            escalation_log: Vec::new(),
            expires_at: now + chrono::Duration::hours(expiry_hours),
            created_at: now,
        }
    }
}

// ---- Stage result payloads (collaborator callbacks) ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionResult {
    pub category: String,
    pub subcategory: String,
    pub brand: String,
    pub model: String,
    pub condition: String,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub damage: Vec<String>,
    pub confidence: f32,
    #[serde(default)]
    pub identifiers: HashMap<String, String>,
    pub model_used: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketStats {
    pub count: u32,
    pub median: f64,
    pub mean: f64,
    pub std_dev: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketResult {
    pub stats: MarketStats,
    pub sources_checked: Vec<String>,
    #[serde(default)]
    pub cache_hit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingResult {
    pub fmv: f64,
    pub fmv_confidence: f32,
    pub offer_amount: f64,
    pub offer_to_market_ratio: f64,
    pub condition_multiplier: f64,
    pub category_margin: f64,
    pub data_quality: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FraudAction {
    Approve,
    Review,
    Escalate,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudReport {
    pub risk_score: f32,
    pub risk_level: String,
    pub confidence: f32,
    pub explanation: String,
    pub recommended_action: FraudAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceResult {
    pub script: String,
    pub tone: String,
    pub animation_state: String,
    pub tier: u8,
    pub audio_url: Option<String>,
}

// ---- HTTP DTOs ----

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitOfferRequest {
    pub photo_urls: Vec<String>,
    #[serde(default)]
    pub user_description: Option<String>,
    #[serde(default)]
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct SubmitOfferResponse {
    pub offer_id: Uuid,
}

/// The plain offer representation the fallback poller consumes. The
/// `processing_stage` field comes from the stage ledger and may be absent
/// even while the pipeline runs (ledger expiry is not failure).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferView {
    pub id: Uuid,
    pub status: OfferStatus,
    pub processing_stage: Option<PipelineStage>,
    pub offer_amount: f64,
    pub fmv: Option<f64>,
    pub item_brand: Option<String>,
    pub item_model: Option<String>,
    pub item_category: Option<String>,
    pub item_condition: Option<String>,
    pub jake_script: Option<String>,
    pub escalated: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl OfferView {
    pub fn from_offer(offer: &Offer, processing_stage: Option<PipelineStage>) -> Self {
        Self {
            id: offer.id,
            status: offer.status,
            processing_stage,
            offer_amount: offer.offer_amount,
            fmv: offer.fmv,
            item_brand: offer.item_brand.clone(),
            item_model: offer.item_model.clone(),
            item_category: offer.item_category.clone(),
            item_condition: offer.item_condition.clone(),
            jake_script: offer.jake_script.clone(),
            escalated: offer.escalated,
            expires_at: offer.expires_at,
            created_at: offer.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

// ---- Push-channel wire protocol ----

/// Stage-specific enrichment for the client animation. Missing source data
/// degrades to empty fields, never an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marketplace_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sales_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_points: Option<Vec<f64>>,
}

/// JSON text frames on the push channel. Exactly one of the three shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireMessage {
    #[serde(rename_all = "camelCase")]
    Stage {
        stage: PublicPhase,
        data: StageData,
        #[serde(skip_serializing_if = "Option::is_none")]
        jake_message: Option<String>,
    },
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Complete { complete: bool, offer_id: Uuid },
}
