use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Internal pipeline stages in pipeline order. `Escalated` and `Failed` are
/// absorbing: once written, the automated pipeline makes no further
/// transitions for that offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineStage {
    Uploaded,
    Vision,
    Marketplace,
    Pricing,
    FraudCheck,
    JakeVoice,
    Ready,
    Escalated,
    Failed,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Uploaded => "uploaded",
            PipelineStage::Vision => "vision",
            PipelineStage::Marketplace => "marketplace",
            PipelineStage::Pricing => "pricing",
            PipelineStage::FraudCheck => "fraud-check",
            PipelineStage::JakeVoice => "jake-voice",
            PipelineStage::Ready => "ready",
            PipelineStage::Escalated => "escalated",
            PipelineStage::Failed => "failed",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input.trim() {
            "uploaded" => Some(PipelineStage::Uploaded),
            "vision" => Some(PipelineStage::Vision),
            "marketplace" => Some(PipelineStage::Marketplace),
            "pricing" => Some(PipelineStage::Pricing),
            "fraud-check" => Some(PipelineStage::FraudCheck),
            "jake-voice" => Some(PipelineStage::JakeVoice),
            "ready" => Some(PipelineStage::Ready),
            "escalated" => Some(PipelineStage::Escalated),
            "failed" => Some(PipelineStage::Failed),
            _ => None,
        }
    }

    /// Position in the happy path, `None` for the absorbing jumps.
    pub fn position(&self) -> Option<u8> {
        match self {
            PipelineStage::Uploaded => Some(0),
            PipelineStage::Vision => Some(1),
            PipelineStage::Marketplace => Some(2),
            PipelineStage::Pricing => Some(3),
            PipelineStage::FraudCheck => Some(4),
            PipelineStage::JakeVoice => Some(5),
            PipelineStage::Ready => Some(6),
            PipelineStage::Escalated | PipelineStage::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStage::Ready | PipelineStage::Escalated | PipelineStage::Failed
        )
    }
}

/// The three-phase vocabulary the client sees. Internal stages that have no
/// mapping (`uploaded`, `fraud-check`) are simply not surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublicPhase {
    Looking,
    Researching,
    Deciding,
}

static STAGE_TO_PHASE: Lazy<HashMap<PipelineStage, PublicPhase>> = Lazy::new(|| {
    HashMap::from([
        (PipelineStage::Vision, PublicPhase::Looking),
        (PipelineStage::Marketplace, PublicPhase::Researching),
        (PipelineStage::Pricing, PublicPhase::Deciding),
        (PipelineStage::JakeVoice, PublicPhase::Deciding),
    ])
});

impl PublicPhase {
    pub fn for_stage(stage: PipelineStage) -> Option<Self> {
        STAGE_TO_PHASE.get(&stage).copied()
    }
}

/// Ephemeral ledger entry: best-effort, TTL-bounded, never authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: PipelineStage,
    pub updated_at: DateTime<Utc>,
}

impl StageRecord {
    pub fn now(stage: PipelineStage) -> Self {
        Self {
            stage,
            updated_at: Utc::now(),
        }
    }
}
