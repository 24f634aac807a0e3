use crate::models::{
    EscalationEntry, MarketResult, Offer, OfferStatus, PricingResult, VisionResult, VoiceResult,
};
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("offer {0} not found")]
    NotFound(Uuid),
    #[error("store request failed: {0}")]
    Request(String),
}

/// Field-level patch, last-write-wins per field. `status` is latched: the
/// store applies a status write only while the current status is still
/// `processing`, so a terminal value is written at most once.
#[derive(Debug, Default, Clone)]
pub struct OfferPatch {
    pub status: Option<OfferStatus>,
    pub identification: Option<VisionResult>,
    pub market: Option<MarketResult>,
    pub pricing: Option<PricingResult>,
    pub estimated_profit: Option<f64>,
    pub voice: Option<VoiceResult>,
    pub escalated: Option<bool>,
    pub escalation_reason: Option<String>,
    pub fraud_risk_score: Option<f32>,
    pub fraud_flagged: Option<bool>,
}

/// Durable store collaborator: point read/patch by offer id, no
/// transactional guarantees beyond last-write-wins per field.
#[async_trait]
pub trait OfferStore: Send + Sync {
    async fn insert(&self, offer: Offer) -> Result<(), StoreError>;
    async fn get(&self, id: Uuid) -> Result<Option<Offer>, StoreError>;
    async fn patch(&self, id: Uuid, patch: OfferPatch) -> Result<(), StoreError>;
    /// Appends to the escalation log without touching prior entries.
    async fn append_escalation(&self, id: Uuid, entry: EscalationEntry) -> Result<(), StoreError>;
}

/// In-process store used by the demo binary and tests.
#[derive(Default)]
pub struct MemoryStore {
    offers: Mutex<HashMap<Uuid, Offer>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_patch(offer: &mut Offer, patch: OfferPatch) {
    if let Some(status) = patch.status
        && offer.status == OfferStatus::Processing
    {
        offer.status = status;
    }
    if let Some(vision) = patch.identification {
        offer.item_category = Some(vision.category);
        offer.item_subcategory = Some(vision.subcategory);
        offer.item_brand = Some(vision.brand);
        offer.item_model = Some(vision.model);
        offer.item_condition = Some(vision.condition);
        offer.item_features = vision.features;
        offer.item_damage = vision.damage;
        offer.item_identifiers = vision.identifiers;
        offer.ai_confidence = Some(vision.confidence);
        offer.ai_model_used = Some(vision.model_used);
    }
    if let Some(market) = patch.market {
        offer.market_data = Some(market);
    }
    if let Some(pricing) = patch.pricing {
        offer.fmv = Some(pricing.fmv);
        offer.fmv_confidence = Some(pricing.fmv_confidence);
        offer.offer_amount = pricing.offer_amount;
        offer.offer_to_market_ratio = Some(pricing.offer_to_market_ratio);
        offer.condition_multiplier = Some(pricing.condition_multiplier);
        offer.category_margin = Some(pricing.category_margin);
    }
    if let Some(profit) = patch.estimated_profit {
        offer.estimated_profit = Some(profit);
    }
    if let Some(voice) = patch.voice {
        offer.jake_script = Some(voice.script);
        offer.jake_animation_state = Some(voice.animation_state);
        offer.jake_voice_url = voice.audio_url;
        offer.jake_tier = Some(voice.tier);
    }
    if let Some(escalated) = patch.escalated {
        offer.escalated = escalated;
    }
    if let Some(reason) = patch.escalation_reason {
        offer.escalation_reason = Some(reason);
    }
    if let Some(score) = patch.fraud_risk_score {
        offer.fraud_risk_score = Some(score);
    }
    if let Some(flagged) = patch.fraud_flagged {
        offer.fraud_flagged = flagged;
    }
}

#[async_trait]
impl OfferStore for MemoryStore {
    async fn insert(&self, offer: Offer) -> Result<(), StoreError> {
        self.offers.lock().await.insert(offer.id, offer);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Offer>, StoreError> {
        Ok(self.offers.lock().await.get(&id).cloned())
    }

    async fn patch(&self, id: Uuid, patch: OfferPatch) -> Result<(), StoreError> {
        let mut offers = self.offers.lock().await;
        let offer = offers.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        apply_patch(offer, patch);
        Ok(())
    }

    async fn append_escalation(&self, id: Uuid, entry: EscalationEntry) -> Result<(), StoreError> {
        let mut offers = self.offers.lock().await;
        let offer = offers.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        offer.escalation_log.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_offer() -> Offer {
        Offer::new(None, vec!["https://cdn.example/a.jpg".into()], None, 24)
    }

    #[tokio::test]
    async fn status_is_latched_once_terminal() {
        let store = MemoryStore::new();
        let offer = sample_offer();
        let id = offer.id;
        store.insert(offer).await.unwrap();

        store
            .patch(
                id,
                OfferPatch {
                    status: Some(OfferStatus::Ready),
                    ..OfferPatch::default()
                },
            )
            .await
            .unwrap();
        // A later status write must be ignored
        store
            .patch(
                id,
                OfferPatch {
                    status: Some(OfferStatus::Expired),
                    ..OfferPatch::default()
                },
            )
            .await
            .unwrap();
        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, OfferStatus::Ready);
    }

    #[tokio::test]
    async fn escalation_log_is_append_only() {
        let store = MemoryStore::new();
        let offer = sample_offer();
        let id = offer.id;
        store.insert(offer).await.unwrap();

        store
            .append_escalation(id, EscalationEntry::now("low confidence"))
            .await
            .unwrap();
        store
            .append_escalation(id, EscalationEntry::now("daily limit"))
            .await
            .unwrap();

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.escalation_log.len(), 2);
        assert_eq!(stored.escalation_log[0].note, "low confidence");
        assert_eq!(stored.escalation_log[1].note, "daily limit");
        assert!(stored.escalation_log[0].at <= stored.escalation_log[1].at);
    }

    #[tokio::test]
    async fn patch_is_last_write_wins_per_field() {
        let store = MemoryStore::new();
        let offer = sample_offer();
        let id = offer.id;
        store.insert(offer).await.unwrap();

        store
            .patch(
                id,
                OfferPatch {
                    estimated_profit: Some(40.0),
                    ..OfferPatch::default()
                },
            )
            .await
            .unwrap();
        store
            .patch(
                id,
                OfferPatch {
                    estimated_profit: Some(55.0),
                    ..OfferPatch::default()
                },
            )
            .await
            .unwrap();

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.estimated_profit, Some(55.0));
        // Untouched fields survive
        assert_eq!(stored.photos.len(), 1);
    }

    #[tokio::test]
    async fn vision_patch_keeps_the_whole_identification_blob() {
        let store = MemoryStore::new();
        let offer = sample_offer();
        let id = offer.id;
        store.insert(offer).await.unwrap();

        let mut identifiers = HashMap::new();
        identifiers.insert("serial".to_string(), "8N0042".to_string());
        identifiers.insert("caseback_ref".to_string(), "7S26-0020".to_string());
        store
            .patch(
                id,
                OfferPatch {
                    identification: Some(VisionResult {
                        category: "Watches".into(),
                        subcategory: "Watches / dive".into(),
                        brand: "Seiko".into(),
                        model: "SKX007".into(),
                        condition: "good".into(),
                        features: vec!["day-date".into()],
                        damage: vec![],
                        confidence: 82.0,
                        identifiers: identifiers.clone(),
                        model_used: "demo-vision-1".into(),
                    }),
                    ..OfferPatch::default()
                },
            )
            .await
            .unwrap();

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.item_brand.as_deref(), Some("Seiko"));
        assert_eq!(stored.item_identifiers, identifiers);
    }

    #[tokio::test]
    async fn patch_missing_offer_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .patch(Uuid::new_v4(), OfferPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
