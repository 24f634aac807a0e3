use crate::config::BusinessRules;
use crate::models::{Offer, StageData, WireMessage};
use crate::orchestrator::{OfferError, OfferOrchestrator};
use crate::stage::{PipelineStage, PublicPhase};
use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Close codes on the progress stream: normal end of conversation, or the
/// caller asked for something we will not serve.
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_POLICY: u16 = 1008;

/// User-facing wording for the two halted exits. Internal reasons stay in
/// the logs.
pub const ESCALATED_MESSAGE: &str =
    "This offer needs a closer look from our team. Hang tight, partner.";
pub const FAILED_MESSAGE: &str =
    "Something went wrong processing this offer. Our team has been notified.";

/// What the session state machine asks the transport to do after observing
/// a ledger stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageChange {
    Progress(PublicPhase),
    Success,
    Escalated,
    Failed,
}

/// Per-connection dedup state. Polling is repetitive by nature; the client
/// hears about each phase exactly once, in order, and never hears about
/// stages with no public mapping.
#[derive(Debug, Default)]
pub struct StreamSession {
    last_stage: Option<PipelineStage>,
    last_phase: Option<PublicPhase>,
}

impl StreamSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, stage: PipelineStage) -> Option<StageChange> {
        if self.last_stage == Some(stage) {
            return None;
        }
        // A stale ledger read must never step the channel backwards
        if let (Some(prev), Some(next)) = (
            self.last_stage.and_then(|s| s.position()),
            stage.position(),
        ) && next < prev
        {
            return None;
        }
        self.last_stage = Some(stage);
        match stage {
            PipelineStage::Ready => Some(StageChange::Success),
            PipelineStage::Escalated => Some(StageChange::Escalated),
            PipelineStage::Failed => Some(StageChange::Failed),
            other => {
                let phase = PublicPhase::for_stage(other)?;
                if self.last_phase == Some(phase) {
                    return None;
                }
                self.last_phase = Some(phase);
                Some(StageChange::Progress(phase))
            }
        }
    }
}

/// Ledger stage with fallbacks for expiry: the ledger is short-lived, the
/// durable record is not, so a missing entry is reconstructed from the
/// offer itself.
pub fn effective_stage(offer: &Offer, ledger: Option<PipelineStage>) -> Option<PipelineStage> {
    if let Some(stage) = ledger {
        return Some(stage);
    }
    if offer.escalated {
        return Some(PipelineStage::Escalated);
    }
    if offer.status.is_terminal() {
        return Some(PipelineStage::Ready);
    }
    None
}

/// Phase enrichment for the client animation, derived from whatever the
/// pipeline has written so far. Missing inputs degrade to empty fields.
pub fn build_stage_data(offer: &Offer, phase: PublicPhase) -> (StageData, Option<String>) {
    match phase {
        PublicPhase::Looking => {
            let labels: Vec<String> = [
                offer.item_category.clone(),
                offer.item_brand.clone(),
                offer.item_model.clone(),
            ]
            .into_iter()
            .flatten()
            .collect();
            (
                StageData {
                    labels: Some(labels),
                    ..StageData::default()
                },
                None,
            )
        }
        PublicPhase::Researching => {
            let (marketplace_count, sales_count) = match &offer.market_data {
                Some(market) => (
                    Some(market.sources_checked.len() as u32),
                    Some(market.stats.count),
                ),
                None => (Some(0), Some(0)),
            };
            (
                StageData {
                    marketplace_count,
                    sales_count,
                    ..StageData::default()
                },
                None,
            )
        }
        PublicPhase::Deciding => {
            let price_points = offer.market_data.as_ref().map(|market| {
                vec![
                    (market.stats.median - market.stats.std_dev).max(0.0),
                    market.stats.median,
                    market.stats.median + market.stats.std_dev,
                ]
            });
            (
                StageData {
                    price_points,
                    ..StageData::default()
                },
                offer.jake_script.clone(),
            )
        }
    }
}

#[derive(Debug, Error)]
#[error("client connection lost")]
struct ConnectionLost;

enum ClientSignal {
    /// Inbound frames carry nothing; drain and keep polling.
    Frame,
    Gone,
}

/// The wire side of one progress channel, separated from the loop so the
/// loop's behavior is testable without a socket.
#[async_trait]
trait StreamTransport: Send {
    async fn send(&mut self, message: &WireMessage) -> Result<(), ConnectionLost>;
    async fn close(&mut self, code: u16, reason: &str);
    async fn recv(&mut self) -> ClientSignal;
}

struct WsTransport {
    socket: WebSocket,
}

#[async_trait]
impl StreamTransport for WsTransport {
    async fn send(&mut self, message: &WireMessage) -> Result<(), ConnectionLost> {
        match serde_json::to_string(message) {
            Ok(json) => self
                .socket
                .send(Message::Text(json.into()))
                .await
                .map_err(|_| ConnectionLost),
            Err(err) => {
                warn!(target = "pawnshop.stream", error = %err, "frame serialization failed");
                Ok(())
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        // The peer may already be gone; a failed close is not an event
        let _ = self.socket.send(Message::Close(Some(frame))).await;
    }

    async fn recv(&mut self) -> ClientSignal {
        match self.socket.recv().await {
            Some(Ok(Message::Close(_))) | None => ClientSignal::Gone,
            Some(Err(_)) => ClientSignal::Gone,
            Some(Ok(_)) => ClientSignal::Frame,
        }
    }
}

/// Entry point from the upgrade handler.
pub async fn run(
    socket: WebSocket,
    orchestrator: Arc<OfferOrchestrator>,
    rules: &BusinessRules,
    raw_id: &str,
) {
    let mut transport = WsTransport { socket };
    drive(&mut transport, orchestrator, rules, raw_id).await;
}

enum Wake {
    Tick,
    Deadline,
    Client(ClientSignal),
}

/// Drives one accepted channel: validates the id, short-circuits offers
/// that already finished, then polls the ledger until success, a halt, the
/// lifetime cap, or the client hangs up. A transient store failure during
/// the poll loop is logged and retried on the next interval; only the
/// transport ending terminates the channel early.
async fn drive<T: StreamTransport>(
    transport: &mut T,
    orchestrator: Arc<OfferOrchestrator>,
    rules: &BusinessRules,
    raw_id: &str,
) {
    let Ok(offer_id) = Uuid::parse_str(raw_id.trim()) else {
        let _ = transport
            .send(&WireMessage::Error {
                error: "Invalid offer ID".into(),
                reason: None,
            })
            .await;
        transport.close(CLOSE_POLICY, "invalid offer id").await;
        return;
    };

    let offer = match orchestrator.offer(offer_id).await {
        Ok(offer) => offer,
        Err(OfferError::NotFound(_)) => {
            let _ = transport
                .send(&WireMessage::Error {
                    error: "Offer not found".into(),
                    reason: None,
                })
                .await;
            transport.close(CLOSE_POLICY, "unknown offer").await;
            return;
        }
        Err(err) => {
            warn!(target = "pawnshop.stream", offer_id = %offer_id, error = %err, "offer lookup failed");
            let _ = transport
                .send(&WireMessage::Error {
                    error: FAILED_MESSAGE.into(),
                    reason: None,
                })
                .await;
            transport.close(CLOSE_NORMAL, "lookup failed").await;
            return;
        }
    };

    // Nothing left to stream for an offer that already finished
    if offer.status.is_terminal() {
        let _ = transport
            .send(&WireMessage::Complete {
                complete: true,
                offer_id,
            })
            .await;
        transport.close(CLOSE_NORMAL, "already complete").await;
        return;
    }

    info!(target = "pawnshop.stream", offer_id = %offer_id, "stream opened");
    crate::metrics::inc_streams();
    let mut session = StreamSession::new();
    let mut ticker = tokio::time::interval(rules.stream_poll_interval);
    let deadline = tokio::time::sleep(rules.stream_max_lifetime);
    tokio::pin!(deadline);

    loop {
        let wake = tokio::select! {
            _ = ticker.tick() => Wake::Tick,
            _ = &mut deadline => Wake::Deadline,
            signal = transport.recv() => Wake::Client(signal),
        };
        match wake {
            Wake::Tick => {
                let offer = match orchestrator.offer(offer_id).await {
                    Ok(offer) => offer,
                    Err(err) => {
                        // Transient store trouble must not kill a healthy
                        // stream; the next tick tries again
                        warn!(target = "pawnshop.stream", offer_id = %offer_id, error = %err, "poll failed, retrying next interval");
                        continue;
                    }
                };
                let ledger = orchestrator.get_stage(offer_id).await;
                let Some(stage) = effective_stage(&offer, ledger) else {
                    continue;
                };
                match session.observe(stage) {
                    None => {}
                    Some(StageChange::Progress(phase)) => {
                        let (data, jake_message) = build_stage_data(&offer, phase);
                        if transport
                            .send(&WireMessage::Stage {
                                stage: phase,
                                data,
                                jake_message,
                            })
                            .await
                            .is_err()
                        {
                            debug!(target = "pawnshop.stream", offer_id = %offer_id, "client gone mid-send");
                            return;
                        }
                    }
                    Some(StageChange::Success) => {
                        // Let the final enriched frame land before the close
                        let (data, jake_message) = build_stage_data(&offer, PublicPhase::Deciding);
                        let _ = transport
                            .send(&WireMessage::Stage {
                                stage: PublicPhase::Deciding,
                                data,
                                jake_message,
                            })
                            .await;
                        tokio::time::sleep(rules.final_frame_delay).await;
                        let _ = transport
                            .send(&WireMessage::Complete {
                                complete: true,
                                offer_id,
                            })
                            .await;
                        transport.close(CLOSE_NORMAL, "complete").await;
                        return;
                    }
                    Some(StageChange::Escalated) => {
                        let _ = transport
                            .send(&WireMessage::Error {
                                error: ESCALATED_MESSAGE.into(),
                                reason: Some("escalated".into()),
                            })
                            .await;
                        transport.close(CLOSE_NORMAL, "escalated").await;
                        return;
                    }
                    Some(StageChange::Failed) => {
                        let _ = transport
                            .send(&WireMessage::Error {
                                error: FAILED_MESSAGE.into(),
                                reason: Some("failed".into()),
                            })
                            .await;
                        transport.close(CLOSE_NORMAL, "failed").await;
                        return;
                    }
                }
            }
            Wake::Deadline => {
                info!(target = "pawnshop.stream", offer_id = %offer_id, "stream lifetime cap reached");
                let _ = transport
                    .send(&WireMessage::Error {
                        error: "Stream timed out".into(),
                        reason: Some("timeout".into()),
                    })
                    .await;
                transport.close(CLOSE_NORMAL, "timeout").await;
                return;
            }
            Wake::Client(ClientSignal::Gone) => {
                debug!(target = "pawnshop.stream", offer_id = %offer_id, "client closed");
                return;
            }
            Wake::Client(ClientSignal::Frame) => {}
        }
    }
}
