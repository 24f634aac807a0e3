use crate::models::{OfferView, StageData, WireMessage};
use crate::stage::PublicPhase;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("push connect failed: {0}")]
    Connect(String),
    #[error("poll request failed: {0}")]
    Request(String),
}

/// What the consumer (UI layer) receives, regardless of which transport
/// produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressUpdate {
    Phase {
        phase: PublicPhase,
        data: StageData,
        jake_message: Option<String>,
    },
    Complete,
    Halted {
        message: String,
    },
}

/// A live push connection for one offer. `None` means the stream ended.
#[async_trait]
pub trait PushConnection: Send {
    async fn next_message(&mut self) -> Option<WireMessage>;
}

#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn connect(&self, offer_id: Uuid) -> Result<Box<dyn PushConnection>, TransportError>;
}

#[async_trait]
pub trait OfferPoll: Send + Sync {
    async fn fetch(&self, offer_id: Uuid) -> Result<OfferView, TransportError>;
}

/// Follows one offer to a terminal update over exactly one transport at a
/// time: push while it lives, plain polling when the push channel cannot be
/// established or dies mid-flight. Phase dedup carries across the switch,
/// so the consumer never sees a phase repeat.
pub struct ProgressSubscriber {
    push: Option<Arc<dyn PushChannel>>,
    poll: Arc<dyn OfferPoll>,
    connect_timeout: Duration,
    poll_interval: Duration,
}

impl ProgressSubscriber {
    /// `push: None` means no push transport is configured and every update
    /// comes from polling.
    pub fn new(
        push: Option<Arc<dyn PushChannel>>,
        poll: Arc<dyn OfferPoll>,
        connect_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            push,
            poll,
            connect_timeout,
            poll_interval,
        }
    }

    /// Runs until a terminal update is delivered or the consumer hangs up.
    pub async fn run(&self, offer_id: Uuid, tx: mpsc::Sender<ProgressUpdate>) {
        let mut last_phase: Option<PublicPhase> = None;

        if let Some(push) = &self.push {
            match timeout(self.connect_timeout, push.connect(offer_id)).await {
                Ok(Ok(connection)) => {
                    info!(target = "pawnshop.subscriber", offer_id = %offer_id, "push channel up");
                    if self
                        .consume_push(connection, &tx, &mut last_phase)
                        .await
                    {
                        return;
                    }
                    // Push died without a terminal frame, pick up by polling
                    warn!(target = "pawnshop.subscriber", offer_id = %offer_id, "push ended early, falling back to polling");
                }
                Ok(Err(err)) => {
                    warn!(target = "pawnshop.subscriber", offer_id = %offer_id, error = %err, "push connect failed, falling back to polling");
                }
                Err(_) => {
                    warn!(target = "pawnshop.subscriber", offer_id = %offer_id, "push connect timed out, falling back to polling");
                }
            }
        }

        self.poll_until_terminal(offer_id, &tx, &mut last_phase).await;
    }

    /// Returns `true` when the push stream delivered a terminal frame. The
    /// connection is dropped before any fallback polling starts.
    async fn consume_push(
        &self,
        mut connection: Box<dyn PushConnection>,
        tx: &mpsc::Sender<ProgressUpdate>,
        last_phase: &mut Option<PublicPhase>,
    ) -> bool {
        while let Some(message) = connection.next_message().await {
            match message {
                WireMessage::Stage {
                    stage,
                    data,
                    jake_message,
                } => {
                    if *last_phase == Some(stage) {
                        continue;
                    }
                    *last_phase = Some(stage);
                    if tx
                        .send(ProgressUpdate::Phase {
                            phase: stage,
                            data,
                            jake_message,
                        })
                        .await
                        .is_err()
                    {
                        return true;
                    }
                }
                WireMessage::Complete { .. } => {
                    let _ = tx.send(ProgressUpdate::Complete).await;
                    return true;
                }
                WireMessage::Error { error, .. } => {
                    let _ = tx.send(ProgressUpdate::Halted { message: error }).await;
                    return true;
                }
            }
        }
        false
    }

    async fn poll_until_terminal(
        &self,
        offer_id: Uuid,
        tx: &mpsc::Sender<ProgressUpdate>,
        last_phase: &mut Option<PublicPhase>,
    ) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            let view = match self.poll.fetch(offer_id).await {
                Ok(view) => view,
                Err(err) => {
                    debug!(target = "pawnshop.subscriber", offer_id = %offer_id, error = %err, "poll attempt failed");
                    continue;
                }
            };

            // Failed offers also carry the escalated flag, so the failure
            // wording has to win over the generic escalation wording
            if let Some(stage) = view.processing_stage
                && stage == crate::stage::PipelineStage::Failed
            {
                let _ = tx
                    .send(ProgressUpdate::Halted {
                        message: crate::stream::FAILED_MESSAGE.to_string(),
                    })
                    .await;
                return;
            }
            if view.escalated {
                let _ = tx
                    .send(ProgressUpdate::Halted {
                        message: crate::stream::ESCALATED_MESSAGE.to_string(),
                    })
                    .await;
                return;
            }
            if view.status.is_terminal() {
                let _ = tx.send(ProgressUpdate::Complete).await;
                return;
            }

            let Some(phase) = view
                .processing_stage
                .and_then(PublicPhase::for_stage)
            else {
                continue;
            };
            if *last_phase == Some(phase) {
                continue;
            }
            *last_phase = Some(phase);
            let update = ProgressUpdate::Phase {
                phase,
                data: view_stage_data(&view, phase),
                jake_message: match phase {
                    PublicPhase::Deciding => view.jake_script.clone(),
                    _ => None,
                },
            };
            if tx.send(update).await.is_err() {
                return;
            }
        }
    }
}

/// Polling sees only the plain offer view, so enrichment is thinner than on
/// the push channel.
fn view_stage_data(view: &OfferView, phase: PublicPhase) -> StageData {
    match phase {
        PublicPhase::Looking => StageData {
            labels: Some(
                [
                    view.item_category.clone(),
                    view.item_brand.clone(),
                    view.item_model.clone(),
                ]
                .into_iter()
                .flatten()
                .collect(),
            ),
            ..StageData::default()
        },
        PublicPhase::Researching | PublicPhase::Deciding => StageData::default(),
    }
}

/// Concrete poll transport against the public offers endpoint.
pub struct HttpOfferPoll {
    base_url: String,
    http: reqwest::Client,
}

impl HttpOfferPoll {
    pub fn new(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into(),
            http,
        }
    }
}

#[async_trait]
impl OfferPoll for HttpOfferPoll {
    async fn fetch(&self, offer_id: Uuid) -> Result<OfferView, TransportError> {
        let url = format!(
            "{}/api/v1/offers/{offer_id}",
            self.base_url.trim_end_matches('/')
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| TransportError::Request(err.to_string()))?
            .error_for_status()
            .map_err(|err| TransportError::Request(err.to_string()))?;
        response
            .json::<OfferView>()
            .await
            .map_err(|err| TransportError::Request(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OfferStatus;
    use crate::stage::PipelineStage;
    use chrono::Utc;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    struct ScriptedConnection {
        frames: VecDeque<WireMessage>,
    }

    #[async_trait]
    impl PushConnection for ScriptedConnection {
        async fn next_message(&mut self) -> Option<WireMessage> {
            self.frames.pop_front()
        }
    }

    struct ScriptedChannel {
        frames: Mutex<Option<VecDeque<WireMessage>>>,
    }

    impl ScriptedChannel {
        fn with(frames: Vec<WireMessage>) -> Self {
            Self {
                frames: Mutex::new(Some(frames.into())),
            }
        }
    }

    #[async_trait]
    impl PushChannel for ScriptedChannel {
        async fn connect(&self, _offer_id: Uuid) -> Result<Box<dyn PushConnection>, TransportError> {
            match self.frames.lock().await.take() {
                Some(frames) => Ok(Box::new(ScriptedConnection { frames })),
                None => Err(TransportError::Connect("already consumed".into())),
            }
        }
    }

    struct DownChannel;

    #[async_trait]
    impl PushChannel for DownChannel {
        async fn connect(&self, _offer_id: Uuid) -> Result<Box<dyn PushConnection>, TransportError> {
            Err(TransportError::Connect("connection refused".into()))
        }
    }

    struct ScriptedPoll {
        views: Mutex<VecDeque<OfferView>>,
    }

    impl ScriptedPoll {
        fn with(views: Vec<OfferView>) -> Self {
            Self {
                views: Mutex::new(views.into()),
            }
        }

        fn empty() -> Self {
            Self::with(vec![])
        }
    }

    #[async_trait]
    impl OfferPoll for ScriptedPoll {
        async fn fetch(&self, _offer_id: Uuid) -> Result<OfferView, TransportError> {
            let mut views = self.views.lock().await;
            match views.len() {
                0 => Err(TransportError::Request("exhausted".into())),
                // The final view repeats, as a real endpoint would
                1 => Ok(views.front().cloned().unwrap()),
                _ => Ok(views.pop_front().unwrap()),
            }
        }
    }

    fn view(status: OfferStatus, stage: Option<PipelineStage>) -> OfferView {
        let now = Utc::now();
        OfferView {
            id: Uuid::new_v4(),
            status,
            processing_stage: stage,
            offer_amount: 0.0,
            fmv: None,
            item_brand: Some("Seiko".into()),
            item_model: None,
            item_category: None,
            item_condition: None,
            jake_script: None,
            escalated: false,
            expires_at: now + chrono::Duration::hours(24),
            created_at: now,
        }
    }

    fn stage_frame(phase: PublicPhase) -> WireMessage {
        WireMessage::Stage {
            stage: phase,
            data: StageData::default(),
            jake_message: None,
        }
    }

    fn subscriber(push: Arc<dyn PushChannel>, poll: Arc<dyn OfferPoll>) -> ProgressSubscriber {
        ProgressSubscriber::new(
            Some(push),
            poll,
            Duration::from_millis(50),
            Duration::from_millis(5),
        )
    }

    async fn collect(sub: ProgressSubscriber, offer_id: Uuid) -> Vec<ProgressUpdate> {
        let (tx, mut rx) = mpsc::channel(16);
        sub.run(offer_id, tx).await;
        let mut updates = Vec::new();
        while let Ok(update) = rx.try_recv() {
            updates.push(update);
        }
        updates
    }

    #[tokio::test]
    async fn push_stream_delivers_phases_then_complete() {
        let channel = ScriptedChannel::with(vec![
            stage_frame(PublicPhase::Looking),
            stage_frame(PublicPhase::Researching),
            WireMessage::Complete {
                complete: true,
                offer_id: Uuid::new_v4(),
            },
        ]);
        let sub = subscriber(Arc::new(channel), Arc::new(ScriptedPoll::empty()));
        let updates = collect(sub, Uuid::new_v4()).await;
        assert_eq!(updates.len(), 3);
        assert!(matches!(
            updates[0],
            ProgressUpdate::Phase { phase: PublicPhase::Looking, .. }
        ));
        assert_eq!(updates[2], ProgressUpdate::Complete);
    }

    #[tokio::test]
    async fn push_repeats_are_deduplicated() {
        let channel = ScriptedChannel::with(vec![
            stage_frame(PublicPhase::Looking),
            stage_frame(PublicPhase::Looking),
            WireMessage::Complete {
                complete: true,
                offer_id: Uuid::new_v4(),
            },
        ]);
        let sub = subscriber(Arc::new(channel), Arc::new(ScriptedPoll::empty()));
        let updates = collect(sub, Uuid::new_v4()).await;
        assert_eq!(updates.len(), 2);
    }

    #[tokio::test]
    async fn connect_failure_falls_back_to_polling() {
        let poll = ScriptedPoll::with(vec![
            view(OfferStatus::Processing, Some(PipelineStage::Vision)),
            view(OfferStatus::Ready, None),
        ]);
        let sub = subscriber(Arc::new(DownChannel), Arc::new(poll));
        let updates = collect(sub, Uuid::new_v4()).await;
        assert!(matches!(
            updates[0],
            ProgressUpdate::Phase { phase: PublicPhase::Looking, .. }
        ));
        assert_eq!(updates.last(), Some(&ProgressUpdate::Complete));
    }

    #[tokio::test]
    async fn dedup_carries_across_the_transport_switch() {
        // Push announces "looking" then dies without a terminal frame
        let channel = ScriptedChannel::with(vec![stage_frame(PublicPhase::Looking)]);
        let poll = ScriptedPoll::with(vec![
            view(OfferStatus::Processing, Some(PipelineStage::Vision)),
            view(OfferStatus::Processing, Some(PipelineStage::Marketplace)),
            view(OfferStatus::Ready, None),
        ]);
        let sub = subscriber(Arc::new(channel), Arc::new(poll));
        let updates = collect(sub, Uuid::new_v4()).await;

        let looking_count = updates
            .iter()
            .filter(|u| matches!(u, ProgressUpdate::Phase { phase: PublicPhase::Looking, .. }))
            .count();
        assert_eq!(looking_count, 1, "phase already seen on push must not repeat");
        assert!(updates
            .iter()
            .any(|u| matches!(u, ProgressUpdate::Phase { phase: PublicPhase::Researching, .. })));
        assert_eq!(updates.last(), Some(&ProgressUpdate::Complete));
    }

    #[tokio::test]
    async fn escalated_offer_halts_the_poller() {
        let mut halted = view(OfferStatus::Processing, Some(PipelineStage::Escalated));
        halted.escalated = true;
        let poll = ScriptedPoll::with(vec![halted]);
        let sub = subscriber(Arc::new(DownChannel), Arc::new(poll));
        let updates = collect(sub, Uuid::new_v4()).await;
        assert!(matches!(updates.last(), Some(ProgressUpdate::Halted { .. })));
    }

    #[tokio::test]
    async fn failed_offer_reports_failure_not_escalation() {
        // A pipeline failure sets both the failed stage and the escalated
        // flag; the consumer must hear the failure wording
        let mut failed = view(OfferStatus::Processing, Some(PipelineStage::Failed));
        failed.escalated = true;
        let poll = ScriptedPoll::with(vec![failed]);
        let sub = subscriber(Arc::new(DownChannel), Arc::new(poll));
        let updates = collect(sub, Uuid::new_v4()).await;
        assert_eq!(
            updates,
            vec![ProgressUpdate::Halted {
                message: crate::stream::FAILED_MESSAGE.into()
            }]
        );
    }

    #[tokio::test]
    async fn no_push_configured_goes_straight_to_polling() {
        let poll = ScriptedPoll::with(vec![view(OfferStatus::Ready, None)]);
        let sub = ProgressSubscriber::new(
            None,
            Arc::new(poll),
            Duration::from_millis(50),
            Duration::from_millis(5),
        );
        let updates = collect(sub, Uuid::new_v4()).await;
        assert_eq!(updates, vec![ProgressUpdate::Complete]);
    }

    #[tokio::test]
    async fn push_error_frame_halts() {
        let channel = ScriptedChannel::with(vec![WireMessage::Error {
            error: "Stream timed out".into(),
            reason: Some("timeout".into()),
        }]);
        let sub = subscriber(Arc::new(channel), Arc::new(ScriptedPoll::empty()));
        let updates = collect(sub, Uuid::new_v4()).await;
        assert_eq!(
            updates,
            vec![ProgressUpdate::Halted {
                message: "Stream timed out".into()
            }]
        );
    }
}
