//! Real-time job offer channel: a reconnecting push subscription with a
//! polling fallback. Push frames are wake-up signals only; the offer list
//! is always refetched over REST. Typed events fan out to consumers through
//! an owned publish/subscribe bus.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::client::SurveyApi;
use crate::error::{TerraError, TerraResult};
use crate::models::{AgentEvent, Offer, PushFrame};

/// Delay before the single reconnect attempt after a disconnect.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);
/// Fallback offer poll interval while the push channel is down.
pub const POLL_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

// ===== EVENT BUS =====

/// Owned publish/subscribe fan-out for typed agent events. Consumers hold
/// their own receiver; a consumer that lags simply misses old events.
#[derive(Debug, Clone)]
pub struct AgentEventBus {
    sender: broadcast::Sender<AgentEvent>,
}

impl AgentEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: AgentEvent) {
        // No receivers is normal (nobody on the screen that cares yet).
        match self.sender.send(event) {
            Ok(receivers) => debug!(receivers, "agent event published"),
            Err(_) => debug!("agent event dropped, no subscribers"),
        }
    }
}

impl Default for AgentEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

// ===== PUSH TRANSPORT =====

/// One live push connection. Dropping it closes the underlying stream; the
/// frame stream ending means the connection is gone.
pub struct PushConnection {
    frames: mpsc::Receiver<PushFrame>,
}

impl PushConnection {
    pub fn new(frames: mpsc::Receiver<PushFrame>) -> Self {
        Self { frames }
    }

    pub async fn next(&mut self) -> Option<PushFrame> {
        self.frames.recv().await
    }
}

/// How the channel reaches the push endpoint. A trait seam so tests can
/// script connections without a server.
#[async_trait]
pub trait PushTransport: Send + Sync + 'static {
    async fn connect(&self) -> TerraResult<PushConnection>;
}

/// Production transport: a websocket to the service's `/ws` endpoint,
/// authenticated by token query parameter.
pub struct WsTransport {
    url: Url,
    token: String,
}

impl WsTransport {
    pub fn new(url: Url, token: impl Into<String>) -> Self {
        Self {
            url,
            token: token.into(),
        }
    }
}

#[async_trait]
impl PushTransport for WsTransport {
    async fn connect(&self) -> TerraResult<PushConnection> {
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("token", &self.token);

        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TerraError::Channel(e.to_string()))?;

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let (_write, mut read) = stream.split();
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<PushFrame>(&text) {
                        Ok(frame) => {
                            if tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => debug!("ignoring malformed push frame"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        Ok(PushConnection::new(rx))
    }
}

// ===== CHANNEL =====

#[derive(Debug, Clone, Copy)]
pub struct OfferChannelConfig {
    pub reconnect_delay: Duration,
    pub poll_interval: Duration,
}

impl Default for OfferChannelConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: RECONNECT_DELAY,
            poll_interval: POLL_INTERVAL,
        }
    }
}

enum ChannelCommand {
    Refresh,
    Foregrounded,
    RemoveOffer(String),
    Shutdown,
}

pub struct OfferChannel<T: PushTransport> {
    api: Arc<dyn SurveyApi>,
    transport: T,
    bus: AgentEventBus,
    config: OfferChannelConfig,
}

/// Control handle for a running channel. Dropping the handle (or calling
/// [`OfferChannelHandle::shutdown`]) tears the channel down without
/// re-triggering the disconnect path.
pub struct OfferChannelHandle {
    cmds: mpsc::Sender<ChannelCommand>,
    offers_rx: watch::Receiver<Vec<Offer>>,
    state_rx: watch::Receiver<ChannelState>,
    task: tokio::task::JoinHandle<()>,
}

impl OfferChannelHandle {
    pub fn offers(&self) -> Vec<Offer> {
        self.offers_rx.borrow().clone()
    }

    pub fn offers_watch(&self) -> watch::Receiver<Vec<Offer>> {
        self.offers_rx.clone()
    }

    pub fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ChannelState> {
        self.state_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Requests an immediate offer refetch.
    pub async fn refresh(&self) {
        let _ = self.cmds.send(ChannelCommand::Refresh).await;
    }

    /// The app came to the foreground: reconnect if down, refetch either way.
    pub async fn foregrounded(&self) {
        let _ = self.cmds.send(ChannelCommand::Foregrounded).await;
    }

    /// Drops one offer from the local list (accepted or declined).
    pub async fn remove_offer(&self, offer_id: &str) {
        let _ = self
            .cmds
            .send(ChannelCommand::RemoveOffer(offer_id.to_string()))
            .await;
    }

    /// Intentional teardown: cancels the reconnect and poll timers and
    /// closes the active connection.
    pub async fn shutdown(self) {
        if self.cmds.send(ChannelCommand::Shutdown).await.is_err() {
            self.task.abort();
        }
        let _ = self.task.await;
    }
}

impl<T: PushTransport> OfferChannel<T> {
    pub fn new(api: Arc<dyn SurveyApi>, transport: T, bus: AgentEventBus) -> Self {
        Self::with_config(api, transport, bus, OfferChannelConfig::default())
    }

    pub fn with_config(
        api: Arc<dyn SurveyApi>,
        transport: T,
        bus: AgentEventBus,
        config: OfferChannelConfig,
    ) -> Self {
        Self {
            api,
            transport,
            bus,
            config,
        }
    }

    /// Starts the channel actor and returns its control handle.
    pub fn spawn(self) -> OfferChannelHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (offers_tx, offers_rx) = watch::channel(Vec::new());
        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);

        let task = tokio::spawn(self.run(cmd_rx, offers_tx, state_tx));

        OfferChannelHandle {
            cmds: cmd_tx,
            offers_rx,
            state_rx,
            task,
        }
    }

    async fn run(
        self,
        mut cmds: mpsc::Receiver<ChannelCommand>,
        offers_tx: watch::Sender<Vec<Offer>>,
        state_tx: watch::Sender<ChannelState>,
    ) {
        // Initial load happens over REST regardless of push availability.
        self.refetch(&offers_tx).await;

        // Fallback poll timer. Lives across failed reconnect attempts so
        // repeated connect failures cannot starve polling; only a successful
        // connect cancels it.
        let mut poll: Option<tokio::time::Interval> = None;

        'reconnect: loop {
            let _ = state_tx.send(ChannelState::Connecting);

            match self.transport.connect().await {
                Ok(mut conn) => {
                    info!("push channel connected");
                    let _ = state_tx.send(ChannelState::Connected);
                    poll = None;

                    // Connected: no polling, just frames and commands.
                    loop {
                        tokio::select! {
                            frame = conn.next() => match frame {
                                Some(frame) => self.handle_frame(frame, &offers_tx).await,
                                None => {
                                    warn!("push connection closed");
                                    break;
                                }
                            },
                            cmd = cmds.recv() => match cmd {
                                Some(ChannelCommand::Refresh)
                                | Some(ChannelCommand::Foregrounded) => {
                                    self.refetch(&offers_tx).await;
                                }
                                Some(ChannelCommand::RemoveOffer(id)) => {
                                    offers_tx.send_modify(|offers| {
                                        offers.retain(|o| o.id != id);
                                    });
                                }
                                Some(ChannelCommand::Shutdown) | None => {
                                    let _ = state_tx.send(ChannelState::Disconnected);
                                    return;
                                }
                            },
                        }
                    }
                }
                Err(e) => debug!("push connect failed: {e}"),
            }

            // Disconnected: fall back to polling and schedule one reconnect.
            let _ = state_tx.send(ChannelState::Disconnected);

            let reconnect = tokio::time::sleep(self.config.reconnect_delay);
            tokio::pin!(reconnect);
            let poll = poll.get_or_insert_with(|| {
                tokio::time::interval_at(
                    tokio::time::Instant::now() + self.config.poll_interval,
                    self.config.poll_interval,
                )
            });

            loop {
                tokio::select! {
                    _ = &mut reconnect => continue 'reconnect,
                    _ = poll.tick() => self.refetch(&offers_tx).await,
                    cmd = cmds.recv() => match cmd {
                        Some(ChannelCommand::Refresh) => self.refetch(&offers_tx).await,
                        Some(ChannelCommand::Foregrounded) => {
                            self.refetch(&offers_tx).await;
                            continue 'reconnect;
                        }
                        Some(ChannelCommand::RemoveOffer(id)) => {
                            offers_tx.send_modify(|offers| {
                                offers.retain(|o| o.id != id);
                            });
                        }
                        Some(ChannelCommand::Shutdown) | None => return,
                    },
                }
            }
        }
    }

    async fn handle_frame(&self, frame: PushFrame, offers_tx: &watch::Sender<Vec<Offer>>) {
        match frame {
            // The ping names an offer but is never trusted as offer data.
            PushFrame::Offer(ping) => {
                debug!(offer_id = %ping.offer_id, "offer ping received");
                self.refetch(offers_tx).await;
            }
            PushFrame::Event(event) => {
                let refetch = matches!(
                    event.kind.as_str(),
                    "job.accepted" | "job.survey_submitted"
                );
                self.bus.publish(event);
                if refetch {
                    self.refetch(offers_tx).await;
                }
            }
        }
    }

    async fn refetch(&self, offers_tx: &watch::Sender<Vec<Offer>>) {
        match self.api.fetch_offers().await {
            Ok(offers) => {
                debug!(count = offers.len(), "offer list refreshed");
                let _ = offers_tx.send(offers);
            }
            Err(e) => debug!("offer refetch failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_frame_shapes() {
        let frame: PushFrame = serde_json::from_str(
            r#"{"offer_id":"o1","job_id":"j1","expires_at":"2026-08-06T10:00:00Z"}"#,
        )
        .unwrap();
        assert!(matches!(frame, PushFrame::Offer(ref p) if p.offer_id == "o1"));

        let frame: PushFrame =
            serde_json::from_str(r#"{"type":"job.accepted","data":{"job_id":"j1"}}"#).unwrap();
        match frame {
            PushFrame::Event(event) => {
                assert_eq!(event.kind, "job.accepted");
                assert_eq!(event.data.get("job_id").map(String::as_str), Some("j1"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        assert!(serde_json::from_str::<PushFrame>(r#"{"noise":true}"#).is_err());
    }

    #[tokio::test]
    async fn test_event_bus_fans_out_to_all_subscribers() {
        let bus = AgentEventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(AgentEvent {
            kind: "job.arrived".to_string(),
            data: Default::default(),
        });

        assert_eq!(a.recv().await.unwrap().kind, "job.arrived");
        assert_eq!(b.recv().await.unwrap().kind, "job.arrived");
    }

    #[test]
    fn test_config_defaults_match_constants() {
        let config = OfferChannelConfig::default();
        assert_eq!(config.reconnect_delay, RECONNECT_DELAY);
        assert_eq!(config.poll_interval, POLL_INTERVAL);
    }
}
