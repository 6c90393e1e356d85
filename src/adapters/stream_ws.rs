//! WebSocket event-stream adapter.
//!
//! Connects to the engine API's streaming endpoint, subscribes to
//! mindmap updates and (optionally actor-scoped) trade events, and
//! decodes frames into [`StreamEvent`]s. Reconnects forever with
//! exponential backoff and jitter; the consumer only ever sees the
//! channel.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::domain::events::{ActorTradeEvent, MindmapUpdateEvent, StreamEvent};
use crate::domain::ActorId;
use crate::ports::stream::{EventStream, StreamError};
use crate::util::Backoff;

/// Reconnect backoff: 1 s base, 30 s cap, effectively unbounded.
const RECONNECT_BACKOFF: Backoff =
    Backoff::new(Duration::from_secs(1), Duration::from_secs(30), u32::MAX);
/// Keepalive ping interval.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Oversized frames are dropped before parsing.
const MAX_MESSAGE_SIZE: usize = 1_048_576;

#[derive(Debug, Clone)]
pub struct WsStreamConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub channel_buffer: usize,
    pub max_message_size: usize,
}

impl WsStreamConfig {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            url: url.into(),
            api_key,
            channel_buffer: 1000,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

/// Subscription frames sent after connecting.
#[derive(Debug, Serialize)]
struct SubscribeMessage {
    method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    keys: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "apiKey")]
    api_key: Option<String>,
}

/// Inbound frame shapes; variants are structurally distinct so untagged
/// decoding is unambiguous.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawStreamMessage {
    ActorTrade(ActorTradeEvent),
    Mindmap(MindmapUpdateEvent),
    Confirmation { message: String },
    ServerError { error: String },
}

/// Decode one raw frame. `Ok(None)` means a valid but non-event frame
/// (ack, server error, empty keepalive text).
pub fn parse_frame(raw: &str, max_size: usize) -> Result<Option<StreamEvent>, StreamError> {
    if raw.len() > max_size {
        return Err(StreamError::Protocol(format!(
            "frame too large: {} bytes",
            raw.len()
        )));
    }
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    match serde_json::from_str::<RawStreamMessage>(trimmed) {
        Ok(RawStreamMessage::ActorTrade(event)) => Ok(Some(StreamEvent::ActorTrade(event))),
        Ok(RawStreamMessage::Mindmap(event)) => Ok(Some(StreamEvent::Mindmap(event))),
        Ok(RawStreamMessage::Confirmation { message }) => {
            debug!(%message, "stream subscription confirmed");
            Ok(None)
        }
        Ok(RawStreamMessage::ServerError { error }) => {
            warn!(%error, "stream server error");
            Ok(None)
        }
        Err(err) => Err(StreamError::Parse(format!(
            "line {}, column {}: {}",
            err.line(),
            err.column(),
            err.classify_message()
        ))),
    }
}

trait ClassifyExt {
    fn classify_message(&self) -> String;
}

impl ClassifyExt for serde_json::Error {
    fn classify_message(&self) -> String {
        format!("{:?}", self.classify())
    }
}

pub struct WsEventStream {
    config: WsStreamConfig,
}

impl WsEventStream {
    pub fn new(config: WsStreamConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl EventStream for WsEventStream {
    async fn subscribe(
        &self,
        actors: Vec<ActorId>,
    ) -> Result<mpsc::Receiver<StreamEvent>, StreamError> {
        let (tx, rx) = mpsc::channel(self.config.channel_buffer);
        let config = self.config.clone();
        tokio::spawn(run_loop(config, actors, tx));
        Ok(rx)
    }
}

/// Connect/subscribe/read until the consumer goes away; reconnect on any
/// transport failure.
async fn run_loop(
    config: WsStreamConfig,
    actors: Vec<ActorId>,
    tx: mpsc::Sender<StreamEvent>,
) {
    let mut attempt: u32 = 0;
    loop {
        match connect_and_read(&config, &actors, &tx).await {
            Ok(()) => {
                // Consumer dropped the channel; nothing left to do.
                info!("event stream consumer gone, stopping");
                return;
            }
            Err(err) => {
                warn!(error = %err, "event stream disconnected");
            }
        }
        if tx.is_closed() {
            return;
        }

        let delay = RECONNECT_BACKOFF.delay(attempt.min(8));
        attempt = attempt.saturating_add(1);
        warn!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::time::sleep(delay).await;
    }
}

async fn connect_and_read(
    config: &WsStreamConfig,
    actors: &[ActorId],
    tx: &mpsc::Sender<StreamEvent>,
) -> Result<(), StreamError> {
    let (mut ws, _) = connect_async(&config.url)
        .await
        .map_err(|e| StreamError::ConnectionFailed(e.to_string()))?;
    info!(url = %config.url, "event stream connected");

    // Mindmap updates always; trade events scoped to the actor list when
    // one was given.
    let subscriptions = [
        SubscribeMessage {
            method: "subscribeMindmapUpdates",
            keys: None,
            api_key: config.api_key.clone(),
        },
        SubscribeMessage {
            method: "subscribeActorTrades",
            keys: if actors.is_empty() {
                None
            } else {
                Some(actors.to_vec())
            },
            api_key: config.api_key.clone(),
        },
    ];
    for subscription in &subscriptions {
        let frame = serde_json::to_string(subscription)
            .map_err(|e| StreamError::Protocol(e.to_string()))?;
        ws.send(Message::Text(frame))
            .await
            .map_err(|e| StreamError::ConnectionFailed(e.to_string()))?;
    }

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(raw))) => {
                    match parse_frame(&raw, config.max_message_size) {
                        Ok(Some(event)) => {
                            if tx.send(event).await.is_err() {
                                return Ok(());
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            let preview: String = raw.chars().take(200).collect();
                            warn!(error = %err, preview = %preview, "dropping bad frame");
                        }
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    ws.send(Message::Pong(payload))
                        .await
                        .map_err(|e| StreamError::ConnectionFailed(e.to_string()))?;
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(StreamError::ConnectionFailed("server closed".into()));
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    return Err(StreamError::ConnectionFailed(err.to_string()));
                }
            },
            _ = ping.tick() => {
                ws.send(Message::Ping(Vec::new()))
                    .await
                    .map_err(|e| StreamError::ConnectionFailed(e.to_string()))?;
            }
        }
    }
}
