//! Dashboard broadcast worker.
//!
//! Owns the outbound WebSocket side: accepts dashboard connections and
//! fans the position-store event bus out to every client as JSON
//! (`trade_update` / `price_update`). A slow client lags and skips
//! events rather than applying backpressure to the engine.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::domain::events::EngineEvent;
use crate::store::PositionStore;

pub struct Broadcaster {
    positions: Arc<PositionStore>,
    bind_addr: String,
}

impl Broadcaster {
    pub fn new(positions: Arc<PositionStore>, bind_addr: String) -> Arc<Self> {
        Arc::new(Self {
            positions,
            bind_addr,
        })
    }

    /// Accept dashboard clients until the stop signal flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let listener = match TcpListener::bind(&self.bind_addr).await {
            Ok(listener) => listener,
            Err(err) => {
                warn!(addr = %self.bind_addr, error = %err, "dashboard bind failed");
                return;
            }
        };
        info!(addr = %self.bind_addr, "dashboard broadcast listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "dashboard client connected");
                        let events = self.positions.subscribe();
                        let client_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(err) = serve_client(stream, events, client_shutdown).await {
                                debug!(%peer, error = %err, "dashboard client dropped");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "dashboard accept failed"),
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("dashboard broadcast stopped");
    }
}

async fn serve_client(
    stream: tokio::net::TcpStream,
    mut events: broadcast::Receiver<EngineEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let mut ws = tokio_tungstenite::accept_async(stream).await?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let payload = match serde_json::to_string(&event) {
                        Ok(payload) => payload,
                        Err(err) => {
                            warn!(error = %err, "event serialization failed");
                            continue;
                        }
                    };
                    ws.send(Message::Text(payload)).await?;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "dashboard client lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            // Drain client frames so pings and closes are handled.
            incoming = ws.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err),
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = ws.close(None).await;
                    break;
                }
            }
        }
    }
    Ok(())
}
