//! Inbound social-signal event stream port.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::events::StreamEvent;
use crate::domain::ActorId;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream connection failed: {0}")]
    ConnectionFailed(String),
    #[error("stream protocol error: {0}")]
    Protocol(String),
    #[error("stream message parse error: {0}")]
    Parse(String),
    #[error("stream channel closed")]
    ChannelClosed,
}

/// Source of mindmap and actor-trade events.
///
/// `subscribe` spawns whatever background machinery the transport needs
/// (reconnects included) and hands back a channel of decoded events. An
/// empty actor list subscribes to the full firehose.
#[async_trait]
pub trait EventStream: Send + Sync {
    async fn subscribe(
        &self,
        actors: Vec<ActorId>,
    ) -> Result<mpsc::Receiver<StreamEvent>, StreamError>;
}
