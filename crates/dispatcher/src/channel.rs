//! Bidirectional payload channels
//!
//! Every request reaches the dispatcher with a [`Channel`] to its counterpart.
//! A worker's join channel is kept for the whole shift and carries its orders.

use async_trait::async_trait;
use expo_common::error::{ExpoError, Result};
use expo_proto::Payload;
use tokio::sync::mpsc;

/// A receive/send pair bound to one request
#[async_trait]
pub trait Channel: Send {
    /// Wait for the next payload addressed to this request
    ///
    /// Returns [`ExpoError::ChannelClosed`] once the peer is gone.
    async fn receive(&mut self) -> Result<Payload>;

    /// Deliver a payload to the counterpart
    async fn send(&mut self, payload: Payload) -> Result<()>;

    /// Resolve once the counterpart has gone away
    ///
    /// Must be cancel-safe: the relay races it against the worker's response.
    async fn closed(&mut self);
}

/// In-process channel endpoint backed by tokio mpsc queues
#[derive(Debug)]
pub struct MemoryChannel {
    tx: mpsc::UnboundedSender<Payload>,
    rx: mpsc::UnboundedReceiver<Payload>,
}

impl MemoryChannel {
    /// Create two connected endpoints
    ///
    /// What one endpoint sends the other receives. Dropping an endpoint closes
    /// its peer.
    pub fn pair() -> (Self, Self) {
        let (left_tx, right_rx) = mpsc::unbounded_channel();
        let (right_tx, left_rx) = mpsc::unbounded_channel();

        (
            Self {
                tx: left_tx,
                rx: left_rx,
            },
            Self {
                tx: right_tx,
                rx: right_rx,
            },
        )
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn receive(&mut self) -> Result<Payload> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| ExpoError::channel_closed("peer endpoint dropped"))
    }

    async fn send(&mut self, payload: Payload) -> Result<()> {
        self.tx
            .send(payload)
            .map_err(|_| ExpoError::channel_closed("peer endpoint dropped"))
    }

    async fn closed(&mut self) {
        self.tx.closed().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_pair_is_crossed() {
        let (mut left, mut right) = MemoryChannel::pair();

        left.send(json!("ping")).await.unwrap();
        right.send(json!("pong")).await.unwrap();

        assert_eq!(right.receive().await.unwrap(), json!("ping"));
        assert_eq!(left.receive().await.unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn test_dropped_peer_closes_channel() {
        let (mut left, right) = MemoryChannel::pair();
        drop(right);

        assert!(matches!(left.receive().await, Err(ExpoError::ChannelClosed(_))));
        assert!(matches!(left.send(json!(1)).await, Err(ExpoError::ChannelClosed(_))));
    }

    #[tokio::test]
    async fn test_closed_resolves_when_peer_drops() {
        let (mut left, right) = MemoryChannel::pair();

        let pending = tokio::time::timeout(std::time::Duration::from_millis(10), left.closed()).await;
        assert!(pending.is_err());

        drop(right);
        left.closed().await;
    }
}
