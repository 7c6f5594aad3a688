//! Order relay between a client and the selected worker
//!
//! One relay moves exactly one order: client payload to the worker, worker
//! response back to the client. The worker's channel is held exclusively for
//! the whole exchange so concurrent orders never interleave on it.

use crate::channel::Channel;
use crate::registry::WorkerRecord;
use expo_common::error::{ExpoError, RelaySide, Result};
use expo_proto::Payload;
use std::time::Duration;
use tracing::{debug, debug_span, Instrument};
use uuid::Uuid;

/// Arms while an order is with the worker; dropping it armed leaves the
/// worker flagged as out of step.
struct AwaitingResponse<'a> {
    worker: &'a WorkerRecord,
    armed: bool,
}

impl<'a> AwaitingResponse<'a> {
    fn arm(worker: &'a WorkerRecord) -> Self {
        Self {
            worker,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AwaitingResponse<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.worker.mark_desynced();
        }
    }
}

/// Performs the two-hop exchange for one order
#[derive(Debug, Clone, Default)]
pub struct OrderRelay {
    timeout: Option<Duration>,
}

impl OrderRelay {
    /// Create a relay; `timeout` bounds each full exchange
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    /// Relay one order and return the response the client received
    ///
    /// Any failure aborts the exchange and releases the worker's channel. A
    /// client that hangs up while the worker is cooking aborts it at once. A
    /// worker that was handed the order but never answered is flagged out of
    /// step so it is not reused.
    pub async fn relay(&self, client: &mut dyn Channel, worker: &WorkerRecord) -> Result<Payload> {
        let order_id = Uuid::new_v4();
        let span = debug_span!("relay", %order_id, worker = %worker.id());
        let exchange = Self::exchange(client, worker).instrument(span);

        let Some(limit) = self.timeout else {
            return exchange.await;
        };

        match tokio::time::timeout(limit, exchange).await {
            Ok(result) => result,
            Err(_) if worker.is_desynced() => Err(ExpoError::relay(
                RelaySide::Worker,
                format!("no response to order {} within {:?}", order_id, limit),
            )),
            Err(_) => Err(ExpoError::timeout(format!(
                "order {} not completed within {:?}",
                order_id, limit
            ))),
        }
    }

    async fn exchange(client: &mut dyn Channel, worker: &WorkerRecord) -> Result<Payload> {
        let mut channel = worker.lock_channel().await;
        if worker.is_desynced() {
            return Err(ExpoError::relay(
                RelaySide::Worker,
                "channel still owes a response to an abandoned order",
            ));
        }

        let order = client
            .receive()
            .await
            .map_err(|e| ExpoError::relay(RelaySide::Client, e))?;
        debug!("Order received from client");

        let awaiting = AwaitingResponse::arm(worker);
        channel
            .send(order)
            .await
            .map_err(|e| ExpoError::relay(RelaySide::Worker, e))?;

        let response = tokio::select! {
            biased;
            response = channel.receive() => {
                response.map_err(|e| ExpoError::relay(RelaySide::Worker, e))?
            }
            _ = client.closed() => {
                return Err(ExpoError::relay(
                    RelaySide::Client,
                    "client hung up while the order was with the worker",
                ));
            }
        };
        awaiting.disarm();
        debug!("Response received from worker");

        client
            .send(response.clone())
            .await
            .map_err(|e| ExpoError::relay(RelaySide::Client, e))?;

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::registry::WorkerRegistry;
    use expo_proto::{Speciality, WorkerId};
    use serde_json::json;
    use std::sync::Arc;

    fn worker(registry: &WorkerRegistry, id: &str) -> (Arc<WorkerRecord>, MemoryChannel) {
        let (dispatcher_side, worker_side) = MemoryChannel::pair();
        registry
            .register(
                WorkerId::from(id),
                vec![Speciality::from("grill")],
                Box::new(dispatcher_side),
            )
            .unwrap();
        let record = registry.select(&Speciality::from("grill")).unwrap();
        (record, worker_side)
    }

    #[tokio::test]
    async fn test_relay_round_trip() {
        let registry = WorkerRegistry::new(64);
        let (record, mut station) = worker(&registry, "1");
        let (mut client_side, mut client) = MemoryChannel::pair();

        let cook = tokio::spawn(async move {
            let order = station.receive().await.unwrap();
            assert_eq!(order, json!("burger"));
            station.send(json!("cooked-burger")).await.unwrap();
        });

        client.send(json!("burger")).await.unwrap();
        let response = OrderRelay::default()
            .relay(&mut client_side, &record)
            .await
            .unwrap();

        assert_eq!(response, json!("cooked-burger"));
        assert_eq!(client.receive().await.unwrap(), json!("cooked-burger"));
        cook.await.unwrap();
        assert!(!record.is_desynced());
    }

    #[tokio::test]
    async fn test_client_hangup_leaves_worker_usable() {
        let registry = WorkerRegistry::new(64);
        let (record, _station) = worker(&registry, "1");
        let (mut client_side, client) = MemoryChannel::pair();
        drop(client);

        let err = OrderRelay::default()
            .relay(&mut client_side, &record)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ExpoError::RelayFailure {
                side: RelaySide::Client,
                ..
            }
        ));
        assert!(!record.is_desynced());
        // The channel guard was released.
        assert!(!record.is_busy());
    }

    #[tokio::test]
    async fn test_worker_hangup_is_worker_failure() {
        let registry = WorkerRegistry::new(64);
        let (record, station) = worker(&registry, "1");
        drop(station);
        let (mut client_side, mut client) = MemoryChannel::pair();
        client.send(json!("burger")).await.unwrap();

        let err = OrderRelay::default()
            .relay(&mut client_side, &record)
            .await
            .unwrap_err();

        assert!(err.is_worker_failure());
        assert!(!record.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_and_flags_worker() {
        let registry = WorkerRegistry::new(64);
        let (record, mut station) = worker(&registry, "1");
        let (mut client_side, mut client) = MemoryChannel::pair();
        client.send(json!("burger")).await.unwrap();

        let relay = OrderRelay::new(Some(Duration::from_millis(50)));
        let err = relay.relay(&mut client_side, &record).await.unwrap_err();

        // The station got the order but never answered.
        assert_eq!(station.receive().await.unwrap(), json!("burger"));
        assert!(err.is_worker_failure());
        assert!(record.is_desynced());
        assert!(!record.is_busy());
    }

    #[tokio::test]
    async fn test_client_hangup_while_cooking_flags_worker() {
        let registry = WorkerRegistry::new(64);
        let (record, mut station) = worker(&registry, "1");
        let (mut client_side, mut client) = MemoryChannel::pair();
        client.send(json!("burger")).await.unwrap();

        let relay = tokio::spawn({
            let record = record.clone();
            async move { OrderRelay::default().relay(&mut client_side, &record).await }
        });

        // The station holds on to the order and the client walks away.
        assert_eq!(station.receive().await.unwrap(), json!("burger"));
        drop(client);

        let err = relay.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ExpoError::RelayFailure {
                side: RelaySide::Client,
                ..
            }
        ));
        assert!(record.is_desynced());
        assert!(!record.is_busy());

        // The late answer can never reach the next client.
        assert!(matches!(
            registry.select(&Speciality::from("grill")),
            Err(ExpoError::NoAvailableWorker(_))
        ));
        assert!(!registry.is_active(&WorkerId::from("1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_relay_refuses_abandoned_worker() {
        let registry = WorkerRegistry::new(64);
        let (record, _station) = worker(&registry, "1");

        let (mut first_side, mut first_client) = MemoryChannel::pair();
        first_client.send(json!("burger")).await.unwrap();
        let first = tokio::spawn({
            let record = record.clone();
            async move {
                OrderRelay::new(Some(Duration::from_millis(50)))
                    .relay(&mut first_side, &record)
                    .await
            }
        });
        while !record.is_busy() {
            tokio::task::yield_now().await;
        }

        let (mut second_side, mut second_client) = MemoryChannel::pair();
        second_client.send(json!("steak")).await.unwrap();
        let second = tokio::spawn({
            let record = record.clone();
            async move { OrderRelay::default().relay(&mut second_side, &record).await }
        });

        assert!(first.await.unwrap().unwrap_err().is_worker_failure());
        let err = second.await.unwrap().unwrap_err();
        assert!(err.is_worker_failure());
        assert!(!record.is_busy());

        assert!(matches!(
            registry.select(&Speciality::from("grill")),
            Err(ExpoError::NoAvailableWorker(_))
        ));
        assert!(!registry.is_active(&WorkerId::from("1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_waiting_for_client_is_plain_timeout() {
        let registry = WorkerRegistry::new(64);
        let (record, _station) = worker(&registry, "1");
        let (mut client_side, _client) = MemoryChannel::pair();

        let relay = OrderRelay::new(Some(Duration::from_millis(50)));
        let err = relay.relay(&mut client_side, &record).await.unwrap_err();

        assert!(matches!(err, ExpoError::Timeout(_)));
        assert!(!record.is_desynced());
        assert!(!record.is_busy());
    }
}
