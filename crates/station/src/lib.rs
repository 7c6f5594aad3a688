//! Expo Station
//!
//! Reference worker. A station clocks in with the dispatcher over the TCP
//! transport, cooks the orders it is handed one at a time, and clocks out on
//! shutdown.

use expo_common::error::{ExpoError, Result};
use expo_common::StationConfig;
use expo_dispatcher::{Channel, LineChannel};
use expo_proto::{Payload, RequestKind, Speciality, WorkerId};
use serde_json::json;
use tracing::{debug, info};

/// A worker bound to one dispatcher
#[derive(Debug, Clone)]
pub struct Station {
    config: StationConfig,
}

impl Station {
    pub fn new(config: StationConfig) -> Self {
        Self { config }
    }

    pub fn id(&self) -> WorkerId {
        WorkerId::new(self.config.worker_id.clone())
    }

    pub fn join_scope(&self) -> Payload {
        RequestKind::Join {
            id: self.id(),
            speciality: self
                .config
                .specialities
                .iter()
                .map(|tag| Speciality::new(tag.clone()))
                .collect(),
        }
        .to_scope()
    }

    pub fn leave_scope(&self) -> Payload {
        RequestKind::Leave { id: self.id() }.to_scope()
    }

    /// Open the shift connection and announce the station
    pub async fn clock_in(&self) -> Result<LineChannel> {
        let mut channel = LineChannel::connect(&self.config.dispatcher_endpoint).await?;
        channel.send(self.join_scope()).await?;
        info!(
            "Station {} on duty at {} for {:?}",
            self.config.worker_id, self.config.dispatcher_endpoint, self.config.specialities
        );
        Ok(channel)
    }

    /// Tell the dispatcher the station is going off duty
    pub async fn clock_out(&self) -> Result<()> {
        let mut channel = LineChannel::connect(&self.config.dispatcher_endpoint).await?;
        channel.send(self.leave_scope()).await?;
        info!("Station {} off duty", self.config.worker_id);
        Ok(())
    }

    /// Prepare one order
    ///
    /// String orders get the configured prefix; anything else is wrapped.
    pub fn cook(&self, order: &Payload) -> Payload {
        match order {
            Payload::String(dish) => json!(format!("{}{}", self.config.response_prefix, dish)),
            other => json!({
                "station": self.config.worker_id,
                "cooked": other,
            }),
        }
    }

    /// Serve orders until the dispatcher closes the shift connection
    ///
    /// Returns the number of orders served.
    pub async fn work<C: Channel + ?Sized>(&self, channel: &mut C) -> Result<u64> {
        let mut served = 0u64;

        loop {
            let order = match channel.receive().await {
                Ok(order) => order,
                Err(ExpoError::ChannelClosed(_)) => {
                    info!("Shift over for {} after {} orders", self.config.worker_id, served);
                    return Ok(served);
                }
                Err(e) => return Err(e),
            };

            debug!("Cooking {}", order);
            channel.send(self.cook(&order)).await?;
            served += 1;
        }
    }
}
