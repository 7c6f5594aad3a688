//! Request dispatch
//!
//! Classifies each inbound request once at the boundary and either changes
//! duty membership or routes an order to the next worker in rotation.

use crate::channel::Channel;
use crate::registry::{Deregistration, Registration, WorkerRegistry};
use crate::relay::OrderRelay;
use expo_common::error::{ExpoError, Result};
use expo_common::{DispatcherConfig, METRICS};
use expo_proto::{Payload, RequestKind, Speciality, WorkerId};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// An inbound request as handed over by a transport
pub struct Request {
    /// Request scope carrying the `type` field and its data
    pub scope: Payload,

    /// The request's own receive/send primitives
    pub channel: Box<dyn Channel>,
}

impl Request {
    pub fn new(scope: Payload, channel: impl Channel + 'static) -> Self {
        Self {
            scope,
            channel: Box::new(channel),
        }
    }
}

/// What a successfully handled request did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    Joined(WorkerId),
    Replaced(WorkerId),
    Left(WorkerId),
    NotOnDuty(WorkerId),

    /// The order went to `worker` and its response reached the client
    Delivered { worker: WorkerId, response: Payload },
}

/// Turn a raw scope into a typed request
///
/// An absent or unrecognized `type` is [`ExpoError::UnknownRequestType`]; a
/// known type with malformed data is [`ExpoError::InvalidInput`].
pub fn classify(scope: &Payload) -> Result<RequestKind> {
    let kind = match scope.get("type") {
        Some(Payload::String(kind)) => kind.as_str(),
        Some(other) => return Err(ExpoError::unknown_request_type(other.to_string())),
        None => return Err(ExpoError::unknown_request_type("<missing>")),
    };

    if !RequestKind::is_known_type(kind) {
        return Err(ExpoError::unknown_request_type(kind));
    }

    let request: RequestKind = serde_json::from_value(scope.clone())
        .map_err(|e| ExpoError::invalid_input(format!("malformed {} request: {}", kind, e)))?;

    if let RequestKind::Join { id, speciality } = &request {
        if speciality.is_empty() {
            return Err(ExpoError::invalid_input(format!(
                "worker {} must offer at least one speciality",
                id
            )));
        }
    }

    Ok(request)
}

/// Send `err` to the caller as a rejection, if they are still listening
async fn reject(channel: &mut dyn Channel, err: &ExpoError) {
    if let Err(send_err) = channel.send(err.to_rejection().to_payload()).await {
        debug!("Could not deliver rejection ({}): {}", err.code(), send_err);
    }
}

/// Dispatcher over one operating period's registry
#[derive(Debug)]
pub struct Dispatcher {
    registry: WorkerRegistry,
    relay: OrderRelay,
}

impl Dispatcher {
    /// Start a new operating period with an empty registry
    pub fn new(config: &DispatcherConfig) -> Self {
        Self {
            registry: WorkerRegistry::new(config.compaction_threshold),
            relay: OrderRelay::new(config.order_timeout_ms.map(Duration::from_millis)),
        }
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Handle one request
    ///
    /// Failures stay local to this request. Unknown or malformed requests,
    /// orders nobody can take, and orders lost on the worker side are answered
    /// with a rejection on the request's channel before the error is returned.
    pub async fn handle(&self, request: Request) -> Result<Handled> {
        let Request { scope, mut channel } = request;

        let kind = match classify(&scope) {
            Ok(kind) => kind,
            Err(err) => {
                warn!("Rejected request: {}", err);
                METRICS.dispatcher.requests_rejected.inc();
                reject(channel.as_mut(), &err).await;
                return Err(err);
            }
        };
        debug!("Handling {} request", kind.name());

        match kind {
            RequestKind::Join { id, speciality } => {
                match self.registry.register(id.clone(), speciality, channel)? {
                    Registration::Joined => Ok(Handled::Joined(id)),
                    Registration::Replaced => Ok(Handled::Replaced(id)),
                }
            }
            RequestKind::Leave { id } => match self.registry.deregister(&id) {
                Deregistration::Left => Ok(Handled::Left(id)),
                Deregistration::NotOnDuty => Ok(Handled::NotOnDuty(id)),
            },
            RequestKind::Order { speciality } => self.order(&speciality, channel.as_mut()).await,
        }
    }

    async fn order(&self, speciality: &Speciality, client: &mut dyn Channel) -> Result<Handled> {
        let worker = match self.registry.select(speciality) {
            Ok(worker) => worker,
            Err(err) => {
                warn!("Order for {} rejected: {}", speciality, err);
                METRICS.dispatcher.no_workers_available.inc();
                reject(client, &err).await;
                return Err(err);
            }
        };

        METRICS.dispatcher.orders_routed.inc();
        debug!("Routing {} order to worker {}", speciality, worker.id());

        let start = Instant::now();
        let result = self.relay.relay(client, &worker).await;
        METRICS
            .dispatcher
            .relay_duration
            .observe(start.elapsed().as_secs_f64());

        match result {
            Ok(response) => {
                METRICS.dispatcher.orders_delivered.inc();
                info!("Order for {} served by worker {}", speciality, worker.id());
                Ok(Handled::Delivered {
                    worker: worker.id().clone(),
                    response,
                })
            }
            Err(err) => {
                METRICS.dispatcher.orders_failed.inc();
                warn!("Order for {} via worker {} failed: {}", speciality, worker.id(), err);

                if err.is_worker_failure() {
                    self.registry.evict(worker.id(), worker.generation());
                }
                reject(client, &err).await;
                Err(err)
            }
        }
    }
}
