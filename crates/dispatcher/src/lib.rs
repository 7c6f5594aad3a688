//! Expo Dispatcher
//!
//! Routes orders to on-duty workers by round-robin rotation within a
//! speciality and relays each order's payload and response.

pub mod channel;
pub mod dispatcher;
pub mod registry;
pub mod relay;
pub mod transport;

pub use channel::{Channel, MemoryChannel};
pub use dispatcher::{classify, Dispatcher, Handled, Request};
pub use registry::{Deregistration, Registration, WorkerRecord, WorkerRegistry};
pub use relay::OrderRelay;
pub use transport::{serve, LineChannel};
