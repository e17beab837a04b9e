//! The hive broker.
//!
//! A broker is a message router with two matched queues: workers
//! blocked on a task request, and tasks waiting for a worker. The
//! routing logic itself is a pure state machine (`router`); the TCP
//! realization with its identity-framed connections lives in
//! `server`.

pub mod router;
pub mod server;

pub use crate::router::{BrokerConfig, Route, RouterState};
pub use crate::server::{Broker, BrokerHandle};
