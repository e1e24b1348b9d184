//! Constellation - durable entity event distribution
//!
//! Tracks entities (drones, robots, sensors, ...) per organization and
//! propagates their lifecycle changes through NATS JetStream: a supervised
//! broker, per-domain durable streams, deduplicated publishes and one
//! explicitly acknowledged pull worker per domain.

pub mod broker;
pub mod bus;
pub mod config;
pub mod consumers;
pub mod events;
pub mod ontology;
pub mod producer;
pub mod publish;
pub mod runtime;
pub mod streams;
pub mod subjects;
pub mod utils;
pub mod workers;
