//! Durable job consumption for scan workers.
//!
//! The worker pulls one job at a time, keeps its lease alive while the
//! pipeline runs, publishes progress and a terminal result, and acknowledges
//! the message exactly once.

pub mod heartbeat;
pub mod jetstream;
pub mod message;
pub mod worker;

pub use heartbeat::LeaseHeartbeat;
pub use jetstream::{JetStreamConsumer, JetStreamPublisher, JetStreamQueue};
pub use message::{JobConsumer, JobMessage, ResultPublisher};
pub use worker::{JobOutcome, Worker};
