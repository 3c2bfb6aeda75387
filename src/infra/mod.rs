//! Outward-facing clients

pub mod api;

pub use api::{HttpQueueClient, QueueApi};
