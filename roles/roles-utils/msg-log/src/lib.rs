//! Consumption side of the partitioned message log.
//!
//! The transport itself is an external collaborator; the stats roles only
//! need to pull raw payloads with a bounded timeout. [`LogConsumer`] is
//! that seam, and [`LogHub`] is the in-process reference backend used by
//! tests and single-process deployments.

pub mod hub;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use hub::{HubConsumer, LogHub};

/// One message pulled off a topic partition.
#[derive(Debug, Clone)]
pub struct LogMessage {
    pub offset: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum ConsumeError {
    /// The topic or partition does not exist. Fatal to the caller.
    #[error("unknown topic or partition: {0}")]
    UnknownTopic(String),

    /// Transient transport failure. Log and keep polling.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Pull-style consumer over one topic partition.
///
/// `poll` returns `Ok(None)` when nothing arrived within `timeout`;
/// reaching the end of the partition is an empty poll, not an error.
#[async_trait]
pub trait LogConsumer: Send {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<LogMessage>, ConsumeError>;
}
