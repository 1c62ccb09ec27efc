use crate::error::SourceError;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use work_dispatch_core::MessageId;

/// Proof of one outstanding delivery.
///
/// Settling a delivery consumes its receipt, so an item cannot be acked or
/// failed twice through the same receipt.
#[derive(PartialEq, Eq, Hash)]
pub struct Receipt {
    token: String,
}

impl Receipt {
    pub fn new(token: impl Into<String>) -> Self {
        Receipt {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Receipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Receipt({})", self.token)
    }
}

/// A raw item as handed out by a source
#[derive(Debug)]
pub struct Delivery {
    pub receipt: Receipt,
    /// Id the source knows the item by, used in logs when the body cannot be
    /// decoded
    pub message_id: Option<MessageId>,
    pub body: Bytes,
}

/// The shared queue a dispatch loop pulls from.
///
/// Broker choice and wire protocol live behind this trait.
#[async_trait]
pub trait WorkItemSource: Send + Sync {
    /// Queue name, for logs and status
    fn name(&self) -> &str;

    /// Next delivery, or `None` when nothing is ready
    async fn next(&self) -> Result<Option<Delivery>, SourceError>;

    async fn ack(&self, receipt: Receipt) -> Result<(), SourceError>;

    async fn fail(&self, receipt: Receipt) -> Result<(), SourceError>;
}
