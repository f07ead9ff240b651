use async_trait::async_trait;

// ============================================================================
// Message Sink - the only outbound collaborator of the relay
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// Broker or network unreachable
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// Delivery failed for a transient reason
    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Invalid destination '{topic}': {reason}")]
    InvalidDestination { topic: String, reason: String },

    /// The broker refused this message and will refuse it again
    #[error("Message rejected: {0}")]
    Rejected(String),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Unavailable(_) | SinkError::Delivery(_))
    }
}

#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Publish one message and wait for the broker's acknowledgement
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), SinkError>;
}
