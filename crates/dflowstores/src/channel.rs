use async_trait::async_trait;
use dflowcore::{InboundMessage, StepChannel, StoreError};
use tokio::sync::mpsc;

/// Step channel delivering hops to an in-process receiver.
#[derive(Debug, Clone)]
pub struct ChannelStepTransport {
    sender: mpsc::UnboundedSender<InboundMessage>,
}

impl ChannelStepTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<InboundMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn with_sender(sender: mpsc::UnboundedSender<InboundMessage>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl StepChannel for ChannelStepTransport {
    async fn send(&self, message: InboundMessage) -> Result<bool, StoreError> {
        self.sender
            .send(message)
            .map(|_| true)
            .map_err(|e| StoreError::Unavailable(format!("step channel closed: {}", e)))
    }
}
