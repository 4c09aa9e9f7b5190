use async_trait::async_trait;
use dflowcore::{DelayScheduler, InboundMessage, StoreError};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// Delay scheduler backed by tokio timers.
///
/// Each task sleeps in its own tokio task, then posts a
/// [`InboundMessage::Timer`] on the channel returned by [`TokioDelayScheduler::new`].
/// Feed that receiver to `Engine::drive`. Timers do not survive a restart.
#[derive(Debug, Clone)]
pub struct TokioDelayScheduler {
    sender: mpsc::UnboundedSender<InboundMessage>,
}

impl TokioDelayScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<InboundMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Post timers into an existing message channel.
    pub fn with_sender(sender: mpsc::UnboundedSender<InboundMessage>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl DelayScheduler for TokioDelayScheduler {
    async fn add_task(&self, step: &str, trace_id: &str, timeout_ms: u64) -> Result<(), StoreError> {
        if self.sender.is_closed() {
            return Err(StoreError::Unavailable("delay channel closed".to_string()));
        }

        let sender = self.sender.clone();
        let message = InboundMessage::Timer {
            step: step.to_string(),
            trace_id: trace_id.to_string(),
        };
        debug!("Timer for {} at {} in {}ms", trace_id, step, timeout_ms);

        tokio::spawn(async move {
            sleep(Duration::from_millis(timeout_ms)).await;
            if sender.send(message).is_err() {
                warn!("Delay channel closed before the timer fired");
            }
        });
        Ok(())
    }
}
