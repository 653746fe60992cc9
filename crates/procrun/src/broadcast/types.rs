//! Broadcast types.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

/// Receiving end of an output subscription.
///
/// Yields the backlog recorded before subscribing, then every line broadcast
/// afterwards. Returns `None` once the runner stops or completes, or after the
/// subscriber was disconnected for falling too far behind.
#[derive(Debug)]
pub struct OutputSubscription {
    id: Uuid,
    rx: mpsc::Receiver<String>,
}

impl OutputSubscription {
    pub(crate) const fn new(id: Uuid, rx: mpsc::Receiver<String>) -> Self {
        Self { id, rx }
    }

    /// Unique subscriber identifier.
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Receive the next line, or `None` when the channel is closed and drained.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<String, TryRecvError> {
        self.rx.try_recv()
    }

    /// Convert into a [`Stream`](tokio_stream::Stream) of lines.
    pub fn into_stream(self) -> ReceiverStream<String> {
        ReceiverStream::new(self.rx)
    }
}
