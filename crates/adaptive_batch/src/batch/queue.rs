use tokio::sync::{Mutex, mpsc};

use super::executor::CompressionRequest;
use super::fingerprint::RequestFingerprint;

/// A job with its effective request and cache fingerprint resolved.
#[derive(Clone, Debug)]
pub(crate) struct PreparedJob {
    pub(crate) fingerprint: RequestFingerprint,
    pub(crate) request: CompressionRequest,
}

#[derive(Debug)]
pub(crate) enum QueueItem {
    Job(PreparedJob),
    Stop,
}

/// Shared FIFO of jobs followed by one stop marker per worker.
///
/// All items are enqueued up front and the sender is dropped, so a drained
/// queue also reads as `Stop`.
#[derive(Debug)]
pub(crate) struct WorkQueue {
    receiver: Mutex<mpsc::UnboundedReceiver<QueueItem>>,
}

impl WorkQueue {
    pub(crate) fn seeded(jobs: impl IntoIterator<Item = PreparedJob>, workers: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        // The receiver is alive, so sends cannot fail.
        for job in jobs {
            let _ = sender.send(QueueItem::Job(job));
        }
        for _ in 0..workers {
            let _ = sender.send(QueueItem::Stop);
        }
        Self {
            receiver: Mutex::new(receiver),
        }
    }

    pub(crate) async fn pop(&self) -> QueueItem {
        self.receiver.lock().await.recv().await.unwrap_or(QueueItem::Stop)
    }
}
