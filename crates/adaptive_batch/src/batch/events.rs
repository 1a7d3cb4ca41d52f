//! Lifecycle notifications for presentation layers.
//!
//! The orchestrator and its workers push [`ProgressEvent`]s into an
//! optional unbounded channel. Nothing in the batch waits on a subscriber,
//! and a dropped receiver silently disables the stream.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use super::job::JobId;
use super::outcome::JobReport;

#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    BatchStarted {
        jobs: usize,
        workers: usize,
    },
    JobStarted {
        job_id: JobId,
        worker: usize,
    },
    /// One attempt failed. `retry_in` is `None` when the job gives up.
    AttemptFailed {
        job_id: JobId,
        attempt: u32,
        error: String,
        retry_in: Option<Duration>,
    },
    JobFinished {
        worker: usize,
        report: JobReport,
    },
    WorkerExited {
        worker: usize,
    },
    BatchFinished {
        succeeded: usize,
        failed: usize,
    },
}

#[derive(Clone, Debug, Default)]
pub(crate) struct ProgressSink(Option<UnboundedSender<ProgressEvent>>);

impl ProgressSink {
    pub(crate) fn new(sender: UnboundedSender<ProgressEvent>) -> Self {
        ProgressSink(Some(sender))
    }

    pub(crate) fn emit(&self, event: ProgressEvent) {
        if let Some(sender) = &self.0 {
            // Subscribers are optional.
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn events_reach_the_subscriber() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ProgressSink::new(tx);
        sink.emit(ProgressEvent::WorkerExited { worker: 3 });
        assert_eq!(rx.try_recv().unwrap(), ProgressEvent::WorkerExited { worker: 3 });
    }

    #[test]
    fn dropped_subscriber_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        ProgressSink::new(tx).emit(ProgressEvent::WorkerExited { worker: 0 });
        ProgressSink::default().emit(ProgressEvent::WorkerExited { worker: 0 });
    }
}
