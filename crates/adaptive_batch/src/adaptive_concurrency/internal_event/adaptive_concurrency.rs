use std::time::Duration;

use metrics::{Counter, Gauge, Histogram, counter, gauge, histogram};

use crate::batch::outcome::Outcome;
use crate::registered_event;

#[derive(Clone, Copy, Debug)]
pub struct WorkersAdjustedData {
    pub previous: usize,
    pub current: usize,
    pub reason: &'static str,
}

registered_event! {
    WorkersAdjusted => {
        current_workers: Gauge = gauge!("batch_current_workers"),
        adjustments: Counter = counter!("batch_worker_adjustments_total"),
    }

    fn emit(&self, data: WorkersAdjustedData) {
        self.current_workers.set(data.current as f64);
        if data.previous != data.current {
            self.adjustments.increment(1);
            info!(
                target: "adaptive_batch::controller",
                previous_workers = data.previous,
                current_workers = data.current,
                reason = data.reason,
                "Worker limit adjusted"
            );
        } else {
            debug!(
                target: "adaptive_batch::controller",
                current_workers = data.current,
                reason = data.reason,
                "Worker limit unchanged"
            );
        }
    }
}

registered_event! {
    RateLimitObserved => {
        rate_limits: Counter = counter!("batch_rate_limits_total"),
    }

    fn emit(&self, current_workers: usize) {
        self.rate_limits.increment(1);
        warn!(
            target: "adaptive_batch::controller",
            current_workers,
            "Rate limited; halving worker limit"
        );
    }
}

registered_event! {
    RequestLatency => {
        latency: Histogram = histogram!("batch_request_latency_seconds"),
    }

    fn emit(&self, rtt: Duration) {
        self.latency.record(rtt);
        trace!(target: "adaptive_batch::stats", latency_ms = rtt.as_millis(), "Request latency observed");
    }
}

registered_event! {
    JobFinished => {
        succeeded: Counter = counter!("batch_job_outcomes_total", "outcome" => "success"),
        cache_hits: Counter = counter!("batch_job_outcomes_total", "outcome" => "cache_hit"),
        rate_limited: Counter = counter!("batch_job_outcomes_total", "outcome" => "rate_limited"),
        timed_out: Counter = counter!("batch_job_outcomes_total", "outcome" => "timeout"),
        failed: Counter = counter!("batch_job_outcomes_total", "outcome" => "error"),
    }

    fn emit(&self, outcome: &Outcome) {
        match outcome {
            Outcome::Success { .. } => self.succeeded.increment(1),
            Outcome::CacheHit { .. } => self.cache_hits.increment(1),
            Outcome::RateLimited => self.rate_limited.increment(1),
            Outcome::Timeout => self.timed_out.increment(1),
            Outcome::Error { .. } => self.failed.increment(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    use metrics::{Key, KeyName, Metadata, Recorder, SharedString, Unit};

    use super::*;
    use crate::batch::outcome::FailureKind;

    /// Counts `batch_job_outcomes_total` per `outcome` label.
    #[derive(Default)]
    struct OutcomeCounters(Mutex<HashMap<String, Arc<AtomicU64>>>);

    impl OutcomeCounters {
        fn get(&self, outcome: &str) -> u64 {
            let counters = self.0.lock().unwrap();
            counters.get(outcome).map_or(0, |c| c.load(Ordering::SeqCst))
        }
    }

    impl Recorder for OutcomeCounters {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
            let outcome = key
                .labels()
                .find(|label| label.key() == "outcome")
                .map(|label| label.value().to_string())
                .unwrap_or_default();
            let counter = Arc::clone(self.0.lock().unwrap().entry(outcome).or_default());
            Counter::from_arc(counter)
        }

        fn register_gauge(&self, _: &Key, _: &Metadata<'_>) -> Gauge {
            Gauge::noop()
        }

        fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
            Histogram::noop()
        }
    }

    #[test]
    fn job_outcomes_are_counted_by_variant() {
        let recorder = OutcomeCounters::default();
        let handle = metrics::with_local_recorder(&recorder, JobFinishedHandle::register);

        let payload = serde_json::Value::Null;
        handle.emit(&Outcome::Success {
            ratio: 0.5,
            latency: Duration::from_millis(10),
            payload: payload.clone(),
        });
        handle.emit(&Outcome::CacheHit { ratio: 0.5, payload });
        handle.emit(&Outcome::RateLimited);
        handle.emit(&Outcome::Timeout);
        handle.emit(&Outcome::Timeout);
        handle.emit(&Outcome::Error {
            kind: FailureKind::MalformedResponse,
            message: "bad body".to_string(),
        });

        assert_eq!(recorder.get("success"), 1);
        assert_eq!(recorder.get("cache_hit"), 1);
        assert_eq!(recorder.get("rate_limited"), 1);
        assert_eq!(recorder.get("timeout"), 2);
        assert_eq!(recorder.get("error"), 1);
    }
}
