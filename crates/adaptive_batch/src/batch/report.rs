use std::fmt;
use std::time::Duration;

use super::job::JobId;
use super::outcome::{JobReport, Outcome};
use crate::adaptive_concurrency::controller::ConcurrencySnapshot;

/// Aggregate result of one batch run.
#[derive(Clone, Debug)]
pub struct BatchReport {
    /// One entry per job, ordered by job id.
    pub jobs: Vec<JobReport>,
    pub workers_launched: usize,
    /// Controller state when the last worker exited.
    pub controller: ConcurrencySnapshot,
    pub elapsed: Duration,
}

impl BatchReport {
    pub(crate) fn new(
        jobs: Vec<JobReport>,
        workers_launched: usize,
        controller: ConcurrencySnapshot,
        elapsed: Duration,
    ) -> Self {
        Self {
            jobs,
            workers_launched,
            controller,
            elapsed,
        }
    }

    pub fn total(&self) -> usize {
        self.jobs.len()
    }

    pub fn get(&self, job_id: JobId) -> Option<&JobReport> {
        self.jobs
            .binary_search_by_key(&job_id, |report| report.job_id)
            .ok()
            .map(|index| &self.jobs[index])
    }

    /// Successes, including cache hits.
    pub fn succeeded(&self) -> usize {
        self.count(Outcome::is_success)
    }

    pub fn cache_hits(&self) -> usize {
        self.count(|outcome| matches!(outcome, Outcome::CacheHit { .. }))
    }

    pub fn failed(&self) -> usize {
        self.total() - self.succeeded()
    }

    pub fn rate_limited(&self) -> usize {
        self.count(|outcome| matches!(outcome, Outcome::RateLimited))
    }

    pub fn timed_out(&self) -> usize {
        self.count(|outcome| matches!(outcome, Outcome::Timeout))
    }

    fn count(&self, predicate: impl Fn(&Outcome) -> bool) -> usize {
        self.jobs.iter().filter(|report| predicate(&report.outcome)).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &JobReport> {
        self.jobs.iter().filter(|report| !report.outcome.is_success())
    }

    /// Mean compression ratio over successes and cache hits.
    pub fn average_ratio(&self) -> Option<f64> {
        let ratios: Vec<f64> = self.jobs.iter().filter_map(|report| report.outcome.ratio()).collect();
        if ratios.is_empty() {
            None
        } else {
            Some(ratios.iter().sum::<f64>() / ratios.len() as f64)
        }
    }

    /// Mean latency of remote successes; cache hits are excluded.
    pub fn average_latency(&self) -> Option<Duration> {
        let latencies: Vec<Duration> = self
            .jobs
            .iter()
            .filter_map(|report| match report.outcome {
                Outcome::Success { latency, .. } => Some(latency),
                _ => None,
            })
            .collect();
        if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<Duration>().div_f64(latencies.len() as f64))
        }
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Batch summary")?;
        writeln!(f, "  total jobs:        {}", self.total())?;
        writeln!(f, "  succeeded:         {} ({} from cache)", self.succeeded(), self.cache_hits())?;
        writeln!(
            f,
            "  failed:            {} ({} rate limited, {} timed out)",
            self.failed(),
            self.rate_limited(),
            self.timed_out()
        )?;
        match self.average_ratio() {
            Some(ratio) => writeln!(f, "  avg compression:   {:.3}", ratio)?,
            None => writeln!(f, "  avg compression:   n/a")?,
        }
        match self.average_latency() {
            Some(latency) => writeln!(f, "  avg latency:       {:.2}s", latency.as_secs_f64())?,
            None => writeln!(f, "  avg latency:       n/a")?,
        }
        writeln!(
            f,
            "  workers:           {} launched, {} permitted at end",
            self.workers_launched, self.controller.current_workers
        )?;
        writeln!(f, "  rate limits seen:  {}", self.controller.total_rate_limits)?;
        write!(f, "  elapsed:           {:.1}s", self.elapsed.as_secs_f64())?;

        let mut failures = self.failures().peekable();
        if failures.peek().is_some() {
            write!(f, "\nFailed jobs:")?;
            for report in failures {
                write!(
                    f,
                    "\n  {} after {} attempt(s): {}",
                    report.job_id,
                    report.attempts,
                    report.outcome.failure_message().unwrap_or_default()
                )?;
            }
        }
        Ok(())
    }
}
