use std::time::{Duration, Instant};

/// Per-task counters. Lives inside the task record and is only touched under
/// the task's lock.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    total_items: u64,
    valid_items: u64,
    started: Option<Instant>,
    elapsed: Option<Duration>,
}

/// Point-in-time view of a task's metrics.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct Metrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub total_items: u64,
    pub valid_items: u64,
    pub elapsed_secs: f64,
    pub items_per_second: f64,
}

impl MetricsCollector {
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
        self.elapsed = None;
    }

    /// Freezes the elapsed time.
    pub fn finish(&mut self) {
        if self.elapsed.is_none() {
            self.elapsed = Some(self.elapsed());
        }
    }

    pub fn record_request(&mut self, ok: bool) {
        self.total_requests += 1;
        if ok {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
    }

    pub fn record_items(&mut self, seen: u64, kept: u64) {
        self.total_items += seen;
        self.valid_items += kept;
    }

    pub fn elapsed(&self) -> Duration {
        match (self.elapsed, self.started) {
            (Some(elapsed), _) => elapsed,
            (None, Some(started)) => started.elapsed(),
            (None, None) => Duration::ZERO,
        }
    }

    pub fn snapshot(&self) -> Metrics {
        let elapsed = self.elapsed();
        let success_rate = if self.total_requests == 0 {
            0.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        };
        let secs = elapsed.as_secs_f64();
        let items_per_second = if secs > 0.0 {
            self.total_items as f64 / secs
        } else {
            0.0
        };
        Metrics {
            total_requests: self.total_requests,
            successful_requests: self.successful_requests,
            failed_requests: self.failed_requests,
            success_rate,
            total_items: self.total_items,
            valid_items: self.valid_items,
            elapsed_secs: secs,
            items_per_second,
        }
    }

    pub fn write_to_log(&self, task_id: &str) {
        let metrics = self.snapshot();
        tracing::info!(
            task_id,
            total_requests = metrics.total_requests,
            successful_requests = metrics.successful_requests,
            failed_requests = metrics.failed_requests,
            total_items = metrics.total_items,
            valid_items = metrics.valid_items,
            running_time = ?self.elapsed(),
            "statistics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_tracks_requests() {
        let mut metrics = MetricsCollector::default();
        assert_eq!(metrics.snapshot().success_rate, 0.0);

        metrics.record_request(true);
        metrics.record_request(false);
        metrics.record_request(true);
        metrics.record_request(true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 4);
        assert_eq!(snapshot.successful_requests, 3);
        assert_eq!(snapshot.failed_requests, 1);
        assert_eq!(snapshot.success_rate, 0.75);
    }

    #[test]
    fn finished_collector_stops_the_clock() {
        let mut metrics = MetricsCollector::default();
        metrics.start();
        metrics.record_items(10, 8);
        metrics.finish();
        let first = metrics.snapshot();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(metrics.snapshot().elapsed_secs, first.elapsed_secs);
        assert_eq!(first.valid_items, 8);
    }
}
