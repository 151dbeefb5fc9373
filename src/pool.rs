//! Fan-out of independent per-crop jobs over a rayon thread pool.

use crate::error::{Error, Result};
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use log::{error, info, warn};
use rayon::prelude::*;
use std::panic::{catch_unwind, AssertUnwindSafe};

const PROGRESS_TEMPLATE: &str = "[{elapsed_precise}] {bar:60.cyan/blue} {pos}/{len} ({eta}) {msg}";

/// Outcome of a batch: how many jobs went through and which failed with what.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: Vec<(String, String)>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool { self.failed.is_empty() }

    pub fn total(&self) -> usize { self.succeeded + self.failed.len() }

    pub fn merge(&mut self, other: BatchReport) {
        self.succeeded += other.succeeded;
        self.failed.extend(other.failed);
    }

    fn record(&mut self, id: String, outcome: std::result::Result<(), String>) {
        match outcome {
            Ok(()) => self.succeeded += 1,
            Err(msg) => self.failed.push((id, msg)),
        }
    }

    pub fn log_summary(&self, what: &str) {
        if self.is_success() {
            info!("{}: all {} jobs succeeded", what, self.succeeded);
        } else {
            warn!("{}: {} of {} jobs failed", what, self.failed.len(), self.total());
            for (id, msg) in &self.failed {
                warn!("  {}: {}", id, msg);
            }
        }
    }
}

pub struct WorkerPool {
    pool: rayon::ThreadPool,
    max_concurrency: Option<usize>,
    show_progress: bool,
}

impl WorkerPool {
    /// `threads` defaults to the number of CPUs. Jobs run in waves of `max_concurrency`, a wave
    /// starts once the previous one is done.
    pub fn new(threads: Option<usize>, max_concurrency: Option<usize>) -> Result<Self> {
        if max_concurrency == Some(0) {
            return Err(Error::Config("max concurrency has to be at least 1".to_string()));
        }
        let threads = threads.unwrap_or_else(num_cpus::get).max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("data-prep-{}", i))
            .build()
            .map_err(|e| Error::Config(format!("could not start worker pool: {}", e)))?;
        Ok(Self { pool, max_concurrency, show_progress: false })
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn threads(&self) -> usize { self.pool.current_num_threads() }

    fn progress_bar(&self, len: usize, what: &str) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let style = ProgressStyle::with_template(PROGRESS_TEMPLATE).unwrap_or_else(|_| ProgressStyle::default_bar());
        ProgressBar::new(len as u64).with_style(style).with_message(what.to_string())
    }

    /// Runs `job` on every item. Errors and panics of single jobs end up in the report.
    pub fn run<T, I, F>(&self, what: &str, items: &[T], id: I, job: F) -> BatchReport
    where
        T: Sync,
        I: Fn(&T) -> String + Sync,
        F: Fn(&T) -> Result<()> + Sync,
    {
        let bar = self.progress_bar(items.len(), what);
        let wave_size = self.max_concurrency.unwrap_or(items.len()).max(1);
        let mut report = BatchReport::default();
        for wave in items.chunks(wave_size) {
            let outcomes: Vec<(String, std::result::Result<(), String>)> = self.pool.install(|| {
                wave.par_iter()
                    .progress_with(bar.clone())
                    .map(|item| {
                        let id = id(item);
                        info!("{}: starting {}", what, id);
                        let outcome = match catch_unwind(AssertUnwindSafe(|| job(item))) {
                            Ok(Ok(())) => {
                                info!("{}: finished {}", what, id);
                                Ok(())
                            }
                            Ok(Err(e)) => {
                                error!("{}: {} failed: {}", what, id, e);
                                Err(e.to_string())
                            }
                            Err(_) => {
                                error!("{}: {} panicked", what, id);
                                Err("job panicked".to_string())
                            }
                        };
                        (id, outcome)
                    })
                    .collect()
            });
            for (id, outcome) in outcomes {
                report.record(id, outcome);
            }
        }
        bar.finish_and_clear();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn failures_are_collected_not_propagated() {
        let pool = WorkerPool::new(Some(2), None).unwrap();
        let items: Vec<usize> = (0..10).collect();
        let report = pool.run("test", &items, |i| format!("job{}", i), |&i| {
            if i % 3 == 0 {
                Err(Error::Storage(format!("bad {}", i)))
            } else {
                Ok(())
            }
        });
        assert_eq!(report.succeeded, 6);
        let mut failed: Vec<_> = report.failed.iter().map(|(id, _)| id.as_str()).collect();
        failed.sort();
        assert_eq!(failed, vec!["job0", "job3", "job6", "job9"]);
    }

    #[test]
    fn panics_stay_inside_the_job() {
        let pool = WorkerPool::new(Some(1), None).unwrap();
        let report = pool.run("test", &[1, 2], |i| i.to_string(), |&i| {
            if i == 1 {
                panic!("boom");
            }
            Ok(())
        });
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, vec![("1".to_string(), "job panicked".to_string())]);
    }

    #[test]
    fn waves_do_not_overlap() {
        let pool = WorkerPool::new(Some(4), Some(2)).unwrap();
        let running = AtomicUsize::new(0);
        let max_seen = Mutex::new(0usize);
        let items: Vec<usize> = (0..7).collect();
        let report = pool.run("test", &items, |i| i.to_string(), |_| {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            {
                let mut max = max_seen.lock().unwrap();
                *max = (*max).max(now);
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(report.succeeded, 7);
        assert!(*max_seen.lock().unwrap() <= 2);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        assert!(matches!(WorkerPool::new(None, Some(0)), Err(Error::Config(_))));
    }
}
