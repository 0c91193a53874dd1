//! Bounded parallel task runner.
//!
//! Grounded on the original's `ExecutorRunner` (a `ThreadPoolExecutor` sized
//! `max(cpu_count() - 1, 1)`, with `add_task`/`join_all` collecting results
//! and re-raising the first exception seen, and a wall-clock timing log
//! line around the whole batch). Rebuilt on `rayon`, the thread-pool crate
//! the example pack reaches for, rather than hand-rolling a channel-based
//! pool.

use std::time::Instant;

use anyhow::Result;
use rayon::{ThreadPool, ThreadPoolBuilder};

/// A bounded thread pool that runs a batch of fallible closures and
/// surfaces the first failure, matching the original's "first exception
/// wins" semantics rather than aggregating every error.
pub struct TaskRunner {
    pool: ThreadPool,
}

impl TaskRunner {
    /// Sizes the pool to `max(available_parallelism - 1, 1)`, leaving one
    /// core free for the calling thread the way the original did.
    pub fn new() -> Result<Self> {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let workers = cpus.saturating_sub(1).max(1);
        Self::with_workers(workers)
    }

    pub fn with_workers(workers: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .build()?;
        Ok(Self { pool })
    }

    /// Run every task, return as soon as all complete, propagating the
    /// first error encountered (in task submission order, not completion
    /// order, so behavior is deterministic across runs).
    pub fn run_all<T, F>(&self, tasks: Vec<F>) -> Result<Vec<T>>
    where
        T: Send,
        F: FnOnce() -> Result<T> + Send,
    {
        let started = Instant::now();
        let results: Vec<Result<T>> = self
            .pool
            .install(|| rayon::iter::ParallelIterator::collect(rayon_tasks(tasks)));
        let elapsed = started.elapsed();
        tracing::info!(seconds = elapsed.as_secs_f64(), "runner time");

        let mut out = Vec::with_capacity(results.len());
        for result in results {
            out.push(result?);
        }
        Ok(out)
    }
}

fn rayon_tasks<T, F>(tasks: Vec<F>) -> impl rayon::iter::ParallelIterator<Item = Result<T>>
where
    T: Send,
    F: FnOnce() -> Result<T> + Send,
{
    use rayon::iter::{IntoParallelIterator, ParallelIterator};
    tasks.into_par_iter().map(|task| task())
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self::new().expect("failed to build thread pool")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_every_task_and_collects_results() {
        let runner = TaskRunner::with_workers(4).unwrap();
        let tasks: Vec<_> = (0..10)
            .map(|i| move || -> Result<usize> { Ok(i * 2) })
            .collect();
        let mut results = runner.run_all(tasks).unwrap();
        results.sort();
        assert_eq!(results, (0..10).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn propagates_first_failure() {
        let runner = TaskRunner::with_workers(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<Box<dyn FnOnce() -> Result<()> + Send>> = (0..5)
            .map(|i| {
                let counter = counter.clone();
                Box::new(move || -> Result<()> {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if i == 2 {
                        anyhow::bail!("task {i} failed");
                    }
                    Ok(())
                }) as Box<dyn FnOnce() -> Result<()> + Send>
            })
            .collect();
        let err = runner.run_all(tasks).unwrap_err();
        assert!(err.to_string().contains("failed"));
    }
}
