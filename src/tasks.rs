//! The periodic task runner.
//!
//! A single ticker-driven loop wakes once per second and runs every task
//! whose period has elapsed. Tasks run serially; each invocation is spawned
//! and awaited so a panicking task is caught and counted rather than taking
//! the server down. Tasks should be individually short and chunk long work.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

#[async_trait]
pub trait Taskable: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    async fn execute(&self) -> Result<()>;
}

struct TaskEntry {
    every: Duration,
    task: Arc<dyn Taskable>,
    runs: AtomicU64,
    failures: AtomicU64,
    last_run: Mutex<Option<Instant>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStat {
    pub name: String,
    pub period_secs: u64,
    pub runs: u64,
    pub failures: u64,
}

#[derive(Default)]
pub struct TaskRunner {
    tasks: Vec<TaskEntry>,
}

impl TaskRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&mut self, every_secs: u64, task: Arc<dyn Taskable>) {
        self.tasks.push(TaskEntry {
            every: Duration::from_secs(every_secs),
            task,
            runs: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            last_run: Mutex::new(None),
        });
    }

    pub fn stats(&self) -> Vec<TaskStat> {
        self.tasks
            .iter()
            .map(|entry| TaskStat {
                name: entry.task.name().to_string(),
                period_secs: entry.every.as_secs(),
                runs: entry.runs.load(Ordering::Relaxed),
                failures: entry.failures.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Drive the ticker until shutdown. A slow task pushes back its own
    /// next run (last-run time is stamped after completion), not the
    /// schedule of the others.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => break,
            }

            for entry in &self.tasks {
                let due = {
                    let last_run = entry.last_run.lock().unwrap();
                    match *last_run {
                        Some(at) => at.elapsed() >= entry.every,
                        None => true,
                    }
                };
                if !due {
                    continue;
                }

                self.execute_one(entry).await;
            }
        }
    }

    async fn execute_one(&self, entry: &TaskEntry) {
        let name = entry.task.name();
        let task = entry.task.clone();

        // Spawned so a panic surfaces as a JoinError instead of unwinding
        // through the runner loop.
        let outcome = tokio::spawn(async move { task.execute().await }).await;

        entry.runs.fetch_add(1, Ordering::Relaxed);
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                entry.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(task = name, %error, "Periodic task failed");
            }
            Err(join_error) => {
                entry.failures.fetch_add(1, Ordering::Relaxed);
                if join_error.is_panic() {
                    tracing::error!(task = name, "Periodic task panicked");
                } else {
                    tracing::warn!(task = name, %join_error, "Periodic task aborted");
                }
            }
        }
        *entry.last_run.lock().unwrap() = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counting {
        count: Arc<AtomicU64>,
    }

    #[async_trait]
    impl Taskable for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn execute(&self) -> Result<()> {
            self.count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    struct Panicking;

    #[async_trait]
    impl Taskable for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn execute(&self) -> Result<()> {
            panic!("task blew up");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tasks_run_on_their_period() {
        let count = Arc::new(AtomicU64::new(0));
        let mut runner = TaskRunner::new();
        runner.add_task(
            2,
            Arc::new(Counting {
                count: count.clone(),
            }),
        );
        let runner = Arc::new(runner);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(runner.clone().run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(5100)).await;
        shutdown.cancel();
        handle.await.unwrap();

        // First run immediately, then roughly every 2s.
        let runs = count.load(Ordering::Relaxed);
        assert!((2..=4).contains(&runs), "unexpected run count {runs}");

        let stats = runner.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].name, "counting");
        assert_eq!(stats[0].period_secs, 2);
        assert_eq!(stats[0].runs, runs);
        assert_eq!(stats[0].failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_task_does_not_kill_runner() {
        let count = Arc::new(AtomicU64::new(0));
        let mut runner = TaskRunner::new();
        runner.add_task(1, Arc::new(Panicking));
        runner.add_task(
            1,
            Arc::new(Counting {
                count: count.clone(),
            }),
        );
        let runner = Arc::new(runner);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(runner.clone().run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(3100)).await;
        shutdown.cancel();
        handle.await.unwrap();

        // The healthy task kept running despite its panicking neighbor.
        assert!(count.load(Ordering::Relaxed) >= 2);
        let stats = runner.stats();
        let panicking = stats.iter().find(|s| s.name == "panicking").unwrap();
        assert!(panicking.failures >= 2);
        assert_eq!(panicking.failures, panicking.runs);
    }
}
