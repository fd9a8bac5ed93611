//! Periodic background tasks with cancellation and bounded stop.
//!
//! Every QoS sweep (throttle counter reset, reliable-delivery retry and
//! cleanup, cache expiry) runs as a [`BackgroundWorker`] driving a
//! [`BackgroundRunnable`]: on each tick, on each submitted task, and once
//! more at shutdown.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Capacity of the on-demand task queue.
const TASK_QUEUE_CAPACITY: usize = 64;

/// Work executed by a [`BackgroundWorker`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// On-demand request type.
    type Task: Send + 'static;

    /// Handles one submitted task.
    async fn run(&mut self, task: Self::Task);

    /// Called on every tick of the worker's interval.
    async fn on_tick(&mut self) {}

    /// Called once after the worker was asked to stop.
    async fn shutdown(&mut self) {}
}

/// On-demand requests accepted by sweep workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepTask {
    /// Run the sweep now instead of waiting for the next tick.
    RunNow,
}

/// Handle to a spawned background task.
///
/// Dropping the handle aborts the task; use [`stop_within`](Self::stop_within)
/// for an orderly stop.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    name: &'static str,
    tasks: Option<mpsc::Sender<R::Task>>,
    cancel: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns `runnable`, ticking every `tick_interval_ms` (at least 1 ms).
    /// The first tick fires one full interval after start.
    pub fn start(name: &'static str, runnable: R, tick_interval_ms: u64) -> Self {
        let (tasks, task_rx) = mpsc::channel(TASK_QUEUE_CAPACITY);
        let (cancel, cancel_rx) = watch::channel(false);
        let period = Duration::from_millis(tick_interval_ms.max(1));
        let handle = tokio::spawn(drive(name, runnable, period, task_rx, cancel_rx));
        debug!(worker = name, ?period, "background worker started");
        Self {
            name,
            tasks: Some(tasks),
            cancel,
            handle: Some(handle),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the worker was not stopped or aborted yet.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Queues a task, waiting for queue space.
    ///
    /// # Errors
    ///
    /// Returns an error once the worker is stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        let tasks = self
            .tasks
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("worker {} is stopped", self.name))?;
        tasks
            .send(task)
            .await
            .map_err(|_| anyhow::anyhow!("worker {} exited", self.name))
    }

    /// Queues a task without waiting. Returns `false` if the queue is full
    /// or the worker is stopped.
    pub fn try_submit(&self, task: R::Task) -> bool {
        self.tasks.as_ref().is_some_and(|tx| tx.try_send(task).is_ok())
    }

    /// Stops the worker and waits for its shutdown hook to finish.
    pub async fn stop(&mut self) {
        self.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    /// Stops the worker, aborting it if it does not finish within `timeout`.
    /// Returns whether it finished in time.
    pub async fn stop_within(&mut self, timeout: Duration) -> bool {
        self.cancel();
        let Some(mut handle) = self.handle.take() else {
            return true;
        };
        if tokio::time::timeout(timeout, &mut handle).await.is_ok() {
            return true;
        }
        warn!(worker = self.name, ?timeout, "worker did not stop in time, aborting");
        handle.abort();
        false
    }

    /// Aborts the worker without running its shutdown hook.
    pub fn abort(&mut self) {
        self.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    fn cancel(&mut self) {
        self.cancel.send_replace(true);
        self.tasks = None;
    }
}

impl<R: BackgroundRunnable> Drop for BackgroundWorker<R> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn drive<R: BackgroundRunnable>(
    name: &'static str,
    mut runnable: R,
    period: Duration,
    mut tasks: mpsc::Receiver<R::Task>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
            task = tasks.recv() => match task {
                Some(task) => runnable.run(task).await,
                None => break,
            },
            _ = ticker.tick() => runnable.on_tick().await,
        }
    }

    runnable.shutdown().await;
    debug!(worker = name, "background worker stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Default)]
    struct Counters {
        runs: AtomicU32,
        ticks: AtomicU32,
        shutdowns: AtomicU32,
    }

    struct Sweeper(Arc<Counters>);

    #[async_trait]
    impl BackgroundRunnable for Sweeper {
        type Task = SweepTask;

        async fn run(&mut self, _task: SweepTask) {
            self.0.runs.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_tick(&mut self) {
            self.0.ticks.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.0.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Shutdown hook that never returns.
    struct Hung;

    #[async_trait]
    impl BackgroundRunnable for Hung {
        type Task = SweepTask;

        async fn run(&mut self, _task: SweepTask) {}

        async fn shutdown(&mut self) {
            std::future::pending::<()>().await;
        }
    }

    fn sweeper(tick_ms: u64) -> (BackgroundWorker<Sweeper>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        (BackgroundWorker::start("sweeper", Sweeper(counters.clone()), tick_ms), counters)
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_follow_the_interval() {
        let (mut worker, counters) = sweeper(1_000);

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 3);

        worker.stop().await;
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn submitted_tasks_run_before_stop() {
        let (mut worker, counters) = sweeper(60_000);
        assert_eq!(worker.name(), "sweeper");

        worker.submit(SweepTask::RunNow).await.unwrap();
        assert!(worker.try_submit(SweepTask::RunNow));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counters.runs.load(Ordering::SeqCst), 2);

        assert!(worker.stop_within(Duration::from_secs(1)).await);
        assert!(!worker.is_running());
        assert!(worker.submit(SweepTask::RunNow).await.is_err());
        assert!(!worker.try_submit(SweepTask::RunNow));
    }

    #[tokio::test]
    async fn hung_shutdown_is_aborted() {
        let mut worker = BackgroundWorker::start("hung", Hung, 60_000);
        assert!(worker.is_running());
        assert!(!worker.stop_within(Duration::from_millis(30)).await);
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn abort_skips_shutdown_hook() {
        let (mut worker, counters) = sweeper(60_000);
        worker.abort();
        tokio::task::yield_now().await;
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 0);
    }
}
