//! Retransmission Scheduler
//!
//! A FIFO of `(callback, times)` jobs drained by one worker task. Each job's
//! callback runs `times` times with the configured interval after every call,
//! then the worker moves on to the next job.
//!
//! Stop is observed between invocations, never during one: the first
//! invocation of a dequeued job always completes, so at most one invocation
//! can run after [`TimedFunctorQueue::shutdown`] is called.

use crate::infrastructure::ShutdownController;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

type Functor = Arc<dyn Fn() + Send + Sync>;

struct Job {
    functor: Functor,
    times: u32,
}

/// Re-invokes scheduled callbacks a fixed number of times.
pub struct TimedFunctorQueue {
    interval: Duration,
    job_tx: mpsc::UnboundedSender<Job>,
    shutdown: ShutdownController,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TimedFunctorQueue {
    /// Start the worker. Must be called inside a tokio runtime.
    pub fn new(interval: Duration) -> Self {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let shutdown = ShutdownController::new("retransmit queue");
        let shutdown_rx = shutdown.subscribe();

        let worker = tokio::spawn(Self::run(interval, job_rx, shutdown.clone(), shutdown_rx));

        Self {
            interval,
            job_tx,
            shutdown,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Schedule `functor` to run `times` times. `times == 0` is a no-op.
    pub fn push<F>(&self, functor: F, times: u32)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if times < 1 || self.shutdown.is_shutdown() {
            return;
        }

        let job = Job {
            functor: Arc::new(functor),
            times,
        };
        if self.job_tx.send(job).is_err() {
            tracing::debug!("retransmit queue stopped, job dropped");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    /// Stop the worker and wait for it to exit.
    pub async fn shutdown(&self) {
        self.shutdown.shutdown();

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }

    async fn run(
        interval: Duration,
        mut job_rx: mpsc::UnboundedReceiver<Job>,
        shutdown: ShutdownController,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        'jobs: loop {
            if shutdown.is_shutdown() {
                break;
            }

            let job = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                job = job_rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            for i in 0..job.times {
                if i > 0 && shutdown.is_shutdown() {
                    break 'jobs;
                }

                (job.functor)();

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.recv() => break 'jobs,
                }
            }
        }

        tracing::debug!("retransmit queue worker stopped");
    }
}

impl Drop for TimedFunctorQueue {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_called_once() {
        let queue = TimedFunctorQueue::new(Duration::from_millis(10));
        let (count, f) = counter();

        queue.push(f, 1);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_called_three_times_spaced_by_interval() {
        let interval = Duration::from_millis(50);
        let queue = TimedFunctorQueue::new(interval);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let c = calls.clone();

        queue.push(move || c.lock().push(Instant::now()), 3);
        tokio::time::sleep(Duration::from_millis(400)).await;
        drop(queue);

        let calls = calls.lock();
        assert_eq!(calls.len(), 3);
        for pair in calls.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= interval);
        }
    }

    #[tokio::test]
    async fn test_called_zero_times() {
        let queue = TimedFunctorQueue::new(Duration::from_millis(10));
        let (count, f) = counter();

        queue.push(f, 0);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_two_functors_run_in_order() {
        let queue = TimedFunctorQueue::new(Duration::from_millis(10));
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = order.clone();
        let second = order.clone();

        queue.push(move || first.lock().push("first"), 2);
        queue.push(move || second.lock().push("second"), 1);
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(*order.lock(), vec!["first", "first", "second"]);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_long_job() {
        let queue = TimedFunctorQueue::new(Duration::from_millis(50));
        let (count, f) = counter();

        queue.push(f, 100);
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.shutdown().await;
        let stopped_at = count.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), stopped_at);
        assert!(stopped_at <= 2);
        assert!(queue.is_shutdown());
    }

    #[tokio::test]
    async fn test_push_after_shutdown_is_ignored() {
        let queue = TimedFunctorQueue::new(Duration::from_millis(10));
        queue.shutdown().await;

        let (count, f) = counter();
        queue.push(f, 3);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
