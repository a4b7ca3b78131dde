//! Task executor (C10): a global FIFO serializer for task-bound operations.
//! Guarantees that at most one task-bound operation executes at any time
//! across the whole process, with a single worker draining a single queue.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

type Thunk = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send>;

struct Job {
    task_id: i64,
    operation_name: String,
    thunk: Thunk,
    done: oneshot::Sender<Result<()>>,
}

/// Handle used by callers to submit task-bound operations. Cloning is cheap;
/// every clone shares the same single-worker queue.
#[derive(Clone)]
pub struct TaskExecutor {
    tx: mpsc::UnboundedSender<Job>,
    active: Arc<AtomicUsize>,
}

impl TaskExecutor {
    /// Spawn the single worker and return a handle to submit work to it.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let active = Arc::new(AtomicUsize::new(0));
        let worker_active = active.clone();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                worker_active.fetch_add(1, Ordering::SeqCst);
                info!(task_id = job.task_id, operation = %job.operation_name, "executor: operation start");
                let result = (job.thunk)().await;
                match &result {
                    Ok(()) => info!(task_id = job.task_id, operation = %job.operation_name, "executor: operation complete"),
                    Err(e) => error!(task_id = job.task_id, operation = %job.operation_name, error = %e, "executor: operation error"),
                }
                worker_active.fetch_sub(1, Ordering::SeqCst);
                let _ = job.done.send(result);
            }
        });

        Self { tx, active }
    }

    /// How many task-bound operations are executing right now (0 or 1,
    /// since this executor serializes every submission through one worker).
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Submit `op` for `task_id` and await its completion, preserving FIFO
    /// order relative to every other submission on this executor.
    pub async fn submit<F, Fut>(&self, task_id: i64, operation_name: impl Into<String>, op: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job = Job {
            task_id,
            operation_name: operation_name.into(),
            thunk: Box::new(move || Box::pin(op())),
            done: done_tx,
        };
        self.tx
            .send(job)
            .map_err(|_| anyhow::anyhow!("task executor worker has shut down"))?;
        done_rx.await.map_err(|_| anyhow::anyhow!("task executor dropped the operation before completion"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn operations_run_strictly_in_fifo_order() {
        let executor = TaskExecutor::spawn();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let executor = executor.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                executor
                    .submit(i, "op", move || {
                        let order = order.clone();
                        async move {
                            order.lock().unwrap().push(i);
                            Ok(())
                        }
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn failing_operation_does_not_stop_the_worker() {
        let executor = TaskExecutor::spawn();
        let first = executor.submit(1, "fails", || async { Err(anyhow::anyhow!("boom")) }).await;
        assert!(first.is_err());

        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        executor
            .submit(2, "succeeds", move || {
                let counter2 = counter2.clone();
                async move {
                    counter2.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn active_count_reflects_in_flight_operation() {
        let executor = TaskExecutor::spawn();
        assert_eq!(executor.active_count(), 0);

        let executor2 = executor.clone();
        let handle = tokio::spawn(async move {
            executor2
                .submit(1, "op", || async {
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    Ok(())
                })
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(executor.active_count(), 1);
        handle.await.unwrap().unwrap();
        assert_eq!(executor.active_count(), 0);
    }

    #[tokio::test]
    async fn at_most_one_operation_in_flight_at_a_time() {
        let executor = TaskExecutor::spawn();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..8 {
            let executor = executor.clone();
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                executor
                    .submit(i, "op", move || {
                        let in_flight = in_flight.clone();
                        let max_seen = max_seen.clone();
                        async move {
                            let n = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(n, Ordering::SeqCst);
                            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        }
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
