//! Worker pool / dispatch queue.
//!
//! A named pool of `N` tasks draining one bounded FIFO queue, the async
//! equivalent of `N` OS threads waiting on a condvar-guarded queue: here the
//! condvar is `tokio::sync::mpsc`'s own back-pressure and wakeup, and the
//! single shared receiver (behind an async mutex) is what lets `N` workers
//! compete fairly for the next task instead of each owning a private queue.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::debug;

pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub struct WorkerPool {
    tx: Option<mpsc::Sender<Task>>,
    rx: Arc<AsyncMutex<mpsc::Receiver<Task>>>,
    depth: Arc<AtomicUsize>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// `size` workers, each processing one task at a time; `capacity`
    /// bounds how many queued-but-not-yet-started tasks `submit` will
    /// accept before it starts to wait.
    pub fn new(name: impl Into<String>, size: usize, capacity: usize) -> WorkerPool {
        let name = name.into();
        let (tx, rx) = mpsc::channel::<Task>(capacity.max(1));
        let rx = Arc::new(AsyncMutex::new(rx));
        let depth = Arc::new(AtomicUsize::new(0));

        let workers = (0..size.max(1))
            .map(|idx| {
                let rx = rx.clone();
                let depth = depth.clone();
                let worker_name = format!("{name}-{idx}");
                tokio::spawn(async move {
                    loop {
                        let task = {
                            let mut guard = rx.lock().await;
                            guard.recv().await
                        };
                        match task {
                            Some(task) => {
                                task.await;
                                depth.fetch_sub(1, Ordering::SeqCst);
                            }
                            None => break,
                        }
                    }
                    debug!(worker = %worker_name, "worker pool task exiting");
                })
            })
            .collect();

        WorkerPool {
            tx: Some(tx),
            rx,
            depth,
            workers,
        }
    }

    /// Enqueues a task. Waits if the pool's queue is at capacity.
    pub async fn submit(&self, task: Task) -> Result<(), PoolShutDown> {
        let tx = self.tx.as_ref().ok_or(PoolShutDown)?;
        self.depth.fetch_add(1, Ordering::SeqCst);
        if tx.send(task).await.is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(PoolShutDown);
        }
        Ok(())
    }

    /// Number of tasks queued or currently executing.
    pub fn size(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Stops accepting new tasks, lets in-flight tasks run to completion,
    /// and drops anything still queued. Dropping the sender alone isn't
    /// enough: a `tokio::mpsc::Receiver` still drains its buffer before
    /// reporting closed, which would let queued-but-unstarted tasks run.
    /// So the buffer is emptied explicitly before the workers are joined.
    pub async fn shutdown(mut self) {
        self.tx.take();
        {
            let mut guard = self.rx.lock().await;
            let mut discarded = 0usize;
            while guard.try_recv().is_ok() {
                discarded += 1;
            }
            if discarded > 0 {
                self.depth.fetch_sub(discarded, Ordering::SeqCst);
                debug!(discarded, "dropped queued tasks at shutdown");
            }
        }
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
    }
}

#[derive(Debug)]
pub struct PoolShutDown;

impl std::fmt::Display for PoolShutDown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker pool is shutting down")
    }
}

impl std::error::Error for PoolShutDown {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as Counter;
    use std::time::Duration;

    #[tokio::test]
    async fn never_exceeds_configured_size() {
        let pool = WorkerPool::new("test", 2, 16);
        let concurrent = Arc::new(Counter::new(0));
        let max_seen = Arc::new(Counter::new(0));

        for _ in 0..10 {
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            pool.submit(Box::pin(async move {
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();
        }

        while pool.size() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_discards_queued_tasks_but_finishes_in_flight_ones() {
        let pool = WorkerPool::new("test", 1, 16);
        let ran = Arc::new(Counter::new(0));

        let ran2 = ran.clone();
        pool.submit(Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            ran2.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .unwrap();

        for _ in 0..5 {
            let ran = ran.clone();
            pool.submit(Box::pin(async move {
                ran.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();
        }

        // Give the single worker time to pick up the in-flight task but not
        // the queued ones behind it.
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.shutdown().await;

        assert_eq!(ran.load(Ordering::SeqCst), 1, "only the in-flight task ran");
    }
}
