//! Bounded fire-and-forget task pool.
//!
//! Progress updates and other side-channel writes go through here
//! instead of ad-hoc spawns: the queue is bounded with a
//! drop-on-overflow policy, and shutdown drains whatever is in
//! flight instead of orphaning it.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct TaskPool {
    tx: mpsc::Sender<BoxFuture<'static, ()>>,
    worker: JoinHandle<()>,
}

impl TaskPool {
    pub fn new(capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<BoxFuture<'static, ()>>(capacity.max(1));
        let worker = tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                task.await;
            }
        });
        Self { tx, worker }
    }

    /// Submit a task. Returns false if the pool is full and the task
    /// was dropped — side-channel work is allowed to be lossy.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.tx.try_send(task.boxed()) {
            Ok(()) => true,
            Err(_) => {
                debug!("task pool full, dropping side-channel task");
                false
            }
        }
    }

    /// Close the pool and wait for in-flight tasks to finish.
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.worker.await;
    }
}
