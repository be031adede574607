//! The service worker pool.
//!
//! A fixed number of workers drain a pending queue. A task is ready when
//! no active task holds the same exclusive key (the case-folded file
//! path), so hydrations of one file are strictly serialized while
//! distinct files proceed in parallel up to the pool size. A semaphore
//! paces workers; readiness is decided under a single lock; after
//! finishing a task a worker greedily takes any newly-ready work before
//! sleeping again.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::text;

type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct Task {
    exclusive_key: Option<String>,
    future: TaskFuture,
}

#[derive(Default)]
struct TaskTable {
    pending: VecDeque<Task>,
    active: HashSet<String>,
    anonymous_active: usize,
}

struct Inner {
    table: Mutex<TaskTable>,
    notify: Semaphore,
    cancel: CancellationToken,
}

/// Fixed-size worker pool with per-key mutual exclusion.
pub struct TaskQueue {
    inner: Arc<Inner>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl TaskQueue {
    /// Starts `worker_count` workers observing `cancel`.
    pub fn start(worker_count: usize, cancel: CancellationToken) -> Self {
        let inner = Arc::new(Inner {
            table: Mutex::new(TaskTable::default()),
            notify: Semaphore::new(0),
            cancel,
        });
        let workers = (0..worker_count.max(1))
            .map(|_| {
                let inner = inner.clone();
                tokio::spawn(worker_loop(inner))
            })
            .collect();
        Self { inner, workers }
    }

    /// Submits a task. Tasks sharing an `exclusive_path` never run
    /// concurrently; comparison is case-insensitive.
    pub async fn submit<F>(&self, exclusive_path: Option<&str>, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = Task {
            exclusive_key: exclusive_path.map(text::fold),
            future: Box::pin(work),
        };
        self.inner.table.lock().await.pending.push_back(task);
        self.inner.notify.add_permits(1);
    }

    /// Number of tasks waiting or running.
    pub async fn outstanding(&self) -> usize {
        let table = self.inner.table.lock().await;
        table.pending.len() + table.active.len() + table.anonymous_active
    }

    /// Stops accepting work and joins the workers. Pending tasks that
    /// never started are dropped; running tasks finish.
    pub async fn shutdown(self) {
        self.inner.cancel.cancel();
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

async fn worker_loop(inner: Arc<Inner>) {
    loop {
        tokio::select! {
            permit = inner.notify.acquire() => {
                permit.expect("semaphore never closes").forget();
            }
            _ = inner.cancel.cancelled() => return,
        }

        // Drain every ready task before waiting again; finishing a task
        // can make a same-key successor ready with no new permit.
        loop {
            if inner.cancel.is_cancelled() {
                return;
            }
            let task = {
                let mut table = inner.table.lock().await;
                let ready = table
                    .pending
                    .iter()
                    .position(|t| t.exclusive_key.as_ref().is_none_or(|k| !table.active.contains(k)));
                match ready {
                    Some(index) => {
                        let task = table.pending.remove(index).expect("index in range");
                        match &task.exclusive_key {
                            Some(key) => {
                                table.active.insert(key.clone());
                            }
                            None => table.anonymous_active += 1,
                        }
                        task
                    }
                    None => break,
                }
            };

            let exclusive_key = task.exclusive_key.clone();
            task.future.await;

            let mut table = inner.table.lock().await;
            match exclusive_key {
                Some(key) => {
                    table.active.remove(&key);
                }
                None => table.anonymous_active -= 1,
            }
            drop(table);
        }
    }
}
