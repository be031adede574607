//! Parallel directory iteration.
//!
//! A shared work queue of `(path, kind)` items drained by N workers.
//! Workers pull from the tail, so traversal is depth-first; the
//! breadth-first flag pushes new items to the head instead. Enumerating a
//! directory enqueues its children. The visitor runs for every item;
//! returning `false` for a directory skips its subtree. Iteration
//! completes when the queue is empty and no worker holds an in-flight
//! item, tracked by a counter under the queue lock.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

/// One queued filesystem entry.
#[derive(Debug, Clone)]
pub struct WalkItem {
    pub path: PathBuf,
    pub is_directory: bool,
}

/// Traversal options.
#[derive(Debug, Clone, Copy, Default)]
pub struct WalkFlags {
    /// Push discovered items to the queue head (breadth-first) instead of
    /// the tail (depth-first).
    pub breadth_first: bool,
}

/// Visitor predicate; returning `false` for a directory vetoes descent.
pub type WalkVisitor = Arc<dyn Fn(&WalkItem) -> bool + Send + Sync>;

#[derive(Default)]
struct Queue {
    items: VecDeque<WalkItem>,
    in_flight: usize,
}

struct Shared {
    queue: Mutex<Queue>,
    notify: Notify,
    complete: CancellationToken,
    flags: WalkFlags,
    visitor: WalkVisitor,
}

impl Shared {
    async fn add_item(&self, item: WalkItem) {
        {
            let mut queue = self.queue.lock().await;
            if self.flags.breadth_first {
                queue.items.push_front(item);
            } else {
                queue.items.push_back(item);
            }
        }
        self.notify.notify_waiters();
    }

    async fn begin_item(&self) -> Option<WalkItem> {
        let mut queue = self.queue.lock().await;
        let item = queue.items.pop_back();
        if item.is_some() {
            queue.in_flight += 1;
        }
        item
    }

    async fn end_item(&self) {
        let mut queue = self.queue.lock().await;
        queue.in_flight -= 1;
        if queue.items.is_empty() && queue.in_flight == 0 {
            // Nothing queued and nothing running: iteration is finished.
            self.complete.cancel();
            self.notify.notify_waiters();
        }
    }

    async fn visit_item(&self, item: &WalkItem) {
        if !(self.visitor)(item) {
            return;
        }
        if !item.is_directory {
            return;
        }
        let mut entries = match tokio::fs::read_dir(&item.path).await {
            Ok(entries) => entries,
            Err(_) => return,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let is_directory =
                entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            self.add_item(WalkItem { path: entry.path(), is_directory }).await;
        }
    }

    async fn worker(self: Arc<Self>) {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.begin_item().await {
                self.visit_item(&item).await;
                self.end_item().await;
                continue;
            }
            if self.complete.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = notified => {}
                _ = self.complete.cancelled() => break,
            }
        }
    }
}

/// Walks `root` with up to `threads` concurrent workers, invoking
/// `visitor` for every file and directory beneath it (and for `root`
/// itself).
pub async fn iterate_parallel(
    root: &Path,
    threads: usize,
    flags: WalkFlags,
    visitor: WalkVisitor,
) -> io::Result<()> {
    let root_meta = tokio::fs::metadata(root).await?;
    let shared = Arc::new(Shared {
        queue: Mutex::new(Queue::default()),
        notify: Notify::new(),
        complete: CancellationToken::new(),
        flags,
        visitor,
    });

    shared
        .add_item(WalkItem { path: root.to_path_buf(), is_directory: root_meta.is_dir() })
        .await;

    let mut workers = tokio::task::JoinSet::new();
    for _ in 0..threads.max(1) {
        workers.spawn(shared.clone().worker());
    }
    while workers.join_next().await.is_some() {}
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex as StdMutex;

    async fn build_tree(root: &Path) {
        for dir in ["a/b", "a/c", "d"] {
            tokio::fs::create_dir_all(root.join(dir)).await.unwrap();
        }
        for file in ["a/b/one.txt", "a/c/two.txt", "d/three.txt", "four.txt"] {
            tokio::fs::write(root.join(file), b"x").await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_visits_every_item() {
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path()).await;

        let seen = Arc::new(StdMutex::new(Vec::<PathBuf>::new()));
        let sink = seen.clone();
        iterate_parallel(
            dir.path(),
            4,
            WalkFlags::default(),
            Arc::new(move |item: &WalkItem| {
                sink.lock().unwrap().push(item.path.clone());
                true
            }),
        )
        .await
        .unwrap();

        let seen = seen.lock().unwrap();
        // Root + 4 directories + 4 files.
        assert_eq!(seen.len(), 9);
        assert!(seen.iter().any(|p| p.ends_with("one.txt")));
        assert!(seen.iter().any(|p| p.ends_with("four.txt")));
    }

    #[tokio::test]
    async fn test_visitor_vetoes_subtree() {
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path()).await;

        let seen = Arc::new(StdMutex::new(Vec::<PathBuf>::new()));
        let sink = seen.clone();
        iterate_parallel(
            dir.path(),
            2,
            WalkFlags::default(),
            Arc::new(move |item: &WalkItem| {
                sink.lock().unwrap().push(item.path.clone());
                !(item.is_directory && item.path.ends_with("a"))
            }),
        )
        .await
        .unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen.iter().any(|p| p.ends_with("a")));
        assert!(!seen.iter().any(|p| p.ends_with("one.txt")));
        assert!(seen.iter().any(|p| p.ends_with("three.txt")));
    }

    #[tokio::test]
    async fn test_breadth_first_flag() {
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path()).await;

        let count = Arc::new(StdMutex::new(0usize));
        let sink = count.clone();
        iterate_parallel(
            dir.path(),
            1,
            WalkFlags { breadth_first: true },
            Arc::new(move |_: &WalkItem| {
                *sink.lock().unwrap() += 1;
                true
            }),
        )
        .await
        .unwrap();
        assert_eq!(*count.lock().unwrap(), 9);
    }
}
