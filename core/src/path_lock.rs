//! Named, FIFO-fair reader/writer locks keyed by normalized path (spec §4.A).
//!
//! Acquisition order is strict FIFO across mixed readers and writers: once a
//! writer is queued, readers that arrive afterward wait behind it. Locks
//! are allocated lazily on first acquisition and reclaimed once no holder
//! or waiter remains.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

enum Waiter {
    Read(oneshot::Sender<()>),
    Write(oneshot::Sender<()>),
}

struct LockInner {
    readers: usize,
    writer: bool,
    waiters: VecDeque<Waiter>,
}

impl LockInner {
    fn new() -> Self {
        Self { readers: 0, writer: false, waiters: VecDeque::new() }
    }

    fn idle(&self) -> bool {
        self.readers == 0 && !self.writer && self.waiters.is_empty()
    }

    /// Wakes as many queued waiters as the newly-idle-enough state allows:
    /// one writer, or a contiguous run of readers up to the next writer.
    fn wake_eligible(&mut self) {
        while self.readers == 0 || matches!(self.waiters.front(), Some(Waiter::Read(_))) {
            match self.waiters.front() {
                Some(Waiter::Write(_)) if self.readers == 0 && !self.writer => {
                    if let Some(Waiter::Write(tx)) = self.waiters.pop_front() {
                        self.writer = true;
                        let _ = tx.send(());
                    }
                    break;
                }
                Some(Waiter::Write(_)) => break,
                Some(Waiter::Read(_)) => {
                    if let Some(Waiter::Read(tx)) = self.waiters.pop_front() {
                        self.readers += 1;
                        let _ = tx.send(());
                    }
                }
                None => break,
            }
        }
    }
}

/// The path-keyed lock table. Typically held behind an `Arc` and shared by
/// `CachingTree` and `RQProcessor`.
#[derive(Default)]
pub struct PathLock {
    table: Mutex<HashMap<String, Arc<Mutex<LockInner>>>>,
}

impl PathLock {
    pub fn new() -> Self {
        Self { table: Mutex::new(HashMap::new()) }
    }

    fn entry_for(&self, path: &str) -> Arc<Mutex<LockInner>> {
        let mut table = self.table.lock().unwrap();
        table
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(LockInner::new())))
            .clone()
    }

    pub async fn read_lock(self: &Arc<Self>, path: &str) -> LockGuard {
        self.acquire(path, LockMode::Read).await
    }

    pub async fn write_lock(self: &Arc<Self>, path: &str) -> LockGuard {
        self.acquire(path, LockMode::Write).await
    }

    async fn acquire(self: &Arc<Self>, path: &str, mode: LockMode) -> LockGuard {
        let entry = self.entry_for(path);
        let rx = {
            let mut inner = entry.lock().unwrap();
            match mode {
                LockMode::Read if !inner.writer && inner.waiters.is_empty() => {
                    inner.readers += 1;
                    None
                }
                LockMode::Write if inner.readers == 0 && !inner.writer && inner.waiters.is_empty() => {
                    inner.writer = true;
                    None
                }
                LockMode::Read => {
                    let (tx, rx) = oneshot::channel();
                    inner.waiters.push_back(Waiter::Read(tx));
                    Some(rx)
                }
                LockMode::Write => {
                    let (tx, rx) = oneshot::channel();
                    inner.waiters.push_back(Waiter::Write(tx));
                    Some(rx)
                }
            }
        };
        if let Some(rx) = rx {
            // The channel is dropped only when the lock table is torn down;
            // an error here just means we were granted via state already set.
            let _ = rx.await;
        }
        LockGuard {
            path_lock: self.clone(),
            path: path.to_string(),
            entry,
            mode,
            released: false,
        }
    }
}

/// An acquired lock. Release is idempotent: dropping the guard releases it
/// if `release()` was not already called explicitly.
pub struct LockGuard {
    path_lock: Arc<PathLock>,
    path: String,
    entry: Arc<Mutex<LockInner>>,
    mode: LockMode,
    released: bool,
}

impl LockGuard {
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        {
            let mut inner = self.entry.lock().unwrap();
            match self.mode {
                LockMode::Read => inner.readers = inner.readers.saturating_sub(1),
                LockMode::Write => inner.writer = false,
            }
            inner.wake_eligible();
        }
        let mut table = self.path_lock.table.lock().unwrap();
        if let Some(arc) = table.get(&self.path) {
            if Arc::ptr_eq(arc, &self.entry) {
                let idle = arc.lock().unwrap().idle();
                // 2 == the table's own reference plus this guard's `entry`
                // field, which is about to be dropped with no successor.
                if idle && Arc::strong_count(arc) == 2 {
                    table.remove(&self.path);
                }
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn readers_share_access() {
        let lock = Arc::new(PathLock::new());
        let g1 = lock.read_lock("a").await;
        let g2 = lock.read_lock("a").await;
        drop(g1);
        drop(g2);
    }

    #[tokio::test]
    async fn writer_excludes_readers() {
        let lock = Arc::new(PathLock::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let w = lock.write_lock("a").await;
        let lock2 = lock.clone();
        let counter2 = counter.clone();
        let handle = tokio::spawn(async move {
            let _g = lock2.read_lock("a").await;
            counter2.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0, "reader must wait for writer");
        drop(w);
        handle.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn writer_not_starved_by_new_readers() {
        let lock = Arc::new(PathLock::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let r1 = lock.read_lock("a").await;

        let lock_w = lock.clone();
        let order_w = order.clone();
        let writer = tokio::spawn(async move {
            let _g = lock_w.write_lock("a").await;
            order_w.lock().unwrap().push("writer");
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let lock_r = lock.clone();
        let order_r = order.clone();
        let reader2 = tokio::spawn(async move {
            let _g = lock_r.read_lock("a").await;
            order_r.lock().unwrap().push("reader2");
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(r1);
        writer.await.unwrap();
        reader2.await.unwrap();

        let seen = order.lock().unwrap().clone();
        assert_eq!(seen, vec!["writer", "reader2"]);
    }

    #[tokio::test]
    async fn reclaims_idle_entry() {
        let lock = Arc::new(PathLock::new());
        {
            let _g = lock.write_lock("a").await;
        }
        assert!(lock.table.lock().unwrap().is_empty());
    }
}
