use log::debug;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use crate::fleet_management::lock;

/// Background tasks that remove themselves from the set when they finish.
///
/// Tasks are keyed by issue order, so two tasks spawned in the same instant never
/// collide. Whatever is still running can be aborted in one go.
pub struct TaskSet {
    name: &'static str,
    tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
    next: AtomicU64,
}

impl TaskSet {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            tasks: Mutex::new(HashMap::new()),
            next: AtomicU64::new(0),
        })
    }

    pub fn spawn<F>(self: &Arc<Self>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let seq = self.next.fetch_add(1, Ordering::SeqCst);
        let set = Arc::downgrade(self);

        // Inserted under the lock the task needs to remove itself, so removal always
        // happens after insertion
        let mut tasks = lock(&self.tasks);
        let task = tokio::spawn(async move {
            future.await;
            if let Some(set) = set.upgrade() {
                lock(&set.tasks).remove(&seq);
            }
        });
        tasks.insert(seq, task);
        debug!("Spawned {} task #{}", self.name, seq);
    }

    pub fn len(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aborts every task still running and returns how many there were.
    pub fn abort_all(&self) -> usize {
        let drained: Vec<JoinHandle<()>> = lock(&self.tasks).drain().map(|(_, t)| t).collect();
        for task in &drained {
            task.abort();
        }
        if !drained.is_empty() {
            debug!("Aborted {} pending {} task(s)", drained.len(), self.name);
        }
        drained.len()
    }
}
