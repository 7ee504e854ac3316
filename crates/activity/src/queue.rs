//! Named in-process task queues.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::task::ActivityTask;

/// An ordered, named channel of activity tasks.
///
/// Any number of workers may poll the same queue. Each push is handed to
/// exactly one poller: the pop happens under the queue lock, and there is
/// no await point between popping and returning.
#[derive(Debug)]
pub struct TaskQueue {
    name: String,
    tasks: Mutex<VecDeque<ActivityTask>>,
    notify: Notify,
    closed: AtomicBool,
}

impl TaskQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn push(&self, task: ActivityTask) {
        self.tasks.lock().push_back(task);
        self.notify.notify_one();
    }

    /// Pops the next task without waiting.
    pub fn try_poll(&self) -> Option<ActivityTask> {
        self.tasks.lock().pop_front()
    }

    /// Waits for the next task. Returns None once the queue is closed and empty.
    pub async fn poll(&self) -> Option<ActivityTask> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.try_poll() {
                return Some(task);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wakes every poller; polls return None once the backlog is drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Lookup of task queues by name, creating them on first use so the
/// scheduling side and the polling side can start in any order.
#[derive(Debug, Clone, Default)]
pub struct TaskQueueRegistry {
    queues: Arc<RwLock<HashMap<String, Arc<TaskQueue>>>>,
}

impl TaskQueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, name: &str) -> Arc<TaskQueue> {
        if let Some(queue) = self.queues.read().get(name) {
            return queue.clone();
        }
        self.queues
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(TaskQueue::new(name)))
            .clone()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.queues.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn close_all(&self) {
        for queue in self.queues.read().values() {
            queue.close();
        }
    }
}
