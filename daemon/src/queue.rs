//! Key-coalescing work queue.
//!
//! At most one event per drive name is pending at a time (the newest one
//! wins) and a name is handed to at most one worker at a time. Events that
//! arrive while their name is being handled wait until [`WorkQueue::done`].

use drivekeeper_core::{DriveObject, EventKind};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub struct WorkItem {
    pub kind: EventKind,
    pub object: DriveObject,
}

impl WorkItem {
    pub fn new(kind: EventKind, object: DriveObject) -> Self {
        Self { kind, object }
    }

    pub fn name(&self) -> &str {
        self.object.name()
    }
}

#[derive(Default)]
struct QueueState {
    order: VecDeque<String>,
    pending: HashMap<String, WorkItem>,
    active: HashSet<String>,
    shutdown: bool,
}

#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `item`, replacing any event still pending for the same name.
    pub fn add(&self, item: WorkItem) {
        self.insert(item, true);
    }

    /// Queues `item` unless an event for the same name is already pending.
    /// Returns whether the item was queued.
    pub fn add_if_absent(&self, item: WorkItem) -> bool {
        self.insert(item, false)
    }

    fn insert(&self, item: WorkItem, replace: bool) -> bool {
        let name = item.name().to_string();
        let mut state = self.lock();
        if state.shutdown {
            return false;
        }
        if state.pending.contains_key(&name) {
            if replace {
                state.pending.insert(name, item);
            }
            return replace;
        }

        state.pending.insert(name.clone(), item);
        if !state.active.contains(&name) {
            state.order.push_back(name);
            drop(state);
            self.notify.notify_one();
        }
        true
    }

    /// Waits for the next item; `None` after [`WorkQueue::shutdown`].
    pub async fn next(&self) -> Option<WorkItem> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                while let Some(name) = state.order.pop_front() {
                    if let Some(item) = state.pending.remove(&name) {
                        state.active.insert(name);
                        return Some(item);
                    }
                }
                if state.shutdown {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks `name` as no longer in flight, requeueing anything that arrived
    /// for it in the meantime.
    pub fn done(&self, name: &str) {
        let mut state = self.lock();
        state.active.remove(name);
        if state.pending.contains_key(name) && !state.shutdown {
            state.order.push_back(name.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().active.len()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
