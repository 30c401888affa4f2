use crate::queue::{WorkItem, WorkQueue};
use drivekeeper_core::drive::sanitize_label_value;
use drivekeeper_core::{
    ControllerConfig, DriveError, DriveObject, DriveRepository, EventHandler, EventKind,
    LabelSelector, NODE_LABEL,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub workers: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub selector: LabelSelector,
}

impl ListenerConfig {
    /// Watches the drives labelled for `config.node_id`.
    pub fn for_node(config: &ControllerConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            initial_backoff: config.retry_initial_backoff(),
            max_backoff: config.retry_max_backoff(),
            selector: LabelSelector::with_label(NODE_LABEL, &sanitize_label_value(&config.node_id)),
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            workers: 40,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            selector: LabelSelector::everything(),
        }
    }
}

/// List-watch event dispatcher.
///
/// Delivers every drive matching the selector to the handler, first as an
/// `Add` from the initial listing and then as watch events arrive. Distinct
/// drives are handled concurrently by a fixed pool of workers; one drive is
/// never handled by two workers at once. Retryable failures are redelivered
/// after a capped exponential backoff using the latest stored object.
///
/// A failing handler that still persists something (the engine writes its
/// conditions before returning the error) produces a watch event of its own.
/// That event is delivered as soon as the worker releases the drive, ahead
/// of the backoff; the backoff retry still fires later and is harmless
/// because handlers are state driven.
pub struct Listener {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    handler: Arc<dyn EventHandler>,
    repository: Arc<dyn DriveRepository>,
    config: ListenerConfig,
    queue: WorkQueue,
    attempts: Mutex<HashMap<String, u32>>,
}

impl Listener {
    pub fn new(
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        repository: Arc<dyn DriveRepository>,
        config: ListenerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                handler,
                repository,
                config,
                queue: WorkQueue::new(),
                attempts: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Runs until `cancel` fires or the watch closes.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), DriveError> {
        let inner = &self.inner;
        let mut watch = inner.repository.watch(&inner.config.selector).await?;

        let existing = inner.repository.list(&inner.config.selector).await?;
        info!(
            listener = %inner.name,
            drives = existing.len(),
            workers = inner.config.workers,
            "starting listener"
        );
        for drive in existing {
            inner.enqueue(EventKind::Add, drive);
        }

        let mut workers = JoinSet::new();
        for id in 0..inner.config.workers {
            workers.spawn(worker(inner.clone(), id, cancel.clone()));
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = watch.recv() => match event {
                    Some(event) => inner.enqueue(event.kind, event.object),
                    None => {
                        warn!(listener = %inner.name, "drive watch closed");
                        break;
                    }
                },
            }
        }

        inner.queue.shutdown();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(listener = %inner.name, error = %e, "worker task failed");
            }
        }
        info!(listener = %inner.name, "listener stopped");
        Ok(())
    }
}

impl Inner {
    fn enqueue(&self, kind: EventKind, drive: DriveObject) {
        self.queue.add(WorkItem::new(effective_kind(kind, &drive), drive));
    }

    fn next_backoff(&self, name: &str) -> Duration {
        let mut attempts = self.lock_attempts();
        let attempt = attempts.entry(name.to_string()).or_insert(0);
        let delay = self
            .config
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(*attempt))
            .min(self.config.max_backoff);
        *attempt = attempt.saturating_add(1);
        delay
    }

    fn forget(&self, name: &str) {
        self.lock_attempts().remove(name);
    }

    fn lock_attempts(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.attempts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A drive marked for deletion is always delivered as `Delete`, whatever
/// notification carried it.
fn effective_kind(kind: EventKind, drive: &DriveObject) -> EventKind {
    if drive.is_deletion_requested() {
        EventKind::Delete
    } else {
        kind
    }
}

async fn worker(inner: Arc<Inner>, id: usize, cancel: CancellationToken) {
    while let Some(item) = inner.queue.next().await {
        let name = item.name().to_string();
        if cancel.is_cancelled() {
            inner.queue.done(&name);
            break;
        }

        debug!(worker = id, drive = %name, kind = ?item.kind, "handling drive event");
        match inner.handler.handle(&cancel, item.kind, item.object).await {
            Ok(()) => inner.forget(&name),
            Err(DriveError::Cancelled) => {}
            Err(e) if e.is_retryable() => {
                let delay = inner.next_backoff(&name);
                warn!(drive = %name, error = %e, retry_in = ?delay, "drive event failed, will retry");
                schedule_retry(inner.clone(), name.clone(), delay, cancel.clone());
            }
            Err(e @ DriveError::UnknownUpdateIntent(_)) => {
                inner.forget(&name);
                debug!(drive = %name, error = %e, "ignoring drive event");
            }
            Err(e) => {
                inner.forget(&name);
                error!(drive = %name, error = %e, "drive event failed, operator action required");
            }
        }
        inner.queue.done(&name);
    }
    debug!(worker = id, "worker stopped");
}

/// Redelivers `name` after `delay`, re-reading it so the handler always
/// works from the latest stored state.
fn schedule_retry(inner: Arc<Inner>, name: String, mut delay: Duration, cancel: CancellationToken) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match inner.repository.get(&name).await {
                Ok(drive) => {
                    let kind = effective_kind(EventKind::Update, &drive);
                    if !inner.queue.add_if_absent(WorkItem::new(kind, drive)) {
                        debug!(drive = %name, "newer event already queued, dropping retry");
                    }
                    return;
                }
                Err(DriveError::NotFound(_)) => {
                    debug!(drive = %name, "drive gone, dropping retry");
                    inner.forget(&name);
                    return;
                }
                Err(e) => {
                    delay = inner.next_backoff(&name);
                    warn!(drive = %name, error = %e, retry_in = ?delay, "failed to re-read drive for retry");
                }
            }
        }
    });
}
