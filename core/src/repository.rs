use crate::drive::DriveObject;
use crate::DriveError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

const WATCH_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Add,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub object: DriveObject,
}

/// Equality-based label selector. An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn with_label(key: &str, value: &str) -> Self {
        let mut match_labels = BTreeMap::new();
        match_labels.insert(key.to_string(), value.to_string());
        Self { match_labels }
    }

    pub fn matches(&self, drive: &DriveObject) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| drive.metadata.labels.get(k) == Some(v))
    }
}

/// Persistent store for drive objects with optimistic concurrency.
#[async_trait::async_trait]
pub trait DriveRepository: Send + Sync {
    async fn get(&self, name: &str) -> Result<DriveObject, DriveError>;

    async fn list(&self, selector: &LabelSelector) -> Result<Vec<DriveObject>, DriveError>;

    /// All drives whose `status.node_name` equals `node_name`.
    async fn list_by_node(&self, node_name: &str) -> Result<Vec<DriveObject>, DriveError>;

    /// Persists `drive`, failing with [`DriveError::Conflict`] when the stored
    /// object has moved past `drive.metadata.resource_version`.
    async fn update(&self, drive: &DriveObject) -> Result<DriveObject, DriveError>;

    async fn watch(&self, selector: &LabelSelector) -> Result<DriveWatch, DriveError>;
}

/// A filtered stream of repository change events.
pub struct DriveWatch {
    receiver: broadcast::Receiver<WatchEvent>,
    selector: LabelSelector,
}

impl DriveWatch {
    pub fn new(receiver: broadcast::Receiver<WatchEvent>, selector: LabelSelector) -> Self {
        Self { receiver, selector }
    }

    /// Next matching event, or `None` once the repository is gone.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.selector.matches(&event.object) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "drive watch lagged behind");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// In-process drive store with cluster object-store semantics: resource
/// versions, finalizer-gated deletion and change notifications.
pub struct MemoryDriveRepository {
    drives: Mutex<HashMap<String, DriveObject>>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryDriveRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriveRepository {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER_SIZE);
        Self {
            drives: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn with_drives(drives: impl IntoIterator<Item = DriveObject>) -> Result<Self, DriveError> {
        let repo = Self::new();
        for drive in drives {
            repo.create(drive)?;
        }
        Ok(repo)
    }

    /// Seeds a repository from a JSON array of drive objects.
    pub fn load_json(path: &Path) -> Result<Self, DriveError> {
        let content = std::fs::read_to_string(path)?;
        let drives: Vec<DriveObject> = serde_json::from_str(&content)?;
        Self::with_drives(drives)
    }

    pub fn save_json(&self, path: &Path) -> Result<(), DriveError> {
        let mut drives = self.snapshot();
        drives.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        std::fs::write(path, serde_json::to_string_pretty(&drives)?)?;
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<DriveObject> {
        self.lock().values().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub fn create(&self, mut drive: DriveObject) -> Result<DriveObject, DriveError> {
        let mut drives = self.lock();
        if drives.contains_key(drive.name()) {
            return Err(DriveError::AlreadyExists(drive.name().to_string()));
        }
        drive.metadata.resource_version = 1;
        drives.insert(drive.name().to_string(), drive.clone());
        self.publish(EventKind::Add, &drive);
        Ok(drive)
    }

    /// Requests deletion. Objects without finalizers go away at once; the rest
    /// are marked and wait for their finalizers to be cleared.
    pub fn delete(&self, name: &str) -> Result<(), DriveError> {
        let mut drives = self.lock();
        let finalized = drives
            .get(name)
            .map(|d| d.metadata.finalizers.is_empty())
            .ok_or_else(|| DriveError::NotFound(name.to_string()))?;

        if finalized {
            if let Some(drive) = drives.remove(name) {
                self.publish(EventKind::Delete, &drive);
            }
            return Ok(());
        }

        let Some(drive) = drives.get_mut(name) else {
            return Err(DriveError::NotFound(name.to_string()));
        };
        if drive.metadata.deletion_timestamp.is_none() {
            drive.metadata.deletion_timestamp = Some(Utc::now());
            drive.metadata.resource_version += 1;
        }
        let drive = drive.clone();
        self.publish(EventKind::Delete, &drive);
        Ok(())
    }

    /// Replaces an object regardless of its version, the way an external
    /// actor (an operator CLI, a discovery agent) would.
    pub fn replace(&self, mut drive: DriveObject) -> Result<DriveObject, DriveError> {
        let current = self.lock().get(drive.name()).map(|d| d.metadata.resource_version);
        match current {
            Some(version) => {
                drive.metadata.resource_version = version;
                self.store(&drive)
            }
            None => self.create(drive),
        }
    }

    fn store(&self, drive: &DriveObject) -> Result<DriveObject, DriveError> {
        let mut drives = self.lock();
        let name = drive.name().to_string();
        let stored = drives
            .get(&name)
            .ok_or_else(|| DriveError::NotFound(name.clone()))?;

        if stored.metadata.resource_version != drive.metadata.resource_version {
            return Err(DriveError::Conflict {
                name,
                stored: stored.metadata.resource_version,
                given: drive.metadata.resource_version,
            });
        }

        let mut updated = drive.clone();
        // Deletion requests are server-owned and cannot be withdrawn by a write.
        updated.metadata.deletion_timestamp = stored.metadata.deletion_timestamp;
        if updated == *stored {
            // Unchanged writes neither bump the version nor notify watchers.
            return Ok(updated);
        }
        updated.metadata.resource_version += 1;

        if updated.is_deletion_requested() && updated.metadata.finalizers.is_empty() {
            drives.remove(&name);
            self.publish(EventKind::Delete, &updated);
        } else {
            drives.insert(name, updated.clone());
            self.publish(EventKind::Update, &updated);
        }
        Ok(updated)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DriveObject>> {
        self.drives.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, kind: EventKind, drive: &DriveObject) {
        // No receivers is fine.
        let _ = self.events.send(WatchEvent {
            kind,
            object: drive.clone(),
        });
    }
}

#[async_trait::async_trait]
impl DriveRepository for MemoryDriveRepository {
    async fn get(&self, name: &str) -> Result<DriveObject, DriveError> {
        self.lock()
            .get(name)
            .cloned()
            .ok_or_else(|| DriveError::NotFound(name.to_string()))
    }

    async fn list(&self, selector: &LabelSelector) -> Result<Vec<DriveObject>, DriveError> {
        Ok(self
            .lock()
            .values()
            .filter(|d| selector.matches(d))
            .cloned()
            .collect())
    }

    async fn list_by_node(&self, node_name: &str) -> Result<Vec<DriveObject>, DriveError> {
        Ok(self
            .lock()
            .values()
            .filter(|d| d.node_name() == node_name)
            .cloned()
            .collect())
    }

    async fn update(&self, drive: &DriveObject) -> Result<DriveObject, DriveError> {
        self.store(drive)
    }

    async fn watch(&self, selector: &LabelSelector) -> Result<DriveWatch, DriveError> {
        Ok(DriveWatch::new(self.events.subscribe(), selector.clone()))
    }
}
