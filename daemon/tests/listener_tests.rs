use drivekeeper_core::test_utils::{format_request_drive, DeviceOp, MockDriveOps};
use drivekeeper_core::{
    CancellationToken, ControllerConfig, DriveError, DriveEventHandler, DriveLayout, DriveObject,
    DriveRepository, DriveStatus, EventHandler, EventKind, LabelSelector, MemoryDriveRepository,
};
use drivekeeper_daemon::{Listener, ListenerConfig};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn fast_config(selector: LabelSelector) -> ListenerConfig {
    ListenerConfig {
        workers: 4,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(10),
        selector,
    }
}

fn spawn_listener(
    listener: Listener,
    cancel: &CancellationToken,
) -> tokio::task::JoinHandle<Result<(), DriveError>> {
    let cancel = cancel.clone();
    tokio::spawn(async move { listener.run(cancel).await })
}

#[tokio::test]
async fn test_node_drives_are_reconciled_and_deleted() {
    let repo = Arc::new(
        MemoryDriveRepository::with_drives(vec![
            format_request_drive("d1", "n1", false),
            format_request_drive("d2", "n2", false),
        ])
        .unwrap(),
    );
    let ops = MockDriveOps::with_free_bytes(1_073_741_824);
    let handler = DriveEventHandler::new(
        "n1",
        repo.clone(),
        Arc::new(ops.clone()),
        Arc::new(ops.clone()),
        Arc::new(ops.clone()),
    )
    .with_layout(DriveLayout::new("/dev", "/mnt/drives"));

    let node_config = ControllerConfig {
        node_id: "n1".to_string(),
        ..ControllerConfig::default()
    };
    let config = ListenerConfig {
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(10),
        ..ListenerConfig::for_node(&node_config)
    };
    let listener = Listener::new("drives", Arc::new(handler), repo.clone(), config);
    let cancel = CancellationToken::new();
    let running = spawn_listener(listener, &cancel);

    wait_for("d1 to become ready", || {
        repo.snapshot()
            .iter()
            .any(|d| d.name() == "d1" && d.status.drive_status == DriveStatus::Ready)
    })
    .await;

    let other = repo.get("d2").await.unwrap();
    assert_eq!(other.status.drive_status, DriveStatus::Available);
    assert!(other.spec.requested_format.is_some());
    assert_eq!(ops.count(DeviceOp::Format), 1);

    repo.delete("d1").unwrap();
    wait_for("d1 to be removed", || !repo.contains("d1")).await;
    assert_eq!(ops.count(DeviceOp::Unmount), 1);

    cancel.cancel();
    running.await.unwrap().unwrap();
}

/// Records overlapping invocations for the same drive.
#[derive(Default)]
struct SlowHandler {
    busy: AtomicBool,
    overlapped: AtomicBool,
    handled: AtomicUsize,
}

#[async_trait::async_trait]
impl EventHandler for SlowHandler {
    async fn handle(
        &self,
        _cancel: &CancellationToken,
        _kind: EventKind,
        _drive: DriveObject,
    ) -> Result<(), DriveError> {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.busy.store(false, Ordering::SeqCst);
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_events_for_one_drive_never_overlap() {
    let repo = Arc::new(
        MemoryDriveRepository::with_drives(vec![DriveObject::new("d1", "n1", 8, 0, 100)]).unwrap(),
    );
    let handler = Arc::new(SlowHandler::default());
    let listener = Listener::new(
        "drives",
        handler.clone(),
        repo.clone(),
        fast_config(LabelSelector::everything()),
    );
    let cancel = CancellationToken::new();
    let running = spawn_listener(listener, &cancel);

    for capacity in 101..121 {
        let mut drive = repo.get("d1").await.unwrap();
        drive.status.total_capacity = capacity;
        repo.replace(drive).unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    wait_for("the last update to be handled", || {
        handler.handled.load(Ordering::SeqCst) >= 2 && !handler.busy.load(Ordering::SeqCst)
    })
    .await;
    assert!(!handler.overlapped.load(Ordering::SeqCst));

    cancel.cancel();
    running.await.unwrap().unwrap();
}

/// Fails a fixed number of times before succeeding, remembering what it saw.
struct FlakyHandler {
    failures_left: AtomicUsize,
    error: fn() -> DriveError,
    seen: Mutex<Vec<(EventKind, u64)>>,
}

impl FlakyHandler {
    fn new(failures: usize, error: fn() -> DriveError) -> Self {
        Self {
            failures_left: AtomicUsize::new(failures),
            error,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl EventHandler for FlakyHandler {
    async fn handle(
        &self,
        _cancel: &CancellationToken,
        kind: EventKind,
        drive: DriveObject,
    ) -> Result<(), DriveError> {
        self.seen
            .lock()
            .unwrap()
            .push((kind, drive.status.total_capacity));
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err((self.error)());
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_transient_failures_are_retried_with_latest_object() {
    let repo = Arc::new(
        MemoryDriveRepository::with_drives(vec![DriveObject::new("d1", "n1", 8, 0, 100)]).unwrap(),
    );
    let handler = Arc::new(FlakyHandler::new(2, || {
        DriveError::device("mount", "d1", "device busy")
    }));
    let listener = Listener::new(
        "drives",
        handler.clone(),
        repo.clone(),
        fast_config(LabelSelector::everything()),
    );
    let cancel = CancellationToken::new();
    let running = spawn_listener(listener, &cancel);

    wait_for("three deliveries", || handler.calls() >= 3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let seen = handler.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 3, "retries stop after the first success");
    assert_eq!(seen[0].0, EventKind::Add);
    assert_eq!(seen[1].0, EventKind::Update);

    cancel.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_terminal_failures_are_not_retried() {
    let repo = Arc::new(
        MemoryDriveRepository::with_drives(vec![DriveObject::new("d1", "n1", 8, 0, 100)]).unwrap(),
    );
    let handler = Arc::new(FlakyHandler::new(usize::MAX, || DriveError::InvalidFinalizer {
        drive: "d1".to_string(),
        finalizer: "example.com/other".to_string(),
    }));
    let listener = Listener::new(
        "drives",
        handler.clone(),
        repo.clone(),
        fast_config(LabelSelector::everything()),
    );
    let cancel = CancellationToken::new();
    let running = spawn_listener(listener, &cancel);

    wait_for("first delivery", || handler.calls() >= 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.calls(), 1);

    cancel.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_deletion_marked_drives_are_listed_as_delete() {
    let mut drive = DriveObject::new("d1", "n1", 8, 0, 100);
    drive.metadata.finalizers = vec!["example.com/keep".to_string()];
    let repo = Arc::new(MemoryDriveRepository::with_drives(vec![drive]).unwrap());
    repo.delete("d1").unwrap();

    let handler = Arc::new(FlakyHandler::new(0, || DriveError::Other(String::new())));
    let listener = Listener::new(
        "drives",
        handler.clone(),
        repo.clone(),
        fast_config(LabelSelector::everything()),
    );
    let cancel = CancellationToken::new();
    let running = spawn_listener(listener, &cancel);

    wait_for("first delivery", || handler.calls() >= 1).await;
    assert_eq!(handler.seen.lock().unwrap()[0].0, EventKind::Delete);

    cancel.cancel();
    running.await.unwrap().unwrap();
}

/// Persists a status change and fails on its first call, like an engine pass
/// that records conditions before reporting a device error.
struct WritingHandler {
    repo: Arc<MemoryDriveRepository>,
    seen: Mutex<Vec<(EventKind, u64)>>,
}

#[async_trait::async_trait]
impl EventHandler for WritingHandler {
    async fn handle(
        &self,
        _cancel: &CancellationToken,
        kind: EventKind,
        mut drive: DriveObject,
    ) -> Result<(), DriveError> {
        let first = {
            let mut seen = self.seen.lock().unwrap();
            seen.push((kind, drive.metadata.resource_version));
            seen.len() == 1
        };
        if first {
            drive.status.free_capacity = 7;
            self.repo.update(&drive).await?;
            return Err(DriveError::device("mount", drive.name(), "device busy"));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_write_from_failed_pass_is_delivered_before_backoff() {
    let repo = Arc::new(
        MemoryDriveRepository::with_drives(vec![DriveObject::new("d1", "n1", 8, 0, 100)]).unwrap(),
    );
    let handler = Arc::new(WritingHandler {
        repo: repo.clone(),
        seen: Mutex::new(Vec::new()),
    });
    let listener = Listener::new(
        "drives",
        handler.clone(),
        repo.clone(),
        ListenerConfig {
            workers: 2,
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(30),
            selector: LabelSelector::everything(),
        },
    );
    let cancel = CancellationToken::new();
    let running = spawn_listener(listener, &cancel);

    wait_for("the written version to be delivered", || {
        handler.seen.lock().unwrap().len() >= 2
    })
    .await;

    let seen = handler.seen.lock().unwrap().clone();
    assert_eq!(seen[0], (EventKind::Add, 1));
    assert_eq!(seen[1], (EventKind::Update, 2));

    cancel.cancel();
    running.await.unwrap().unwrap();
}
