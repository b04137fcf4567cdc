use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::persist::{StateFile, StoredAllocation, write_state};

type Snapshot = dyn Fn() -> Vec<StoredAllocation> + Send + Sync;

struct SaverInner {
    path: PathBuf,
    emulated: bool,
    snapshot: Box<Snapshot>,
    dirty: AtomicBool,
    notify: Notify,
}

impl SaverInner {
    async fn save_if_dirty(self: &Arc<Self>) {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return;
        }
        let state = StateFile {
            emulated: self.emulated,
            allocations: (self.snapshot)(),
        };
        let inner = self.clone();
        let result = tokio::task::spawn_blocking(move || write_state(&inner.path, &state)).await;
        let error = match result {
            Ok(Ok(())) => return,
            Ok(Err(error)) => error.to_string(),
            Err(error) => error.to_string(),
        };
        log::error!("Cannot save state to {}: {error}", self.path.display());
        self.dirty.store(true, Ordering::SeqCst);
    }
}

/// Writes the state file in the background. Save requests arriving within the
/// debounce period are coalesced into a single write.
pub struct StateSaver {
    inner: Arc<SaverInner>,
    stop: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StateSaver {
    pub fn start(
        path: PathBuf,
        emulated: bool,
        debounce: Duration,
        snapshot: impl Fn() -> Vec<StoredAllocation> + Send + Sync + 'static,
    ) -> Self {
        let inner = Arc::new(SaverInner {
            path,
            emulated,
            snapshot: Box::new(snapshot),
            dirty: AtomicBool::new(false),
            notify: Notify::new(),
        });
        let stop = CancellationToken::new();
        let handle = tokio::spawn(saver_process(inner.clone(), stop.clone(), debounce));
        Self {
            inner,
            stop,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn request_save(&self) {
        self.inner.dirty.store(true, Ordering::SeqCst);
        self.inner.notify.notify_one();
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::SeqCst)
    }

    /// Stops the background task after writing any pending change.
    pub async fn stop(&self) {
        self.stop.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                log::error!("State saver failed: {error}");
            }
        }
    }
}

async fn saver_process(inner: Arc<SaverInner>, stop: CancellationToken, debounce: Duration) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = inner.notify.notified() => {}
        }
        tokio::select! {
            _ = stop.cancelled() => {}
            _ = tokio::time::sleep(debounce) => {}
        }
        inner.save_if_dirty().await;
        if stop.is_cancelled() {
            break;
        }
    }
    inner.save_if_dirty().await;
}
