use std::path::{Path, PathBuf};

/// Events an operator should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    StoreFull,
    ReadError { path: PathBuf, message: String },
    FileModifiedInFuture { path: PathBuf },
    BackupError { message: String },
    BackupOk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    StoreFull,
    FutureDated,
}

/// Progress callbacks. Observers never influence what the engine does.
pub trait SyncObserver {
    fn scan_started(&self, _path: &Path) {}
    fn upload_started(&self, _path: &Path, _size: u64) {}
    fn upload_failed(&self, _path: &Path, _error: &str) {}
    fn file_deferred(&self, _path: &Path, _deadline: i64) {}
    fn file_skipped(&self, _path: &Path, _reason: SkipReason) {}
    fn read_error(&self, _path: &Path, _error: &str) {}

    fn notify(&self, notification: &Notification) {
        match notification {
            Notification::StoreFull => {
                tracing::warn!("store is full; only deletions are sent until space is freed")
            }
            Notification::ReadError { path, message } => {
                tracing::warn!(path = %path.display(), error = %message, "could not read local entry")
            }
            Notification::FileModifiedInFuture { path } => {
                tracing::warn!(path = %path.display(), "file has a modification time in the future")
            }
            Notification::BackupError { message } => {
                tracing::error!(error = %message, "backup run failed")
            }
            Notification::BackupOk => tracing::info!("backup run finished"),
        }
    }
}

/// Logs progress at debug level and notifications through the default handler.
pub struct LogObserver;

impl SyncObserver for LogObserver {
    fn scan_started(&self, path: &Path) {
        tracing::debug!(path = %path.display(), "scanning");
    }

    fn upload_started(&self, path: &Path, size: u64) {
        tracing::debug!(path = %path.display(), size, "uploading");
    }

    fn upload_failed(&self, path: &Path, error: &str) {
        tracing::warn!(path = %path.display(), error, "upload failed");
    }

    fn file_deferred(&self, path: &Path, deadline: i64) {
        tracing::debug!(path = %path.display(), deadline, "recently modified; deferred");
    }

    fn file_skipped(&self, path: &Path, reason: SkipReason) {
        tracing::debug!(path = %path.display(), ?reason, "skipped");
    }
}
