//! Rebuilds a stored directory tree on local disk.
//!
//! Progress is checkpointed to a resume file next to the destination after
//! every [`QUANTUM`] bytes written, so an interrupted restore continues where
//! the last checkpoint left off instead of fetching objects again.

pub mod checkpoint;

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use coffer_core::codec::decode_object;
use coffer_core::{
    CodecError, CryptoError, DirectoryEntry, EntryKind, FileAttributes, ListFilter, ObjectId,
    StoreConnector, StoreError, StoreKeys, StoreSession,
};
use thiserror::Error;

use crate::connection::{ConnectionContext, ConnectionError};
use crate::sync::local;
use checkpoint::{Checkpoint, CheckpointError};

/// Bytes written between checkpoint saves.
pub const QUANTUM: u64 = 128 * 1024;

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("cannot decode object {id}: {source}")]
    Codec {
        id: ObjectId,
        #[source]
        source: CodecError,
    },
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("stop requested")]
    Cancelled,
}

impl From<StoreError> for RestoreError {
    fn from(err: StoreError) -> Self {
        RestoreError::Connection(err.into())
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> RestoreError + '_ {
    move |source| RestoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    pub restore_deleted: bool,
    pub undelete_after: bool,
    pub allow_resume: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    Complete,
    /// The destination exists and a resume file was found, but resuming was not allowed.
    ResumePossible,
    /// The destination exists and there is no usable resume state.
    TargetExists,
}

/// Restores directory `directory_id` into `destination`.
///
/// The caller owns the connection and closes it afterwards.
pub async fn restore<C: StoreConnector>(
    connection: &mut ConnectionContext<C>,
    directory_id: ObjectId,
    destination: &Path,
    options: RestoreOptions,
    stop: &AtomicBool,
) -> Result<RestoreOutcome, RestoreError> {
    let resume_path = Checkpoint::resume_path(destination);
    let checkpoint = if local::path_exists(destination).await {
        if !local::path_exists(&resume_path).await {
            return Ok(RestoreOutcome::TargetExists);
        }
        if !options.allow_resume {
            return Ok(RestoreOutcome::ResumePossible);
        }
        match Checkpoint::load(resume_path).await {
            Ok(checkpoint) => {
                tracing::info!(path = %checkpoint.path().display(), "resuming restore");
                checkpoint
            }
            Err(err) => {
                tracing::warn!(error = %err, "resume file unusable; refusing to overwrite target");
                return Ok(RestoreOutcome::TargetExists);
            }
        }
    } else {
        Checkpoint::fresh(resume_path)
    };

    let keys = connection.keys().clone();
    let mut run = RestoreRun {
        connection,
        keys,
        options,
        stop,
        checkpoint,
        files_restored: 0,
    };
    if let Err(err) = run.restore_directory(directory_id, destination, 0).await {
        if let Err(save_err) = run.checkpoint.save().await {
            tracing::warn!(error = %save_err, "failed to save restore checkpoint");
        }
        return Err(err);
    }

    if options.undelete_after {
        run.connection
            .get_connection()
            .await?
            .undelete_directory(directory_id)
            .await?;
        tracing::info!(id = %directory_id, "undeleted restored directory on the server");
    }
    tracing::info!(
        files = run.files_restored,
        destination = %destination.display(),
        "restore complete"
    );
    run.checkpoint.remove().await?;
    Ok(RestoreOutcome::Complete)
}

struct RestoreRun<'a, C: StoreConnector> {
    connection: &'a mut ConnectionContext<C>,
    keys: StoreKeys,
    options: RestoreOptions,
    stop: &'a AtomicBool,
    checkpoint: Checkpoint,
    files_restored: u64,
}

impl<C: StoreConnector> RestoreRun<'_, C> {
    async fn restore_directory(
        &mut self,
        directory_id: ObjectId,
        local_path: &Path,
        depth: usize,
    ) -> Result<(), RestoreError> {
        if self.stop.load(Ordering::SeqCst) {
            return Err(RestoreError::Cancelled);
        }

        if let Some(next) = self.checkpoint.level_mut(depth).next.clone() {
            let child_path = local_path.join(&next.name);
            Box::pin(self.restore_directory(next.id, &child_path, depth + 1)).await?;
            self.checkpoint.leave(depth, next.id);
        }
        self.checkpoint.save().await?;

        ensure_directory(local_path).await?;

        let filter = ListFilter::with_deleted(self.options.restore_deleted);
        let listing = self
            .connection
            .get_connection()
            .await?
            .list_directory(directory_id, filter)
            .await?;

        let mut subdirectories = Vec::new();
        for entry in &listing.entries {
            if self.checkpoint.is_restored(depth, entry.id) {
                continue;
            }
            let name = self.keys.decrypt_name(&entry.name)?;
            match entry.kind {
                EntryKind::File => {
                    let written = self.restore_file(entry, &local_path.join(&name)).await?;
                    self.checkpoint.mark_restored(depth, entry.id, written);
                    self.files_restored += 1;
                    if self.checkpoint.unsaved_bytes() >= QUANTUM {
                        self.checkpoint.save().await?;
                    }
                }
                EntryKind::Dir => subdirectories.push((entry.id, name)),
            }
        }

        for (id, name) in subdirectories {
            self.checkpoint.enter(depth, id, &name);
            Box::pin(self.restore_directory(id, &local_path.join(&name), depth + 1)).await?;
            self.checkpoint.leave(depth, id);
        }

        if let Some(sealed) = listing.attributes.as_deref() {
            let attributes = self.keys.open_attributes(sealed)?;
            apply_attributes(local_path, &attributes).await?;
        }
        Ok(())
    }

    /// Returns the number of content bytes written.
    async fn restore_file(
        &mut self,
        entry: &DirectoryEntry,
        target: &Path,
    ) -> Result<u64, RestoreError> {
        remove_stale(target).await?;

        let stream = self
            .connection
            .get_connection()
            .await?
            .get_object(entry.id)
            .await?;
        let decoded = decode_object(&self.keys, &stream).map_err(|source| RestoreError::Codec {
            id: entry.id,
            source,
        })?;
        let attributes = match entry.attributes.as_deref() {
            Some(sealed) => self.keys.open_attributes(sealed)?,
            None => decoded.attributes,
        };

        if let Some(link_target) = attributes.symlink_target.as_deref() {
            tokio::fs::symlink(link_target, target)
                .await
                .map_err(io_error(target))?;
            chown_best_effort(target, &attributes);
            return Ok(0);
        }

        let staging = self.checkpoint.staging_path();
        tokio::fs::write(&staging, &decoded.content)
            .await
            .map_err(io_error(&staging))?;
        tokio::fs::rename(&staging, target)
            .await
            .map_err(io_error(target))?;
        apply_attributes(target, &attributes).await?;
        tracing::debug!(path = %target.display(), bytes = decoded.content.len(), "restored");
        Ok(decoded.content.len() as u64)
    }
}

async fn ensure_directory(path: &Path) -> Result<(), RestoreError> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) if metadata.is_dir() => return Ok(()),
        Ok(_) => {
            tracing::warn!(path = %path.display(), "replacing non-directory with restored directory");
            tokio::fs::remove_file(path)
                .await
                .map_err(io_error(path))?;
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(io_error(path)(err)),
    }
    tokio::fs::create_dir_all(path)
        .await
        .map_err(io_error(path))
}

async fn remove_stale(path: &Path) -> Result<(), RestoreError> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(io_error(path)(err)),
    };
    tracing::debug!(path = %path.display(), "removing stale local copy");
    let removed = if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    removed.map_err(io_error(path))
}

async fn apply_attributes(path: &Path, attributes: &FileAttributes) -> Result<(), RestoreError> {
    let modified = system_time(attributes.mod_time);
    let file = tokio::fs::File::open(path)
        .await
        .map_err(io_error(path))?
        .into_std()
        .await;
    file.set_modified(modified).map_err(io_error(path))?;
    drop(file);
    chown_best_effort(path, attributes);
    tokio::fs::set_permissions(
        path,
        std::fs::Permissions::from_mode(attributes.mode & 0o7777),
    )
    .await
    .map_err(io_error(path))
}

fn chown_best_effort(path: &Path, attributes: &FileAttributes) {
    if let Err(err) = std::os::unix::fs::lchown(path, Some(attributes.uid), Some(attributes.gid)) {
        tracing::trace!(path = %path.display(), error = %err, "ownership not restored");
    }
}

fn system_time(micros: i64) -> SystemTime {
    let offset = Duration::from_micros(micros.unsigned_abs());
    if micros >= 0 {
        UNIX_EPOCH + offset
    } else {
        UNIX_EPOCH - offset
    }
}
