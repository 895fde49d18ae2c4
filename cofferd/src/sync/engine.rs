use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use coffer_core::codec::{encode_object, encode_patch};
use coffer_core::{
    DirectoryEntry, EncodedName, EntryKind, FileAttributes, ListFilter, ObjectId, ObjectUpload,
    ROOT_DIRECTORY_ID, StoreConnector, StoreError, StoreKeys, StoreSession,
};
use thiserror::Error;

use super::exclude::ExclusionEngine;
use super::inode_map::{InodeEntry, InodeMap, InodeMapError};
use super::local::{self, LocalEntry, LocalKind};
use super::observer::{Notification, SkipReason, SyncObserver};
use super::record::{DirectoryRecord, digest_entries};
use crate::connection::{ConnectionContext, ConnectionError, ResolvedPath};
use crate::micros;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("inode map error: {0}")]
    InodeMap(#[from] InodeMapError),
    #[error("stop requested")]
    Cancelled,
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        EngineError::Connection(err.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncParams {
    pub min_file_age: Duration,
    pub max_upload_wait: Duration,
    pub max_future_skew: Duration,
    /// Files at least this large are tracked by inode for rename detection.
    pub tracking_size_threshold: u64,
    /// Files larger than this are uploaded as a patch against their previous version.
    pub diffing_size_threshold: u64,
}

impl Default for SyncParams {
    fn default() -> Self {
        Self {
            min_file_age: Duration::from_secs(6 * 60 * 60),
            max_upload_wait: Duration::from_secs(24 * 60 * 60),
            max_future_skew: Duration::from_secs(2 * 24 * 60 * 60),
            tracking_size_threshold: 64 * 1024,
            diffing_size_threshold: 8 * 1024,
        }
    }
}

/// Modification times (µs) a run treats as settled: `start` is the end of the
/// previous run, files changed after `end` are still considered in flux.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncWindow {
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub files_uploaded: u64,
    pub bytes_uploaded: u64,
    pub files_deferred: u64,
    pub renames: u64,
    pub deletions: u64,
    pub errors: u64,
}

impl SyncReport {
    fn absorb(&mut self, other: SyncReport) {
        self.files_uploaded += other.files_uploaded;
        self.bytes_uploaded += other.bytes_uploaded;
        self.files_deferred += other.files_deferred;
        self.renames += other.renames;
        self.deletions += other.deletions;
        self.errors += other.errors;
    }
}

/// One configured backup location and what is remembered about it.
pub struct Location {
    pub name: String,
    pub path: PathBuf,
    pub exclusions: ExclusionEngine,
    pub record: DirectoryRecord,
}

impl Location {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, exclusions: ExclusionEngine) -> Self {
        let name = name.into();
        Self {
            record: DirectoryRecord::new(name.clone()),
            name,
            path: path.into(),
            exclusions,
        }
    }
}

/// Syncs every location, then commits or discards the new inode generation
/// and closes the connection.
pub async fn run_backup<C: StoreConnector>(
    connection: &mut ConnectionContext<C>,
    inode_map: &mut InodeMap,
    locations: &mut [Location],
    params: SyncParams,
    last_sync_end: Option<i64>,
    stop: &AtomicBool,
    observer: &dyn SyncObserver,
) -> Result<SyncReport, EngineError> {
    connection.start_run();
    inode_map.begin_run().await?;

    let result = {
        let mut ctx = SyncContext::new(params, last_sync_end, connection, inode_map, stop, observer);
        let mut total = SyncReport::default();
        let mut outcome = Ok(());
        for location in locations.iter_mut() {
            match ctx.sync_location(location).await {
                Ok(report) => total.absorb(report),
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }
        outcome.map(|()| total)
    };

    match &result {
        Ok(report) => {
            inode_map.commit().await?;
            tracing::info!(
                uploaded = report.files_uploaded,
                bytes = report.bytes_uploaded,
                deferred = report.files_deferred,
                renames = report.renames,
                deletions = report.deletions,
                errors = report.errors,
                "backup run complete"
            );
        }
        Err(err) => {
            if let Err(discard_err) = inode_map.discard().await {
                tracing::warn!(error = %discard_err, "failed to discard inode map generation");
            }
            tracing::warn!(error = %err, "backup run aborted");
        }
    }
    connection.close_any_open_connection().await;
    result
}

pub struct SyncContext<'a, C: StoreConnector> {
    params: SyncParams,
    window: SyncWindow,
    now: i64,
    future_limit: i64,
    warned_future: bool,
    store_full_notified: bool,
    read_error_notified: bool,
    keys: StoreKeys,
    connection: &'a mut ConnectionContext<C>,
    inode_map: &'a mut InodeMap,
    stop: &'a AtomicBool,
    observer: &'a dyn SyncObserver,
    report: SyncReport,
}

impl<'a, C: StoreConnector> SyncContext<'a, C> {
    pub fn new(
        params: SyncParams,
        last_sync_end: Option<i64>,
        connection: &'a mut ConnectionContext<C>,
        inode_map: &'a mut InodeMap,
        stop: &'a AtomicBool,
        observer: &'a dyn SyncObserver,
    ) -> Self {
        let now = crate::now_micros();
        let window = SyncWindow {
            start: last_sync_end.unwrap_or(0),
            end: now - micros(params.min_file_age),
        };
        let future_limit = now + micros(params.max_future_skew);
        let keys = connection.keys().clone();
        Self {
            params,
            window,
            now,
            future_limit,
            warned_future: false,
            store_full_notified: false,
            read_error_notified: false,
            keys,
            connection,
            inode_map,
            stop,
            observer,
            report: SyncReport::default(),
        }
    }

    pub async fn sync_location(&mut self, location: &mut Location) -> Result<SyncReport, EngineError> {
        self.check_stop()?;
        self.report = SyncReport::default();
        tracing::info!(
            location = %location.name,
            path = %location.path.display(),
            window_start = self.window.start,
            window_end = self.window.end,
            "syncing location"
        );
        self.connection
            .add_location(location.name.clone(), location.path.clone());

        let Location {
            name,
            path,
            exclusions,
            record,
        } = location;
        record.clear_synced_flags();

        if !local::path_exists(path).await {
            let err = io::Error::new(io::ErrorKind::NotFound, "location path is missing");
            self.read_error(path, &err);
            return Ok(std::mem::take(&mut self.report));
        }

        if record.object_id.is_none() {
            let encoded = self.keys.encrypt_name(name).map_err(ConnectionError::from)?;
            let listing = self
                .session()
                .await?
                .list_directory(ROOT_DIRECTORY_ID, ListFilter::current_only())
                .await?;
            if let Some(existing) = listing
                .find(&encoded)
                .filter(|entry| entry.kind == EntryKind::Dir)
            {
                tracing::info!(location = %name, id = %existing.id, "found existing location directory");
                record.object_id = Some(existing.id);
            }
        }

        self.sync_directory(record, ROOT_DIRECTORY_ID, path, exclusions)
            .await?;
        self.report.deletions += self.connection.perform_deletions().await? as u64;
        Ok(std::mem::take(&mut self.report))
    }

    async fn sync_directory(
        &mut self,
        record: &mut DirectoryRecord,
        containing: ObjectId,
        local_path: &Path,
        exclusions: &ExclusionEngine,
    ) -> Result<(), EngineError> {
        self.check_stop()?;
        self.observer.scan_started(local_path);

        let dir_attributes = match local::directory_attributes(local_path).await {
            Ok(attributes) => attributes,
            Err(err) => {
                self.read_error(local_path, &err);
                return Ok(());
            }
        };
        let (entries, failures) = match local::read_directory(local_path).await {
            Ok(listing) => listing,
            Err(err) => {
                self.read_error(local_path, &err);
                return Ok(());
            }
        };
        let mut incomplete = !failures.is_empty();
        for failure in &failures {
            self.read_error(&failure.path, &failure.error);
        }

        let entries: Vec<LocalEntry> = entries
            .into_iter()
            .filter(|entry| match entry.kind {
                LocalKind::Other => {
                    tracing::debug!(path = %entry.path.display(), "skipping special file");
                    false
                }
                kind => !exclusions.is_excluded(&entry.path, kind == LocalKind::Directory),
            })
            .collect();
        let keys = &self.keys;
        let digest = digest_entries(&entries, |entry| {
            keys.attributes_hash(&entry.name, &entry.attributes)
        });

        let directory_id = match record.object_id {
            Some(id) => id,
            None => {
                let Some(id) = self
                    .create_remote_directory(containing, &record.name, &dir_attributes, local_path)
                    .await?
                else {
                    return Ok(());
                };
                record.reset_remote();
                record.object_id = Some(id);
                id
            }
        };

        let unchanged = record.initial_sync_done
            && record.pending.is_none()
            && record.digest == Some(digest)
            && entries
                .iter()
                .filter(|entry| entry.kind == LocalKind::Directory)
                .all(|entry| {
                    record
                        .children
                        .get(&entry.name)
                        .is_some_and(|child| child.object_id.is_some())
                });
        if unchanged {
            self.inode_map.carry_over(directory_id).await?;
            for entry in entries.iter().filter(|e| e.kind == LocalKind::Directory) {
                let child = record.child_mut(&entry.name);
                Box::pin(self.sync_directory(child, directory_id, &entry.path, exclusions)).await?;
            }
            record.synced_this_run = true;
            return Ok(());
        }

        let listed = self
            .session()
            .await?
            .list_directory(directory_id, ListFilter::current_only())
            .await;
        let listing = match listed {
            Ok(listing) => listing,
            Err(err) if err.is_not_found() => {
                tracing::warn!(path = %local_path.display(), id = %directory_id, "remote directory vanished; recreating next run");
                record.reset_remote();
                self.report.errors += 1;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let mut named = Vec::with_capacity(entries.len());
        let mut local_kinds: HashMap<EncodedName, Option<bool>> = HashMap::new();
        for entry in &entries {
            match self.keys.encrypt_name(&entry.name) {
                Ok(encoded) => {
                    local_kinds.insert(encoded.clone(), Some(entry.kind == LocalKind::Directory));
                    named.push((entry, encoded));
                }
                Err(err) => {
                    incomplete = true;
                    self.read_error(&entry.path, &io::Error::other(err));
                }
            }
        }
        for failure in &failures {
            let Some(name) = failure.path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if let Ok(encoded) = self.keys.encrypt_name(name) {
                local_kinds.entry(encoded).or_insert(None);
            }
        }

        // Queue remote entries with no local counterpart. A rename later in
        // the run can still claim them from the delete list.
        for remote in &listing.entries {
            let keep = match local_kinds.get(&remote.name) {
                Some(Some(is_dir)) => *is_dir == (remote.kind == EntryKind::Dir),
                Some(None) => true,
                None => false,
            };
            if keep {
                continue;
            }
            let list = self.connection.get_or_create_delete_list();
            match remote.kind {
                EntryKind::File => list.add_file(directory_id, remote.name.clone(), remote.id),
                EntryKind::Dir => list.add_directory(remote.id),
            }
        }

        let present: HashSet<&str> = entries.iter().map(|entry| entry.name.as_str()).collect();
        record.retain_pending(&present);

        for (entry, encoded) in named.iter().filter(|(e, _)| e.kind.is_file_like()) {
            let remote = listing
                .find(encoded)
                .filter(|remote| remote.kind == EntryKind::File);
            let complete = self
                .sync_file(record, directory_id, entry, encoded, remote)
                .await?;
            incomplete |= !complete;
        }

        let mut subdirectories = HashSet::new();
        for (entry, encoded) in named.iter().filter(|(e, _)| e.kind == LocalKind::Directory) {
            subdirectories.insert(entry.name.as_str());
            let remote = listing
                .find(encoded)
                .filter(|remote| remote.kind == EntryKind::Dir);
            let child = record.child_mut(&entry.name);
            match remote {
                Some(remote) => {
                    if child.object_id != Some(remote.id) {
                        child.reset_remote();
                        child.object_id = Some(remote.id);
                    }
                }
                None => {
                    if child.object_id.is_some() {
                        child.reset_remote();
                    }
                    if let Some((id, _)) = self
                        .try_rename(entry.inode, directory_id, encoded, true)
                        .await?
                    {
                        child.object_id = Some(id);
                    }
                }
            }
            Box::pin(self.sync_directory(child, directory_id, &entry.path, exclusions)).await?;
            if let Some(id) = child.object_id {
                self.track_inode(entry, id, directory_id).await?;
            }
        }
        record.retain_children(&subdirectories);

        if !self
            .update_directory_attributes(directory_id, listing.attributes.as_deref(), &dir_attributes)
            .await?
        {
            incomplete = true;
        }

        record.digest = (!incomplete).then_some(digest);
        record.initial_sync_done = true;
        record.synced_this_run = true;
        Ok(())
    }

    /// Returns whether the file is now fully represented on the server.
    async fn sync_file(
        &mut self,
        record: &mut DirectoryRecord,
        directory_id: ObjectId,
        entry: &LocalEntry,
        encoded: &EncodedName,
        remote: Option<&DirectoryEntry>,
    ) -> Result<bool, EngineError> {
        let attributes_hash = self.keys.attributes_hash(&entry.name, &entry.attributes);
        let mod_time = entry.mod_time();

        if let Some(remote) = remote {
            if remote.size == entry.size
                && remote.mod_time == mod_time
                && remote.attributes_hash == attributes_hash
            {
                record.clear_pending(&entry.name);
                self.track_inode(entry, remote.id, directory_id).await?;
                return Ok(true);
            }
        }

        if mod_time > self.future_limit {
            if !self.warned_future {
                self.warned_future = true;
                self.observer.notify(&Notification::FileModifiedInFuture {
                    path: entry.path.clone(),
                });
            }
            self.observer
                .file_skipped(&entry.path, SkipReason::FutureDated);
            return Ok(false);
        }

        if mod_time > self.window.end {
            let deadline = match record.pending_deadline(&entry.name) {
                Some(deadline) => deadline,
                None => {
                    let deadline = self.now + micros(self.params.max_upload_wait);
                    record.set_pending(&entry.name, deadline);
                    deadline
                }
            };
            if self.now < deadline {
                self.report.files_deferred += 1;
                self.observer.file_deferred(&entry.path, deadline);
                return Ok(true);
            }
            tracing::info!(path = %entry.path.display(), "file kept changing past the maximum wait; uploading anyway");
        }

        if self.connection.storage_limit_exceeded() {
            self.skip_for_store_full(&entry.path);
            return Ok(false);
        }

        let mut previous = remote.map(|remote| remote.id);
        if remote.is_none() && entry.size >= self.params.tracking_size_threshold {
            if let Some((moved, resolved)) = self
                .try_rename(entry.inode, directory_id, encoded, false)
                .await?
            {
                if resolved.mod_time == Some(mod_time)
                    && resolved.attributes_hash == Some(attributes_hash)
                {
                    record.clear_pending(&entry.name);
                    self.track_inode(entry, moved, directory_id).await?;
                    return Ok(true);
                }
                previous = Some(moved);
            }
        }

        let uploaded = self
            .upload_file(entry, directory_id, encoded, attributes_hash, previous)
            .await?;
        if uploaded {
            record.clear_pending(&entry.name);
        }
        Ok(uploaded)
    }

    async fn upload_file(
        &mut self,
        entry: &LocalEntry,
        directory_id: ObjectId,
        encoded: &EncodedName,
        attributes_hash: u64,
        previous: Option<ObjectId>,
    ) -> Result<bool, EngineError> {
        self.observer.upload_started(&entry.path, entry.size);
        let content = match local::read_content(entry).await {
            Ok(content) => content,
            Err(err) => {
                self.read_error(&entry.path, &err);
                return Ok(false);
            }
        };

        let mut diff_base = None;
        if let Some(previous) = previous.filter(|_| entry.size > self.params.diffing_size_threshold)
        {
            match self.session().await?.get_block_index(previous).await {
                Ok(index) => diff_base = Some((previous, index)),
                Err(err) if !err.is_fatal() => {
                    tracing::debug!(path = %entry.path.display(), error = %err, "no block index; uploading in full");
                }
                Err(err) => return Err(err.into()),
            }
        }

        let encoded_object = match &diff_base {
            Some((_, index)) => encode_patch(&self.keys, &entry.attributes, &content, index),
            None => encode_object(&self.keys, &entry.attributes, &content),
        };
        let encoded_object = match encoded_object {
            Ok(object) => object,
            Err(err) => {
                self.upload_failed(&entry.path, &err.to_string());
                return Ok(false);
            }
        };
        let body_len = encoded_object.bytes.len() as u64;
        let upload = ObjectUpload {
            directory: directory_id,
            name: encoded,
            mod_time: entry.mod_time(),
            attributes_hash,
            size: entry.size,
            diff_from: diff_base.as_ref().map(|(id, _)| *id),
            body: encoded_object.bytes,
            block_index: &encoded_object.block_index,
        };

        let result = self.session().await?.put_object(upload).await;
        match result {
            Ok(id) => {
                self.report.files_uploaded += 1;
                self.report.bytes_uploaded += body_len;
                tracing::debug!(
                    path = %entry.path.display(),
                    id = %id,
                    bytes = body_len,
                    reused_blocks = encoded_object.reused_blocks,
                    "uploaded"
                );
                self.track_inode(entry, id, directory_id).await?;
                Ok(true)
            }
            Err(err) if err.is_storage_full() => {
                self.connection.set_storage_limit_exceeded();
                self.skip_for_store_full(&entry.path);
                Ok(false)
            }
            Err(err) if !err.is_fatal() => {
                self.upload_failed(&entry.path, &err.to_string());
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Moves the object last uploaded from this inode into `directory_id`
    /// when its old local path is gone.
    async fn try_rename(
        &mut self,
        inode: super::inode_map::InodeRef,
        directory_id: ObjectId,
        name: &EncodedName,
        is_directory: bool,
    ) -> Result<Option<(ObjectId, ResolvedPath)>, EngineError> {
        let Some(previous) = self.inode_map.lookup(inode).await? else {
            return Ok(None);
        };
        let resolved = match self
            .connection
            .resolve_remote_path(previous.object_id, previous.containing_directory)
            .await
        {
            Ok(Some(resolved)) => resolved,
            Ok(None) => return Ok(None),
            Err(err) if !err.is_fatal() => {
                tracing::debug!(error = %err, "could not resolve previous location");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        if resolved.is_directory != is_directory || !resolved.is_current {
            return Ok(None);
        }
        if local::path_exists(&resolved.local_path).await {
            return Ok(None);
        }

        let moved = self
            .session()
            .await?
            .move_object(
                previous.object_id,
                previous.containing_directory,
                directory_id,
                name,
            )
            .await;
        match moved {
            Ok(()) => {}
            Err(err) if !err.is_fatal() => {
                tracing::warn!(error = %err, id = %previous.object_id, "rename on server failed");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        }

        let list = self.connection.get_or_create_delete_list();
        if is_directory {
            list.stop_directory_deletion(previous.object_id);
        } else {
            list.stop_file_deletion(previous.object_id);
        }
        self.report.renames += 1;
        tracing::info!(from = %resolved.local_path.display(), id = %previous.object_id, "renamed on server");
        Ok(Some((previous.object_id, resolved)))
    }

    async fn create_remote_directory(
        &mut self,
        containing: ObjectId,
        name: &str,
        attributes: &FileAttributes,
        local_path: &Path,
    ) -> Result<Option<ObjectId>, EngineError> {
        if self.connection.storage_limit_exceeded() {
            self.skip_for_store_full(local_path);
            return Ok(None);
        }
        let sealed = self
            .keys
            .encrypt_name(name)
            .and_then(|encoded| Ok((encoded, self.keys.seal_attributes(attributes)?)));
        let (encoded, sealed) = match sealed {
            Ok(parts) => parts,
            Err(err) => {
                self.read_error(local_path, &io::Error::other(err));
                return Ok(None);
            }
        };
        let created = self
            .session()
            .await?
            .create_directory(containing, &encoded, &sealed, attributes.mod_time)
            .await;
        match created {
            Ok(id) => {
                tracing::debug!(path = %local_path.display(), id = %id, "created remote directory");
                Ok(Some(id))
            }
            Err(err) if err.is_storage_full() => {
                self.connection.set_storage_limit_exceeded();
                self.skip_for_store_full(local_path);
                Ok(None)
            }
            Err(err) if !err.is_fatal() => {
                self.upload_failed(local_path, &err.to_string());
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update_directory_attributes(
        &mut self,
        directory_id: ObjectId,
        remote: Option<&[u8]>,
        local: &FileAttributes,
    ) -> Result<bool, EngineError> {
        let remote = remote.and_then(|sealed| self.keys.open_attributes(sealed).ok());
        if remote.as_ref() == Some(local) {
            return Ok(true);
        }
        let sealed = match self.keys.seal_attributes(local) {
            Ok(sealed) => sealed,
            Err(err) => {
                tracing::warn!(error = %err, "cannot seal directory attributes");
                return Ok(false);
            }
        };
        let changed = self
            .session()
            .await?
            .change_directory_attributes(directory_id, &sealed, local.mod_time)
            .await;
        match changed {
            Ok(()) => Ok(true),
            Err(err) if !err.is_fatal() => {
                tracing::warn!(id = %directory_id, error = %err, "failed to update directory attributes");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn track_inode(
        &mut self,
        entry: &LocalEntry,
        object_id: ObjectId,
        directory_id: ObjectId,
    ) -> Result<(), EngineError> {
        if entry.kind == LocalKind::Directory || entry.size >= self.params.tracking_size_threshold {
            self.inode_map
                .record(
                    entry.inode,
                    InodeEntry {
                        object_id,
                        containing_directory: directory_id,
                    },
                )
                .await?;
        }
        Ok(())
    }

    async fn session(&mut self) -> Result<&C::Session, EngineError> {
        Ok(self.connection.get_connection().await?)
    }

    fn check_stop(&self) -> Result<(), EngineError> {
        if self.stop.load(Ordering::SeqCst) {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    fn skip_for_store_full(&mut self, path: &Path) {
        if !self.store_full_notified {
            self.store_full_notified = true;
            self.observer.notify(&Notification::StoreFull);
        }
        self.observer.file_skipped(path, SkipReason::StoreFull);
    }

    fn read_error(&mut self, path: &Path, err: &io::Error) {
        self.report.errors += 1;
        let message = err.to_string();
        self.observer.read_error(path, &message);
        if !self.read_error_notified {
            self.read_error_notified = true;
            self.observer.notify(&Notification::ReadError {
                path: path.to_path_buf(),
                message,
            });
        }
    }

    fn upload_failed(&mut self, path: &Path, message: &str) {
        self.report.errors += 1;
        self.observer.upload_failed(path, message);
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
