//! The single store session shared by sync and restore runs.

use std::collections::HashMap;
use std::path::PathBuf;

use coffer_core::{
    CryptoError, EncodedName, EntryKind, ObjectId, PROTOCOL_VERSION, StoreConnector, StoreError,
    StoreKeys, StoreSession,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("server speaks protocol version {found}, expected {expected}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("client store marker on server is {found}, expected {expected}")]
    MarkerMismatch { expected: i64, found: i64 },
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl ConnectionError {
    pub fn is_fatal(&self) -> bool {
        match self {
            ConnectionError::Store(err) => err.is_fatal(),
            ConnectionError::Crypto(_) => false,
            _ => true,
        }
    }
}

/// Whether usage has crossed a third of the way from the soft to the hard limit.
pub fn exceeds_storage_threshold(used: i64, soft_limit: i64, hard_limit: i64) -> bool {
    used > soft_limit + (hard_limit - soft_limit) / 3
}

#[derive(Debug, Clone)]
struct PendingFile {
    directory: ObjectId,
    name: EncodedName,
    id: ObjectId,
}

/// Deletions collected during a run and issued together at its end.
#[derive(Debug, Default)]
pub struct DeleteList {
    files: Vec<PendingFile>,
    directories: Vec<ObjectId>,
}

impl DeleteList {
    pub fn add_file(&mut self, directory: ObjectId, name: EncodedName, id: ObjectId) {
        if !self.files.iter().any(|file| file.id == id) {
            self.files.push(PendingFile {
                directory,
                name,
                id,
            });
        }
    }

    pub fn add_directory(&mut self, id: ObjectId) {
        if !self.directories.contains(&id) {
            self.directories.push(id);
        }
    }

    /// Drops a queued file deletion; the object has been moved elsewhere.
    pub fn stop_file_deletion(&mut self, id: ObjectId) {
        self.files.retain(|file| file.id != id);
    }

    pub fn stop_directory_deletion(&mut self, id: ObjectId) {
        self.directories.retain(|dir| *dir != id);
    }

    pub fn len(&self) -> usize {
        self.files.len() + self.directories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn perform<S: StoreSession>(self, session: &S) -> Result<usize, StoreError> {
        let mut performed = 0;
        for file in &self.files {
            if self.directories.contains(&file.directory) {
                continue;
            }
            match session.delete_file(file.directory, &file.name).await {
                Ok(()) => performed += 1,
                Err(err) if !err.is_fatal() => {
                    tracing::warn!(object = %file.id, error = %err, "failed to delete file");
                }
                Err(err) => return Err(err),
            }
        }
        for id in &self.directories {
            match session.delete_directory(*id).await {
                Ok(()) => performed += 1,
                Err(err) if !err.is_fatal() => {
                    tracing::warn!(object = %id, error = %err, "failed to delete directory");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(performed)
    }
}

/// A stored object mapped back onto the local filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub local_path: PathBuf,
    pub is_directory: bool,
    pub is_current: bool,
    pub mod_time: Option<i64>,
    pub attributes_hash: Option<u64>,
}

pub struct ConnectionContext<C: StoreConnector> {
    connector: C,
    account: u32,
    hostname: String,
    keys: StoreKeys,
    locations: HashMap<String, PathBuf>,
    session: Option<C::Session>,
    client_store_marker: Option<i64>,
    marker_updated_this_run: bool,
    storage_limit_exceeded: bool,
    delete_list: Option<DeleteList>,
}

impl<C: StoreConnector> ConnectionContext<C> {
    pub fn new(connector: C, account: u32, hostname: impl Into<String>, keys: StoreKeys) -> Self {
        Self {
            connector,
            account,
            hostname: hostname.into(),
            keys,
            locations: HashMap::new(),
            session: None,
            client_store_marker: None,
            marker_updated_this_run: false,
            storage_limit_exceeded: false,
            delete_list: None,
        }
    }

    pub fn add_location(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) {
        self.locations.insert(name.into(), path.into());
    }

    pub fn keys(&self) -> &StoreKeys {
        &self.keys
    }

    pub fn client_store_marker(&self) -> Option<i64> {
        self.client_store_marker
    }

    /// Sets the marker expected at the next login, e.g. one persisted by an earlier process.
    pub fn set_client_store_marker(&mut self, marker: Option<i64>) {
        self.client_store_marker = marker;
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn storage_limit_exceeded(&self) -> bool {
        self.storage_limit_exceeded
    }

    pub fn set_storage_limit_exceeded(&mut self) {
        if !self.storage_limit_exceeded {
            tracing::warn!(account = self.account, "store is full; uploads suspended");
        }
        self.storage_limit_exceeded = true;
    }

    /// Resets per-run state before a new run starts.
    pub fn start_run(&mut self) {
        self.marker_updated_this_run = false;
        self.storage_limit_exceeded = false;
    }

    pub async fn get_connection(&mut self) -> Result<&C::Session, ConnectionError> {
        if self.session.is_none() {
            let session = self.open_session().await?;
            self.session = Some(session);
        }
        match self.session.as_ref() {
            Some(session) => Ok(session),
            None => Err(StoreError::NotLoggedIn.into()),
        }
    }

    async fn open_session(&mut self) -> Result<C::Session, ConnectionError> {
        tracing::info!(host = %self.hostname, account = self.account, "connecting to store");
        let session = self.connector.connect().await?;

        let version = session.server_version().await?;
        if version != PROTOCOL_VERSION {
            return Err(ConnectionError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                found: version,
            });
        }

        let info = session.login(self.account, true).await?;
        if let Some(expected) = self.client_store_marker {
            if info.client_store_marker != expected {
                if let Err(err) = session.finish().await {
                    tracing::warn!(error = %err, "failed to end session after marker mismatch");
                }
                return Err(ConnectionError::MarkerMismatch {
                    expected,
                    found: info.client_store_marker,
                });
            }
        } else {
            self.client_store_marker = Some(info.client_store_marker);
        }

        if exceeds_storage_threshold(
            info.blocks_used,
            info.blocks_soft_limit,
            info.blocks_hard_limit,
        ) {
            self.set_storage_limit_exceeded();
        }
        tracing::debug!(
            used = info.blocks_used,
            soft = info.blocks_soft_limit,
            hard = info.blocks_hard_limit,
            "logged in"
        );
        Ok(session)
    }

    /// Ends the session if one is open. Failures are logged and swallowed.
    pub async fn close_any_open_connection(&mut self) {
        let discarded = self.delete_list.take();
        if let Some(list) = discarded.filter(|list| !list.is_empty()) {
            tracing::debug!(pending = list.len(), "discarding unperformed deletions");
        }
        let Some(session) = self.session.take() else {
            return;
        };

        if !self.marker_updated_this_run {
            let marker = next_marker(self.client_store_marker);
            match session.set_client_store_marker(marker).await {
                Ok(()) => {
                    self.client_store_marker = Some(marker);
                    self.marker_updated_this_run = true;
                }
                Err(err) => tracing::warn!(error = %err, "failed to update client store marker"),
            }
        }
        if let Err(err) = session.finish().await {
            tracing::warn!(error = %err, "failed to finish store session");
        }
    }

    pub fn get_or_create_delete_list(&mut self) -> &mut DeleteList {
        self.delete_list.get_or_insert_with(DeleteList::default)
    }

    /// Issues every queued deletion and forgets the list.
    pub async fn perform_deletions(&mut self) -> Result<usize, ConnectionError> {
        let Some(list) = self.delete_list.take() else {
            return Ok(0);
        };
        if list.is_empty() {
            return Ok(0);
        }
        let session = self.get_connection().await?;
        let performed = list.perform(session).await?;
        tracing::info!(performed, "deletions applied");
        Ok(performed)
    }

    /// Maps an object back to the local path it was uploaded from.
    ///
    /// Returns `None` when the server does not know the object or when an
    /// ancestor cannot be decrypted or mapped to a configured location.
    pub async fn resolve_remote_path(
        &mut self,
        object_id: ObjectId,
        containing_directory: ObjectId,
    ) -> Result<Option<ResolvedPath>, ConnectionError> {
        let elements = self
            .get_connection()
            .await?
            .get_object_name(object_id, containing_directory)
            .await?;
        let Some(leaf) = elements.first() else {
            return Ok(None);
        };
        let is_directory = leaf.kind == EntryKind::Dir;
        let is_current = leaf.is_current();
        let mod_time = leaf.mod_time;
        let attributes_hash = leaf.attributes_hash;

        let mut names = Vec::with_capacity(elements.len());
        for element in elements.iter().rev() {
            match self.keys.decrypt_name(&element.name) {
                Ok(name) => names.push(name),
                Err(err) => {
                    tracing::debug!(object = %object_id, error = %err, "cannot decrypt ancestor name");
                    return Ok(None);
                }
            }
        }
        let mut names = names.into_iter();
        let Some(location) = names.next() else {
            return Ok(None);
        };
        let Some(root) = self.locations.get(&location) else {
            return Ok(None);
        };
        let mut local_path = root.clone();
        local_path.extend(names);

        Ok(Some(ResolvedPath {
            local_path,
            is_directory,
            is_current,
            mod_time,
            attributes_hash,
        }))
    }
}

/// Current time in µs, nudged past the previous marker so markers only increase.
fn next_marker(previous: Option<i64>) -> i64 {
    let now = crate::now_micros();
    match previous {
        Some(previous) if previous >= now => previous + 1,
        _ => now,
    }
}
