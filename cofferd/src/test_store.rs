//! In-memory store used by the engine and restore tests.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use coffer_core::codec::apply_patch;
use coffer_core::{
    BlockIndex, DirectoryEntry, DirectoryListing, EncodedName, EntryKind, ListFilter, LoginInfo,
    NameElement, ObjectId, ObjectUpload, PROTOCOL_VERSION, ROOT_DIRECTORY_ID, StatusCode,
    StoreConnector, StoreError, StoreSession,
};

#[derive(Debug, Clone)]
struct StoredObject {
    parent: ObjectId,
    name: EncodedName,
    kind: EntryKind,
    deleted: bool,
    old_version: bool,
    data: Vec<u8>,
    block_index: BlockIndex,
    size: u64,
    mod_time: i64,
    attributes_hash: u64,
    attributes: Option<Vec<u8>>,
    attributes_mod_time: i64,
}

#[derive(Debug)]
struct State {
    objects: BTreeMap<i64, StoredObject>,
    next_id: i64,
    version: u32,
    marker: i64,
    usage: (i64, i64, i64),
    reject_uploads_full: bool,
    open_sessions: usize,
    uploads: usize,
    patch_uploads: usize,
    downloads: Vec<ObjectId>,
    moves: usize,
    listings: usize,
    fail_downloads_after: Option<usize>,
    watched_file: Option<PathBuf>,
    snapshots: Vec<Option<Vec<u8>>>,
}

#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut objects = BTreeMap::new();
        objects.insert(
            ROOT_DIRECTORY_ID.0,
            StoredObject {
                parent: ObjectId(0),
                name: EncodedName(Vec::new()),
                kind: EntryKind::Dir,
                deleted: false,
                old_version: false,
                data: Vec::new(),
                block_index: BlockIndex::default(),
                size: 0,
                mod_time: 0,
                attributes_hash: 0,
                attributes: None,
                attributes_mod_time: 0,
            },
        );
        Self {
            state: Arc::new(Mutex::new(State {
                objects,
                next_id: ROOT_DIRECTORY_ID.0 + 1,
                version: PROTOCOL_VERSION,
                marker: 0,
                usage: (0, 1000, 2000),
                reject_uploads_full: false,
                open_sessions: 0,
                uploads: 0,
                patch_uploads: 0,
                downloads: Vec::new(),
                moves: 0,
                listings: 0,
                fail_downloads_after: None,
                watched_file: None,
                snapshots: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            store: self.clone(),
        }
    }

    pub fn set_usage(&self, used: i64, soft: i64, hard: i64) {
        self.lock().usage = (used, soft, hard);
    }

    pub fn set_version(&self, version: u32) {
        self.lock().version = version;
    }

    pub fn marker(&self) -> i64 {
        self.lock().marker
    }

    pub fn set_marker(&self, marker: i64) {
        self.lock().marker = marker;
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().open_sessions
    }

    pub fn reject_uploads_as_full(&self, reject: bool) {
        self.lock().reject_uploads_full = reject;
    }

    pub fn uploads(&self) -> usize {
        self.lock().uploads
    }

    pub fn patch_uploads(&self) -> usize {
        self.lock().patch_uploads
    }

    pub fn moves(&self) -> usize {
        self.lock().moves
    }

    pub fn listings(&self) -> usize {
        self.lock().listings
    }

    pub fn downloads(&self) -> Vec<ObjectId> {
        self.lock().downloads.clone()
    }

    /// Makes every download after the first `count` fail with a transport-class error.
    pub fn fail_downloads_after(&self, count: Option<usize>) {
        self.lock().fail_downloads_after = count;
    }

    /// Captures the contents of `path` (if any) whenever an object is downloaded.
    pub fn snapshot_on_download(&self, path: PathBuf) {
        self.lock().watched_file = Some(path);
    }

    pub fn snapshots(&self) -> Vec<Option<Vec<u8>>> {
        self.lock().snapshots.clone()
    }

    pub fn is_deleted(&self, id: ObjectId) -> bool {
        self.lock()
            .objects
            .get(&id.0)
            .map(|object| object.deleted)
            .unwrap_or(false)
    }

    pub fn add_directory(&self, parent: ObjectId, name: &EncodedName) -> ObjectId {
        self.lock()
            .insert(parent, name.clone(), EntryKind::Dir, Vec::new(), 0, 0)
    }

    pub fn add_file(&self, parent: ObjectId, name: &EncodedName, data: &[u8]) -> ObjectId {
        self.lock().insert(
            parent,
            name.clone(),
            EntryKind::File,
            data.to_vec(),
            0,
            data.len() as u64,
        )
    }

    /// Current, non-deleted entries directly inside `directory`.
    pub fn current_children(&self, directory: ObjectId) -> Vec<(ObjectId, EncodedName, EntryKind)> {
        self.lock()
            .objects
            .iter()
            .filter(|(_, object)| {
                object.parent == directory && !object.deleted && !object.old_version
            })
            .map(|(id, object)| (ObjectId(*id), object.name.clone(), object.kind))
            .collect()
    }
}

impl State {
    fn insert(
        &mut self,
        parent: ObjectId,
        name: EncodedName,
        kind: EntryKind,
        data: Vec<u8>,
        mod_time: i64,
        size: u64,
    ) -> ObjectId {
        let id = self.next_id;
        self.next_id += 1;
        self.objects.insert(
            id,
            StoredObject {
                parent,
                name,
                kind,
                deleted: false,
                old_version: false,
                data,
                block_index: BlockIndex::default(),
                size,
                mod_time,
                attributes_hash: 0,
                attributes: None,
                attributes_mod_time: 0,
            },
        );
        ObjectId(id)
    }

    fn current_named(&mut self, parent: ObjectId, name: &EncodedName) -> Option<&mut StoredObject> {
        self.objects.values_mut().find(|object| {
            object.parent == parent && &object.name == name && !object.old_version && !object.deleted
        })
    }

    fn object(&self, id: ObjectId) -> Result<&StoredObject, StoreError> {
        self.objects.get(&id.0).ok_or_else(|| not_found(id))
    }
}

fn not_found(id: ObjectId) -> StoreError {
    StoreError::Api {
        status: StatusCode::NOT_FOUND,
        body: format!("no object {id}"),
    }
}

pub struct MemoryConnector {
    store: MemoryStore,
}

impl StoreConnector for MemoryConnector {
    type Session = MemorySession;

    async fn connect(&self) -> Result<MemorySession, StoreError> {
        Ok(MemorySession {
            store: self.store.clone(),
            logged_in: Mutex::new(false),
        })
    }
}

pub struct MemorySession {
    store: MemoryStore,
    logged_in: Mutex<bool>,
}

impl MemorySession {
    fn state(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        if !*self.logged_in.lock().unwrap() {
            return Err(StoreError::NotLoggedIn);
        }
        Ok(self.store.lock())
    }
}

impl StoreSession for MemorySession {
    async fn server_version(&self) -> Result<u32, StoreError> {
        Ok(self.store.lock().version)
    }

    async fn login(&self, _account: u32, _read_write: bool) -> Result<LoginInfo, StoreError> {
        let mut state = self.store.lock();
        state.open_sessions += 1;
        *self.logged_in.lock().unwrap() = true;
        let (used, soft, hard) = state.usage;
        Ok(LoginInfo {
            client_store_marker: state.marker,
            blocks_used: used,
            blocks_soft_limit: soft,
            blocks_hard_limit: hard,
        })
    }

    async fn set_client_store_marker(&self, marker: i64) -> Result<(), StoreError> {
        self.state()?.marker = marker;
        Ok(())
    }

    async fn finish(&self) -> Result<(), StoreError> {
        let mut state = self.state()?;
        state.open_sessions -= 1;
        *self.logged_in.lock().unwrap() = false;
        Ok(())
    }

    async fn list_directory(
        &self,
        id: ObjectId,
        filter: ListFilter,
    ) -> Result<DirectoryListing, StoreError> {
        let mut state = self.state()?;
        state.listings += 1;
        let directory = state.object(id)?;
        if directory.kind != EntryKind::Dir {
            return Err(not_found(id));
        }
        let entries = state
            .objects
            .iter()
            .filter(|(_, object)| object.parent == id)
            .map(|(child, object)| DirectoryEntry {
                id: ObjectId(*child),
                name: object.name.clone(),
                kind: object.kind,
                deleted: object.deleted,
                old_version: object.old_version,
                size: object.size,
                mod_time: object.mod_time,
                attributes_hash: object.attributes_hash,
                attributes: None,
            })
            .filter(|entry| filter.admits(entry))
            .collect();
        Ok(DirectoryListing {
            attributes: directory.attributes.clone(),
            attributes_mod_time: directory.attributes_mod_time,
            entries,
        })
    }

    async fn create_directory(
        &self,
        parent: ObjectId,
        name: &EncodedName,
        attributes: &[u8],
        attributes_mod_time: i64,
    ) -> Result<ObjectId, StoreError> {
        let mut state = self.state()?;
        state.object(parent)?;
        if let Some(existing) = state.current_named(parent, name) {
            if existing.kind == EntryKind::Dir {
                return Err(StoreError::Api {
                    status: StatusCode::CONFLICT,
                    body: "directory exists".into(),
                });
            }
        }
        let id = state.insert(parent, name.clone(), EntryKind::Dir, Vec::new(), 0, 0);
        if let Some(object) = state.objects.get_mut(&id.0) {
            object.attributes = Some(attributes.to_vec());
            object.attributes_mod_time = attributes_mod_time;
        }
        Ok(id)
    }

    async fn change_directory_attributes(
        &self,
        id: ObjectId,
        attributes: &[u8],
        attributes_mod_time: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.state()?;
        let object = state.objects.get_mut(&id.0).ok_or_else(|| not_found(id))?;
        object.attributes = Some(attributes.to_vec());
        object.attributes_mod_time = attributes_mod_time;
        Ok(())
    }

    async fn put_object(&self, upload: ObjectUpload<'_>) -> Result<ObjectId, StoreError> {
        let mut state = self.state()?;
        if state.reject_uploads_full {
            return Err(StoreError::Api {
                status: StatusCode::INSUFFICIENT_STORAGE,
                body: "store full".into(),
            });
        }
        state.object(upload.directory)?;
        let data = match upload.diff_from {
            Some(base) => {
                let previous = state.object(base)?.data.clone();
                state.patch_uploads += 1;
                apply_patch(&previous, &upload.body).map_err(|err| StoreError::Api {
                    status: StatusCode::BAD_REQUEST,
                    body: err.to_string(),
                })?
            }
            None => upload.body,
        };
        if let Some(existing) = state.current_named(upload.directory, upload.name) {
            existing.old_version = true;
        }
        let id = state.insert(
            upload.directory,
            upload.name.clone(),
            EntryKind::File,
            data,
            upload.mod_time,
            upload.size,
        );
        if let Some(object) = state.objects.get_mut(&id.0) {
            object.attributes_hash = upload.attributes_hash;
            object.block_index = upload.block_index.clone();
        }
        state.uploads += 1;
        Ok(id)
    }

    async fn get_object(&self, id: ObjectId) -> Result<Vec<u8>, StoreError> {
        let mut state = self.state()?;
        if let Some(path) = state.watched_file.clone() {
            state.snapshots.push(std::fs::read(path).ok());
        }
        if let Some(limit) = state.fail_downloads_after {
            if state.downloads.len() >= limit {
                return Err(StoreError::Api {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    body: "connection dropped".into(),
                });
            }
        }
        let data = state.object(id)?.data.clone();
        state.downloads.push(id);
        Ok(data)
    }

    async fn get_block_index(&self, id: ObjectId) -> Result<BlockIndex, StoreError> {
        Ok(self.state()?.object(id)?.block_index.clone())
    }

    async fn move_object(
        &self,
        id: ObjectId,
        _from_directory: ObjectId,
        to_directory: ObjectId,
        new_name: &EncodedName,
    ) -> Result<(), StoreError> {
        let mut state = self.state()?;
        state.object(to_directory)?;
        if let Some(existing) = state.current_named(to_directory, new_name) {
            existing.old_version = true;
        }
        let object = state.objects.get_mut(&id.0).ok_or_else(|| not_found(id))?;
        object.parent = to_directory;
        object.name = new_name.clone();
        state.moves += 1;
        Ok(())
    }

    async fn delete_file(&self, directory: ObjectId, name: &EncodedName) -> Result<(), StoreError> {
        let mut state = self.state()?;
        match state.current_named(directory, name) {
            Some(object) => {
                object.deleted = true;
                Ok(())
            }
            None => Err(not_found(directory)),
        }
    }

    async fn delete_directory(&self, id: ObjectId) -> Result<(), StoreError> {
        let mut state = self.state()?;
        let object = state.objects.get_mut(&id.0).ok_or_else(|| not_found(id))?;
        object.deleted = true;
        Ok(())
    }

    async fn undelete_directory(&self, id: ObjectId) -> Result<(), StoreError> {
        let mut state = self.state()?;
        let object = state.objects.get_mut(&id.0).ok_or_else(|| not_found(id))?;
        object.deleted = false;
        Ok(())
    }

    async fn get_object_name(
        &self,
        id: ObjectId,
        _containing_directory: ObjectId,
    ) -> Result<Vec<NameElement>, StoreError> {
        let state = self.state()?;
        let mut elements = Vec::new();
        let mut cursor = id;
        while cursor != ROOT_DIRECTORY_ID {
            let Some(object) = state.objects.get(&cursor.0) else {
                return Ok(Vec::new());
            };
            elements.push(NameElement {
                name: object.name.clone(),
                kind: object.kind,
                deleted: object.deleted,
                old_version: object.old_version,
                mod_time: (object.kind == EntryKind::File).then_some(object.mod_time),
                attributes_hash: (object.kind == EntryKind::File)
                    .then_some(object.attributes_hash),
            });
            cursor = object.parent;
        }
        Ok(elements)
    }
}
