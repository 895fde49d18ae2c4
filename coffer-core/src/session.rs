use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use crate::client::StoreError;
use crate::codec::BlockIndex;

/// Protocol revision this client speaks; the server must report exactly this.
pub const PROTOCOL_VERSION: u32 = 2;

/// Every account's store starts with this directory; locations live directly below it.
pub const ROOT_DIRECTORY_ID: ObjectId = ObjectId(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub i64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// An encrypted file or directory name as stored on the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncodedName(#[serde(with = "crate::b64")] pub Vec<u8>);

impl EncodedName {
    pub fn as_path_segment(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub id: ObjectId,
    pub name: EncodedName,
    pub kind: EntryKind,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub old_version: bool,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mod_time: i64,
    #[serde(default)]
    pub attributes_hash: u64,
    #[serde(default, with = "crate::b64::option")]
    pub attributes: Option<Vec<u8>>,
}

impl DirectoryEntry {
    pub fn is_current(&self) -> bool {
        !self.deleted && !self.old_version
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryListing {
    #[serde(default, with = "crate::b64::option")]
    pub attributes: Option<Vec<u8>>,
    #[serde(default)]
    pub attributes_mod_time: i64,
    #[serde(default)]
    pub entries: Vec<DirectoryEntry>,
}

impl DirectoryListing {
    pub fn find(&self, name: &EncodedName) -> Option<&DirectoryEntry> {
        self.entries.iter().find(|entry| &entry.name == name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub include_deleted: bool,
    pub include_old_versions: bool,
}

impl ListFilter {
    pub fn current_only() -> Self {
        Self::default()
    }

    pub fn with_deleted(include_deleted: bool) -> Self {
        Self {
            include_deleted,
            include_old_versions: false,
        }
    }

    pub fn admits(&self, entry: &DirectoryEntry) -> bool {
        (self.include_deleted || !entry.deleted) && (self.include_old_versions || !entry.old_version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginInfo {
    pub client_store_marker: i64,
    pub blocks_used: i64,
    pub blocks_soft_limit: i64,
    pub blocks_hard_limit: i64,
}

/// One element of an object's ancestry as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameElement {
    pub name: EncodedName,
    pub kind: EntryKind,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub old_version: bool,
    #[serde(default)]
    pub mod_time: Option<i64>,
    #[serde(default)]
    pub attributes_hash: Option<u64>,
}

impl NameElement {
    pub fn is_current(&self) -> bool {
        !self.deleted && !self.old_version
    }
}

#[derive(Debug, Clone)]
pub struct ObjectUpload<'a> {
    pub directory: ObjectId,
    pub name: &'a EncodedName,
    pub mod_time: i64,
    pub attributes_hash: u64,
    pub size: u64,
    /// Set when `body` is a patch against this earlier version.
    pub diff_from: Option<ObjectId>,
    pub body: Vec<u8>,
    pub block_index: &'a BlockIndex,
}

/// Request/response primitives of one authenticated store session.
///
/// Calls are issued strictly one at a time by the callers in this workspace.
#[allow(async_fn_in_trait)]
pub trait StoreSession {
    async fn server_version(&self) -> Result<u32, StoreError>;
    async fn login(&self, account: u32, read_write: bool) -> Result<LoginInfo, StoreError>;
    async fn set_client_store_marker(&self, marker: i64) -> Result<(), StoreError>;
    async fn finish(&self) -> Result<(), StoreError>;
    async fn list_directory(
        &self,
        id: ObjectId,
        filter: ListFilter,
    ) -> Result<DirectoryListing, StoreError>;
    async fn create_directory(
        &self,
        parent: ObjectId,
        name: &EncodedName,
        attributes: &[u8],
        attributes_mod_time: i64,
    ) -> Result<ObjectId, StoreError>;
    async fn change_directory_attributes(
        &self,
        id: ObjectId,
        attributes: &[u8],
        attributes_mod_time: i64,
    ) -> Result<(), StoreError>;
    async fn put_object(&self, upload: ObjectUpload<'_>) -> Result<ObjectId, StoreError>;
    async fn get_object(&self, id: ObjectId) -> Result<Vec<u8>, StoreError>;
    async fn get_block_index(&self, id: ObjectId) -> Result<BlockIndex, StoreError>;
    async fn move_object(
        &self,
        id: ObjectId,
        from_directory: ObjectId,
        to_directory: ObjectId,
        new_name: &EncodedName,
    ) -> Result<(), StoreError>;
    async fn delete_file(&self, directory: ObjectId, name: &EncodedName)
    -> Result<(), StoreError>;
    async fn delete_directory(&self, id: ObjectId) -> Result<(), StoreError>;
    async fn undelete_directory(&self, id: ObjectId) -> Result<(), StoreError>;
    /// Ancestry of `id`, leaf first. Empty when the server does not know the object.
    async fn get_object_name(
        &self,
        id: ObjectId,
        containing_directory: ObjectId,
    ) -> Result<Vec<NameElement>, StoreError>;
}

/// Opens encrypted, authenticated transports to the store.
#[allow(async_fn_in_trait)]
pub trait StoreConnector {
    type Session: StoreSession;

    async fn connect(&self) -> Result<Self::Session, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(deleted: bool, old_version: bool) -> DirectoryEntry {
        DirectoryEntry {
            id: ObjectId(7),
            name: EncodedName(vec![1, 2, 3]),
            kind: EntryKind::File,
            deleted,
            old_version,
            size: 0,
            mod_time: 0,
            attributes_hash: 0,
            attributes: None,
        }
    }

    #[test]
    fn current_only_filter_hides_deleted_and_old_versions() {
        let filter = ListFilter::current_only();
        assert!(filter.admits(&entry(false, false)));
        assert!(!filter.admits(&entry(true, false)));
        assert!(!filter.admits(&entry(false, true)));
    }

    #[test]
    fn deleted_filter_still_hides_old_versions() {
        let filter = ListFilter::with_deleted(true);
        assert!(filter.admits(&entry(true, false)));
        assert!(!filter.admits(&entry(true, true)));
    }

    #[test]
    fn name_element_is_current_unless_deleted_or_superseded() {
        let element: NameElement = serde_json::from_value(serde_json::json!({
            "name": "AQID", "kind": "file", "mod_time": 9
        }))
        .unwrap();
        assert!(element.is_current());
        assert!(!NameElement { deleted: true, ..element.clone() }.is_current());
        assert!(!NameElement { old_version: true, ..element }.is_current());
    }

    #[test]
    fn listing_entries_parse_with_base64_names() {
        let listing: DirectoryListing = serde_json::from_value(serde_json::json!({
            "attributes_mod_time": 5,
            "entries": [
                { "id": 12, "name": "AQID", "kind": "dir" }
            ]
        }))
        .unwrap();
        assert_eq!(listing.entries[0].name, EncodedName(vec![1, 2, 3]));
        assert_eq!(listing.entries[0].kind, EntryKind::Dir);
        assert!(listing.attributes.is_none());
        assert!(listing.find(&EncodedName(vec![1, 2, 3])).is_some());
    }
}
