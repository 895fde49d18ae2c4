use std::collections::{BTreeMap, HashSet};

use coffer_core::ObjectId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::local::LocalEntry;

/// What the engine remembers about one local directory between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub object_id: Option<ObjectId>,
    pub name: String,
    pub initial_sync_done: bool,
    #[serde(skip)]
    pub synced_this_run: bool,
    pub digest: Option<[u8; 32]>,
    /// File name to the time (µs) after which it is uploaded even if still changing.
    #[serde(default)]
    pub pending: Option<BTreeMap<String, i64>>,
    #[serde(default)]
    pub children: BTreeMap<String, DirectoryRecord>,
}

impl DirectoryRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn child_mut(&mut self, name: &str) -> &mut DirectoryRecord {
        self.children
            .entry(name.to_string())
            .or_insert_with(|| DirectoryRecord::new(name))
    }

    pub fn retain_children(&mut self, keep: &HashSet<&str>) {
        self.children.retain(|name, _| keep.contains(name.as_str()));
    }

    /// Forgets the remote side so the next scan compares and recreates from scratch.
    pub fn reset_remote(&mut self) {
        self.object_id = None;
        self.initial_sync_done = false;
        self.digest = None;
        self.children.values_mut().for_each(DirectoryRecord::reset_remote);
    }

    pub fn pending_deadline(&self, name: &str) -> Option<i64> {
        self.pending.as_ref().and_then(|pending| pending.get(name).copied())
    }

    pub fn set_pending(&mut self, name: &str, deadline: i64) {
        self.pending
            .get_or_insert_with(BTreeMap::new)
            .insert(name.to_string(), deadline);
    }

    pub fn clear_pending(&mut self, name: &str) {
        if let Some(pending) = self.pending.as_mut() {
            pending.remove(name);
            if pending.is_empty() {
                self.pending = None;
            }
        }
    }

    pub fn retain_pending(&mut self, present: &HashSet<&str>) {
        if let Some(pending) = self.pending.as_mut() {
            pending.retain(|name, _| present.contains(name.as_str()));
            if pending.is_empty() {
                self.pending = None;
            }
        }
    }

    pub fn clear_synced_flags(&mut self) {
        self.synced_this_run = false;
        self.children
            .values_mut()
            .for_each(DirectoryRecord::clear_synced_flags);
    }
}

/// Digest over every surviving entry, in name order.
pub fn digest_entries<F>(entries: &[LocalEntry], attributes_hash: F) -> [u8; 32]
where
    F: Fn(&LocalEntry) -> u64,
{
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update((entry.name.len() as u64).to_be_bytes());
        hasher.update(entry.name.as_bytes());
        hasher.update([entry.kind.is_file_like() as u8]);
        hasher.update(entry.size.to_be_bytes());
        hasher.update(entry.mod_time().to_be_bytes());
        hasher.update(entry.inode.device.to_be_bytes());
        hasher.update(entry.inode.inode.to_be_bytes());
        hasher.update(attributes_hash(entry).to_be_bytes());
    }
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    digest
}
