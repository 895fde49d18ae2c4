use serde::{Deserialize, Serialize};

/// Local metadata carried alongside every stored file and directory.
///
/// Times are microseconds since the Unix epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mod_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symlink_target: Option<String>,
}

impl FileAttributes {
    pub fn is_symlink(&self) -> bool {
        self.symlink_target.is_some()
    }

    /// Serialized form of everything except the modification time, which
    /// callers compare on its own.
    pub(crate) fn hash_material(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.extend_from_slice(&self.mode.to_be_bytes());
        out.extend_from_slice(&self.uid.to_be_bytes());
        out.extend_from_slice(&self.gid.to_be_bytes());
        if let Some(target) = &self.symlink_target {
            out.push(1);
            out.extend_from_slice(target.as_bytes());
        } else {
            out.push(0);
        }
        out
    }
}
