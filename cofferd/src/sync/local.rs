use std::fs::Metadata;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use coffer_core::FileAttributes;

use super::inode_map::InodeRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalKind {
    File,
    Directory,
    Symlink,
    Other,
}

impl LocalKind {
    fn of(metadata: &Metadata) -> Self {
        let file_type = metadata.file_type();
        if file_type.is_symlink() {
            LocalKind::Symlink
        } else if file_type.is_dir() {
            LocalKind::Directory
        } else if file_type.is_file() {
            LocalKind::File
        } else {
            LocalKind::Other
        }
    }

    /// Regular files and symbolic links are both stored as file objects.
    pub fn is_file_like(self) -> bool {
        matches!(self, LocalKind::File | LocalKind::Symlink)
    }
}

#[derive(Debug, Clone)]
pub struct LocalEntry {
    pub name: String,
    pub path: PathBuf,
    pub kind: LocalKind,
    pub size: u64,
    pub inode: InodeRef,
    pub attributes: FileAttributes,
}

impl LocalEntry {
    pub fn mod_time(&self) -> i64 {
        self.attributes.mod_time
    }
}

#[derive(Debug)]
pub struct ReadFailure {
    pub path: PathBuf,
    pub error: io::Error,
}

/// Entries of `path` sorted by name, plus the entries that could not be read.
pub async fn read_directory(path: &Path) -> io::Result<(Vec<LocalEntry>, Vec<ReadFailure>)> {
    let mut entries = Vec::new();
    let mut failures = Vec::new();
    let mut dir = tokio::fs::read_dir(path).await?;
    while let Some(item) = dir.next_entry().await? {
        let entry_path = item.path();
        let Some(name) = item.file_name().to_str().map(str::to_owned) else {
            failures.push(ReadFailure {
                path: entry_path,
                error: io::Error::new(io::ErrorKind::InvalidData, "file name is not UTF-8"),
            });
            continue;
        };
        match stat_entry(&entry_path).await {
            Ok((kind, size, inode, attributes)) => entries.push(LocalEntry {
                name,
                path: entry_path,
                kind,
                size,
                inode,
                attributes,
            }),
            Err(error) => failures.push(ReadFailure {
                path: entry_path,
                error,
            }),
        }
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok((entries, failures))
}

async fn stat_entry(path: &Path) -> io::Result<(LocalKind, u64, InodeRef, FileAttributes)> {
    let metadata = tokio::fs::symlink_metadata(path).await?;
    let kind = LocalKind::of(&metadata);
    let mut attributes = capture_attributes(&metadata);
    let mut size = metadata.len();
    if kind == LocalKind::Symlink {
        let target = tokio::fs::read_link(path).await?;
        attributes.symlink_target = Some(target.to_string_lossy().into_owned());
        size = 0;
    }
    let inode = InodeRef {
        device: metadata.dev(),
        inode: metadata.ino(),
    };
    Ok((kind, size, inode, attributes))
}

/// Attributes of `path` itself, not following a final symlink.
pub async fn directory_attributes(path: &Path) -> io::Result<FileAttributes> {
    let metadata = tokio::fs::symlink_metadata(path).await?;
    Ok(capture_attributes(&metadata))
}

pub fn capture_attributes(metadata: &Metadata) -> FileAttributes {
    FileAttributes {
        mode: metadata.mode(),
        uid: metadata.uid(),
        gid: metadata.gid(),
        mod_time: metadata.mtime() * 1_000_000 + metadata.mtime_nsec() / 1_000,
        symlink_target: None,
    }
}

pub async fn read_content(entry: &LocalEntry) -> io::Result<Vec<u8>> {
    match entry.kind {
        LocalKind::Symlink => Ok(Vec::new()),
        _ => tokio::fs::read(&entry.path).await,
    }
}

pub async fn path_exists(path: &Path) -> bool {
    tokio::fs::symlink_metadata(path).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_entries_sorted_with_kinds() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"hello").unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        std::os::unix::fs::symlink("b.txt", dir.path().join("c")).unwrap();

        let (entries, failures) = read_directory(dir.path()).await.unwrap();
        assert!(failures.is_empty());
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a", "b.txt", "c"]);
        assert_eq!(entries[0].kind, LocalKind::Directory);
        assert_eq!(entries[1].size, 5);
        assert_eq!(entries[2].kind, LocalKind::Symlink);
        assert_eq!(entries[2].attributes.symlink_target.as_deref(), Some("b.txt"));
    }

    #[tokio::test]
    async fn modification_time_is_in_microseconds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();
        let attrs = capture_attributes(&std::fs::symlink_metadata(&path).unwrap());
        let now = time::OffsetDateTime::now_utc().unix_timestamp() * 1_000_000;
        assert!((attrs.mod_time - now).abs() < 60 * 1_000_000);
    }
}
