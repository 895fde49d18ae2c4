//! Resume state of a restore: one level per directory on the path from the
//! restore root to the directory being worked on.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use coffer_core::ObjectId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint is malformed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("checkpoint has no levels")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextLevel {
    pub id: ObjectId,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreLevel {
    pub restored: BTreeSet<ObjectId>,
    pub next: Option<NextLevel>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    levels: Vec<RestoreLevel>,
}

#[derive(Debug)]
pub struct Checkpoint {
    path: PathBuf,
    levels: Vec<RestoreLevel>,
    unsaved_bytes: u64,
}

impl Checkpoint {
    /// Resume file kept next to the restore destination.
    pub fn resume_path(destination: &Path) -> PathBuf {
        let mut name = destination
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".coffer-restore");
        destination.with_file_name(name)
    }

    pub fn fresh(path: PathBuf) -> Self {
        Self {
            path,
            levels: vec![RestoreLevel::default()],
            unsaved_bytes: 0,
        }
    }

    pub async fn load(path: PathBuf) -> Result<Self, CheckpointError> {
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| CheckpointError::Io {
                path: path.clone(),
                source,
            })?;
        let file: CheckpointFile = serde_json::from_slice(&bytes)?;
        if file.levels.is_empty() {
            return Err(CheckpointError::Empty);
        }
        Ok(Self {
            path,
            levels: file.levels,
            unsaved_bytes: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Download target for file contents before they are renamed into the
    /// tree. It lives beside the resume file, outside the restored tree.
    pub fn staging_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".partial");
        PathBuf::from(name)
    }

    pub fn levels(&self) -> &[RestoreLevel] {
        &self.levels
    }

    /// The level for `depth`, created empty if the stack is shorter.
    pub fn level_mut(&mut self, depth: usize) -> &mut RestoreLevel {
        if self.levels.len() <= depth {
            self.levels.resize_with(depth + 1, RestoreLevel::default);
        }
        &mut self.levels[depth]
    }

    pub fn is_restored(&self, depth: usize, id: ObjectId) -> bool {
        self.levels
            .get(depth)
            .is_some_and(|level| level.restored.contains(&id))
    }

    pub fn mark_restored(&mut self, depth: usize, id: ObjectId, bytes: u64) {
        self.level_mut(depth).restored.insert(id);
        self.unsaved_bytes += bytes;
    }

    /// Records a descent into `id` and starts an empty level below `depth`.
    pub fn enter(&mut self, depth: usize, id: ObjectId, name: &str) {
        self.level_mut(depth).next = Some(NextLevel {
            id,
            name: name.to_string(),
        });
        self.levels.truncate(depth + 1);
        self.levels.push(RestoreLevel::default());
    }

    /// Closes the descent recorded at `depth` and marks the child restored.
    pub fn leave(&mut self, depth: usize, id: ObjectId) {
        self.levels.truncate(depth + 1);
        let level = self.level_mut(depth);
        level.next = None;
        level.restored.insert(id);
    }

    pub fn unsaved_bytes(&self) -> u64 {
        self.unsaved_bytes
    }

    /// Writes the whole stack through a temporary file and a rename.
    pub async fn save(&mut self) -> Result<(), CheckpointError> {
        let bytes = serde_json::to_vec(&CheckpointFile {
            levels: self.levels.clone(),
        })?;
        let mut temp_name = self.path.as_os_str().to_os_string();
        temp_name.push(".tmp");
        let temp = PathBuf::from(temp_name);
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| CheckpointError::Io { path, source }
        };
        tokio::fs::write(&temp, bytes).await.map_err(io_err(&temp))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(io_err(&self.path))?;
        self.unsaved_bytes = 0;
        Ok(())
    }

    pub async fn remove(self) -> Result<(), CheckpointError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CheckpointError::Io {
                path: self.path,
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_file_sits_next_to_destination() {
        assert_eq!(
            Checkpoint::resume_path(Path::new("/srv/restore/home")),
            PathBuf::from("/srv/restore/home.coffer-restore")
        );
    }

    #[test]
    fn entering_a_level_drops_stale_deeper_levels() {
        let mut checkpoint = Checkpoint::fresh(PathBuf::from("unused"));
        checkpoint.enter(0, ObjectId(10), "a");
        checkpoint.enter(1, ObjectId(11), "b");
        checkpoint.mark_restored(2, ObjectId(12), 5);
        checkpoint.leave(1, ObjectId(11));
        assert_eq!(checkpoint.levels().len(), 2);

        checkpoint.leave(0, ObjectId(10));
        assert_eq!(checkpoint.levels().len(), 1);
        assert!(checkpoint.is_restored(0, ObjectId(10)));
        assert!(checkpoint.levels()[0].next.is_none());
    }

    #[tokio::test]
    async fn saved_stack_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.coffer-restore");
        let mut checkpoint = Checkpoint::fresh(path.clone());
        checkpoint.mark_restored(0, ObjectId(3), 100);
        checkpoint.enter(0, ObjectId(4), "docs");
        checkpoint.mark_restored(1, ObjectId(5), 100);
        checkpoint.save().await.unwrap();
        assert_eq!(checkpoint.unsaved_bytes(), 0);

        let loaded = Checkpoint::load(path.clone()).await.unwrap();
        assert_eq!(loaded.levels(), checkpoint.levels());
        assert!(!dir.path().join("state.coffer-restore.tmp").exists());

        loaded.remove().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn garbage_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(
            Checkpoint::load(path).await,
            Err(CheckpointError::Json(_))
        ));
    }
}
