use std::collections::HashMap;
use std::fs;
use std::path::Path;

use coffer_core::ObjectId;
use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const CURRENT: &str = "current";
const NEW: &str = "new";

#[derive(Debug, Error)]
pub enum InodeMapError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identity of a local file that survives renames within one filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeRef {
    pub device: u64,
    pub inode: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeEntry {
    pub object_id: ObjectId,
    pub containing_directory: ObjectId,
}

/// Inode associations in two generations.
///
/// Lookups read `current`, written by the last successful run. A run records
/// into `new`, which replaces `current` only through [`InodeMap::commit`].
pub struct InodeMap {
    backend: Backend,
}

enum Backend {
    Memory {
        current: HashMap<InodeRef, InodeEntry>,
        new: HashMap<InodeRef, InodeEntry>,
    },
    Sqlite(SqlitePool),
}

impl InodeMap {
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory {
                current: HashMap::new(),
                new: HashMap::new(),
            },
        }
    }

    pub async fn open(path: &Path) -> Result<Self, InodeMapError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, InodeMapError> {
        MIGRATOR.run(&pool).await?;
        Ok(Self {
            backend: Backend::Sqlite(pool),
        })
    }

    /// Clears any `new` generation left behind by an interrupted run.
    pub async fn begin_run(&mut self) -> Result<(), InodeMapError> {
        match &mut self.backend {
            Backend::Memory { new, .. } => new.clear(),
            Backend::Sqlite(pool) => {
                sqlx::query("DELETE FROM inode_map WHERE generation = ?1")
                    .bind(NEW)
                    .execute(&*pool)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn lookup(&self, inode: InodeRef) -> Result<Option<InodeEntry>, InodeMapError> {
        match &self.backend {
            Backend::Memory { current, .. } => Ok(current.get(&inode).copied()),
            Backend::Sqlite(pool) => {
                let row = sqlx::query(
                    "SELECT object_id, containing_directory FROM inode_map
                     WHERE generation = ?1 AND device = ?2 AND inode = ?3",
                )
                .bind(CURRENT)
                .bind(inode.device as i64)
                .bind(inode.inode as i64)
                .fetch_optional(pool)
                .await?;
                let Some(row) = row else {
                    return Ok(None);
                };
                Ok(Some(InodeEntry {
                    object_id: ObjectId(row.try_get("object_id")?),
                    containing_directory: ObjectId(row.try_get("containing_directory")?),
                }))
            }
        }
    }

    pub async fn record(
        &mut self,
        inode: InodeRef,
        entry: InodeEntry,
    ) -> Result<(), InodeMapError> {
        match &mut self.backend {
            Backend::Memory { new, .. } => {
                new.insert(inode, entry);
            }
            Backend::Sqlite(pool) => {
                sqlx::query(
                    "INSERT INTO inode_map (generation, device, inode, object_id, containing_directory)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(generation, device, inode) DO UPDATE SET
                         object_id = excluded.object_id,
                         containing_directory = excluded.containing_directory",
                )
                .bind(NEW)
                .bind(inode.device as i64)
                .bind(inode.inode as i64)
                .bind(entry.object_id.0)
                .bind(entry.containing_directory.0)
                .execute(&*pool)
                .await?;
            }
        }
        Ok(())
    }

    /// Copies every current association inside `directory` into the new
    /// generation. Used when a directory is skipped as unchanged.
    pub async fn carry_over(&mut self, directory: ObjectId) -> Result<u64, InodeMapError> {
        match &mut self.backend {
            Backend::Memory { current, new } => {
                let mut copied = 0;
                for (inode, entry) in current.iter() {
                    if entry.containing_directory == directory {
                        new.insert(*inode, *entry);
                        copied += 1;
                    }
                }
                Ok(copied)
            }
            Backend::Sqlite(pool) => {
                let result = sqlx::query(
                    "INSERT OR REPLACE INTO inode_map (generation, device, inode, object_id, containing_directory)
                     SELECT ?1, device, inode, object_id, containing_directory FROM inode_map
                     WHERE generation = ?2 AND containing_directory = ?3",
                )
                .bind(NEW)
                .bind(CURRENT)
                .bind(directory.0)
                .execute(&*pool)
                .await?;
                Ok(result.rows_affected())
            }
        }
    }

    /// Makes the new generation current.
    pub async fn commit(&mut self) -> Result<(), InodeMapError> {
        match &mut self.backend {
            Backend::Memory { current, new } => {
                *current = std::mem::take(new);
            }
            Backend::Sqlite(pool) => {
                let mut tx = pool.begin().await?;
                sqlx::query("DELETE FROM inode_map WHERE generation = ?1")
                    .bind(CURRENT)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("UPDATE inode_map SET generation = ?1 WHERE generation = ?2")
                    .bind(CURRENT)
                    .bind(NEW)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
            }
        }
        tracing::debug!("inode map generation committed");
        Ok(())
    }

    pub async fn discard(&mut self) -> Result<(), InodeMapError> {
        self.begin_run().await
    }

    pub async fn current_len(&self) -> Result<u64, InodeMapError> {
        match &self.backend {
            Backend::Memory { current, .. } => Ok(current.len() as u64),
            Backend::Sqlite(pool) => {
                let row = sqlx::query("SELECT COUNT(*) AS n FROM inode_map WHERE generation = ?1")
                    .bind(CURRENT)
                    .fetch_one(pool)
                    .await?;
                let count: i64 = row.try_get("n")?;
                Ok(count as u64)
            }
        }
    }
}
