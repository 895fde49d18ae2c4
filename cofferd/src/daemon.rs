use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use coffer_core::{ObjectId, StoreKeys, TlsConnector, TlsSettings};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::Notify;

use crate::connection::{ConnectionContext, ConnectionError};
use crate::micros;
use crate::restore::{RestoreOptions, RestoreOutcome};
use crate::sync::engine::{EngineError, Location, SyncParams, SyncReport, run_backup};
use crate::sync::exclude::{ExcludeError, ExcludeList, ExclusionEngine};
use crate::sync::inode_map::InodeMap;
use crate::sync::observer::{LogObserver, Notification, SyncObserver};
use crate::sync::record::DirectoryRecord;

const DEFAULT_PORT: u16 = 2201;
const DEFAULT_INTERVAL_SECS: u64 = 60 * 60;
const DEFAULT_TIMEOUT_SECS: u64 = 15 * 60;
const RUN_STATE_FILE: &str = "run-state.json";
const RECORDS_FILE: &str = "records.json";
const INODE_DB_FILE: &str = "inodes.sqlite";
const KEY_FILE: &str = "keys.raw";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file is malformed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config is missing `{0}`")]
    Missing(&'static str),
    #[error("location {location:?}: {source}")]
    Rules {
        location: String,
        #[source]
        source: ExcludeError,
    },
    #[error("location {0:?} is configured twice")]
    DuplicateLocation(String),
}

#[derive(Debug, Clone, Deserialize)]
struct ConfigFile {
    host: Option<String>,
    port: Option<u16>,
    account: Option<u32>,
    ca_certificate: Option<String>,
    client_certificate: Option<String>,
    client_key: Option<String>,
    key_file: Option<String>,
    state_dir: Option<String>,
    interval_secs: Option<u64>,
    timeout_secs: Option<u64>,
    #[serde(default = "default_true")]
    persistent_inode_map: bool,
    #[serde(default)]
    sync: SyncSection,
    #[serde(default)]
    locations: Vec<LocationFile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SyncSection {
    min_file_age_secs: Option<u64>,
    max_upload_wait_secs: Option<u64>,
    max_future_skew_secs: Option<u64>,
    tracking_size_threshold: Option<u64>,
    diffing_size_threshold: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct LocationFile {
    name: String,
    path: String,
    #[serde(default)]
    exclude: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LocationConfig {
    pub name: String,
    pub path: PathBuf,
    pub rules: ExcludeList,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub tls: TlsSettings,
    pub account: u32,
    pub key_file: PathBuf,
    pub state_dir: PathBuf,
    pub interval: Duration,
    pub persistent_inode_map: bool,
    pub params: SyncParams,
    pub locations: Vec<LocationConfig>,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let config_path = std::env::var("COFFER_CONFIG")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(default_config_path);
        let text = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read config at {}", config_path.display()))?;
        let mut config = Self::parse(&text, &home)
            .with_context(|| format!("invalid config at {}", config_path.display()))?;

        if let Ok(host) = std::env::var("COFFER_STORE_HOST") {
            config.tls.host = host;
        }
        if let Ok(account) = std::env::var("COFFER_ACCOUNT") {
            config.account = parse_account(&account)
                .with_context(|| format!("COFFER_ACCOUNT is not an account number: {account}"))?;
        }
        if let Ok(state_dir) = std::env::var("COFFER_STATE_DIR") {
            config.state_dir = expand_with_home(&state_dir, &home);
        }
        config.interval = Duration::from_secs(read_u64_env(
            "COFFER_INTERVAL_SECS",
            config.interval.as_secs(),
        ));
        config.persistent_inode_map =
            read_bool_env("COFFER_PERSISTENT_INODE_MAP", config.persistent_inode_map);
        Ok(config)
    }

    /// Builds a config from the JSON file format. `~` in paths expands to `home`.
    pub fn parse(text: &str, home: &Path) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_json::from_str(text)?;
        let path = |value: Option<String>, key: &'static str| {
            value
                .map(|value| expand_with_home(&value, home))
                .ok_or(ConfigError::Missing(key))
        };

        let state_dir = file
            .state_dir
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(default_state_dir);
        let key_file = file
            .key_file
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| state_dir.join(KEY_FILE));
        let tls = TlsSettings {
            host: file.host.ok_or(ConfigError::Missing("host"))?,
            port: file.port.unwrap_or(DEFAULT_PORT),
            ca_certificate: path(file.ca_certificate, "ca_certificate")?,
            client_certificate: path(file.client_certificate, "client_certificate")?,
            client_key: path(file.client_key, "client_key")?,
            timeout: Duration::from_secs(file.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
        };

        let defaults = SyncParams::default();
        let secs_or = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_secs).unwrap_or(default)
        };
        let params = SyncParams {
            min_file_age: secs_or(file.sync.min_file_age_secs, defaults.min_file_age),
            max_upload_wait: secs_or(file.sync.max_upload_wait_secs, defaults.max_upload_wait),
            max_future_skew: secs_or(file.sync.max_future_skew_secs, defaults.max_future_skew),
            tracking_size_threshold: file
                .sync
                .tracking_size_threshold
                .unwrap_or(defaults.tracking_size_threshold),
            diffing_size_threshold: file
                .sync
                .diffing_size_threshold
                .unwrap_or(defaults.diffing_size_threshold),
        };

        let mut seen = HashSet::new();
        let mut locations = Vec::with_capacity(file.locations.len());
        for location in file.locations {
            if !seen.insert(location.name.clone()) {
                return Err(ConfigError::DuplicateLocation(location.name));
            }
            let rules =
                ExcludeList::parse_lines(&location.exclude).map_err(|source| ConfigError::Rules {
                    location: location.name.clone(),
                    source,
                })?;
            locations.push(LocationConfig {
                path: expand_with_home(&location.path, home),
                name: location.name,
                rules,
            });
        }

        Ok(Self {
            tls,
            account: file.account.ok_or(ConfigError::Missing("account"))?,
            key_file,
            state_dir,
            interval: Duration::from_secs(file.interval_secs.unwrap_or(DEFAULT_INTERVAL_SECS)),
            persistent_inode_map: file.persistent_inode_map,
            params,
            locations,
        })
    }
}

/// What survives between daemon processes besides the inode map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub client_store_marker: Option<i64>,
    /// RFC 3339 end of the last successful run's sync window.
    pub last_sync_end: Option<String>,
}

impl RunState {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("run state at {} is malformed", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    pub fn last_sync_end_micros(&self) -> Option<i64> {
        self.last_sync_end.as_deref().and_then(rfc3339_to_micros)
    }

    pub fn set_last_sync_end_micros(&mut self, micros: i64) {
        self.last_sync_end = micros_to_rfc3339(micros);
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    connection: ConnectionContext<TlsConnector>,
    inode_map: InodeMap,
    locations: Vec<Location>,
    state: RunState,
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.state_dir)
            .await
            .with_context(|| format!("failed to create state dir at {:?}", config.state_dir))?;

        let keys = StoreKeys::load_or_create(&config.key_file)
            .with_context(|| format!("failed to load key material from {:?}", config.key_file))?;
        let connector =
            TlsConnector::new(&config.tls).context("failed to set up the store transport")?;
        let mut connection =
            ConnectionContext::new(connector, config.account, config.tls.host.clone(), keys);

        let state = RunState::load(&config.state_dir.join(RUN_STATE_FILE))?;
        connection.set_client_store_marker(state.client_store_marker);

        let inode_map = if config.persistent_inode_map {
            InodeMap::open(&config.state_dir.join(INODE_DB_FILE))
                .await
                .context("failed to open inode map")?
        } else {
            InodeMap::in_memory()
        };

        let mut records = take_records(&config.state_dir.join(RECORDS_FILE))?;
        let locations = config
            .locations
            .iter()
            .map(|spec| {
                let exclusions = ExclusionEngine::new(Some(spec.path.as_path()), spec.rules.clone());
                let mut location = Location::new(spec.name.clone(), spec.path.clone(), exclusions);
                if let Some(record) = records.remove(&spec.name) {
                    location.record = record;
                }
                location
            })
            .collect();

        Ok(Self {
            config,
            connection,
            inode_map,
            locations,
            state,
            stop: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        })
    }

    /// Syncs every interval until Ctrl-C.
    pub async fn run(mut self) -> anyhow::Result<()> {
        tracing::info!(
            host = %self.config.tls.host,
            account = self.config.account,
            locations = self.locations.len(),
            interval_secs = self.config.interval.as_secs(),
            "started"
        );
        let signal_handle = self.watch_for_shutdown();

        while !self.stop.load(Ordering::SeqCst) {
            if let Err(err) = self.run_once().await {
                tracing::error!(error = %format!("{err:#}"), "backup run failed");
            }
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = self.wake.notified() => {}
            }
        }

        signal_handle.abort();
        tracing::info!("stopped");
        Ok(())
    }

    /// One backup run over every location, with state persisted afterwards.
    pub async fn run_once(&mut self) -> anyhow::Result<SyncReport> {
        let observer = LogObserver;
        let window_end = crate::now_micros() - micros(self.config.params.min_file_age);
        let result = run_backup(
            &mut self.connection,
            &mut self.inode_map,
            &mut self.locations,
            self.config.params.clone(),
            self.state.last_sync_end_micros(),
            &self.stop,
            &observer,
        )
        .await;

        match result {
            Ok(report) => {
                self.state.client_store_marker = self.connection.client_store_marker();
                self.state.set_last_sync_end_micros(window_end);
                self.persist().await?;
                observer.notify(&Notification::BackupOk);
                Ok(report)
            }
            Err(EngineError::Cancelled) => {
                tracing::info!("backup run interrupted by stop request");
                self.state.client_store_marker = self.connection.client_store_marker();
                self.persist_state().await?;
                Ok(SyncReport::default())
            }
            Err(err) => {
                let mismatch = matches!(
                    err,
                    EngineError::Connection(ConnectionError::MarkerMismatch { .. })
                );
                if !mismatch {
                    self.connection.set_client_store_marker(None);
                    self.state.client_store_marker = None;
                }
                self.persist_state().await?;
                observer.notify(&Notification::BackupError {
                    message: err.to_string(),
                });
                Err(err.into())
            }
        }
    }

    pub async fn restore(
        &mut self,
        directory_id: ObjectId,
        destination: &Path,
        options: RestoreOptions,
    ) -> anyhow::Result<RestoreOutcome> {
        let signal_handle = self.watch_for_shutdown();
        self.connection.start_run();
        let result = crate::restore::restore(
            &mut self.connection,
            directory_id,
            destination,
            options,
            &self.stop,
        )
        .await;
        self.connection.close_any_open_connection().await;
        signal_handle.abort();

        self.state.client_store_marker = self.connection.client_store_marker();
        self.persist_state().await?;
        result.with_context(|| format!("restore into {} failed", destination.display()))
    }

    fn watch_for_shutdown(&self) -> tokio::task::JoinHandle<()> {
        let stop = Arc::clone(&self.stop);
        let wake = Arc::clone(&self.wake);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                stop.store(true, Ordering::SeqCst);
                wake.notify_one();
            }
        })
    }

    async fn persist(&self) -> anyhow::Result<()> {
        self.persist_state().await?;
        let records: BTreeMap<&str, &DirectoryRecord> = self
            .locations
            .iter()
            .map(|location| (location.name.as_str(), &location.record))
            .collect();
        write_json_atomic(&self.config.state_dir.join(RECORDS_FILE), &records).await
    }

    async fn persist_state(&self) -> anyhow::Result<()> {
        write_json_atomic(&self.config.state_dir.join(RUN_STATE_FILE), &self.state).await
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
