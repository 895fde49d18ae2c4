use super::*;
use coffer_core::ObjectId;
use tempfile::tempdir;

const CONFIG: &str = r#"{
    "host": "store.example.net",
    "account": 4660,
    "ca_certificate": "~/coffer/ca.pem",
    "client_certificate": "~/coffer/client.pem",
    "client_key": "/etc/coffer/client.key",
    "state_dir": "~/.local/state/coffer",
    "sync": { "min_file_age_secs": 60, "diffing_size_threshold": 1024 },
    "locations": [
        { "name": "home", "path": "~/", "exclude": [
            "ExcludeDir = /home/user/.cache",
            "ExcludeFilesRegex = \\.tmp$"
        ] },
        { "name": "etc", "path": "/etc" }
    ]
}"#;

fn home() -> PathBuf {
    PathBuf::from("/home/user")
}

#[test]
fn expands_tilde_to_home() {
    assert_eq!(
        expand_with_home("~/backups", &home()),
        PathBuf::from("/home/user/backups")
    );
    assert_eq!(expand_with_home("~", &home()), home());
    assert_eq!(expand_with_home("/srv", &home()), PathBuf::from("/srv"));
}

#[test]
fn reads_intervals_from_env_or_default() {
    assert_eq!(read_u64_env("NO_SUCH_COFFER_ENV_FOR_TEST", 42), 42);
}

#[test]
fn persistent_inode_map_is_enabled_by_default() {
    assert!(read_bool_env("NO_SUCH_COFFER_BOOL_ENV_FOR_TEST", true));
}

#[test]
fn account_numbers_accept_hex() {
    assert_eq!(parse_account("0x1234"), Some(0x1234));
    assert_eq!(parse_account(" 17 "), Some(17));
    assert_eq!(parse_account("seventeen"), None);
}

#[test]
fn parses_config_file() {
    let config = DaemonConfig::parse(CONFIG, &home()).unwrap();
    assert_eq!(config.tls.host, "store.example.net");
    assert_eq!(config.tls.port, DEFAULT_PORT);
    assert_eq!(
        config.tls.ca_certificate,
        PathBuf::from("/home/user/coffer/ca.pem")
    );
    assert_eq!(config.account, 0x1234);
    assert_eq!(
        config.key_file,
        PathBuf::from("/home/user/.local/state/coffer").join(KEY_FILE)
    );
    assert_eq!(config.interval, Duration::from_secs(DEFAULT_INTERVAL_SECS));
    assert!(config.persistent_inode_map);

    assert_eq!(config.params.min_file_age, Duration::from_secs(60));
    assert_eq!(config.params.diffing_size_threshold, 1024);
    assert_eq!(
        config.params.max_upload_wait,
        SyncParams::default().max_upload_wait
    );

    assert_eq!(config.locations.len(), 2);
    assert_eq!(config.locations[0].path, PathBuf::from("/home/user/"));
    assert_eq!(config.locations[0].rules.rules().len(), 2);
    assert!(config.locations[1].rules.is_empty());
}

#[test]
fn missing_certificate_is_reported() {
    let text = r#"{ "host": "h", "account": 1, "ca_certificate": "ca", "client_certificate": "c" }"#;
    let err = DaemonConfig::parse(text, &home()).unwrap_err();
    assert!(matches!(err, ConfigError::Missing("client_key")));
}

#[test]
fn bad_rule_names_the_location() {
    let text = r#"{
        "host": "h", "account": 1,
        "ca_certificate": "ca", "client_certificate": "c", "client_key": "k",
        "locations": [ { "name": "docs", "path": "/docs", "exclude": ["ExcludeDirsRegex = ("] } ]
    }"#;
    let err = DaemonConfig::parse(text, &home()).unwrap_err();
    assert!(matches!(err, ConfigError::Rules { ref location, .. } if location == "docs"));
}

#[test]
fn duplicate_location_is_rejected() {
    let text = r#"{
        "host": "h", "account": 1,
        "ca_certificate": "ca", "client_certificate": "c", "client_key": "k",
        "locations": [ { "name": "a", "path": "/a" }, { "name": "a", "path": "/b" } ]
    }"#;
    let err = DaemonConfig::parse(text, &home()).unwrap_err();
    assert!(matches!(err, ConfigError::DuplicateLocation(name) if name == "a"));
}

#[test]
fn last_sync_end_round_trips_through_rfc3339() {
    let mut state = RunState::default();
    state.set_last_sync_end_micros(1_700_000_000_123_456);
    assert_eq!(
        state.last_sync_end.as_deref(),
        Some("2023-11-14T22:13:20.123456Z")
    );
    assert_eq!(state.last_sync_end_micros(), Some(1_700_000_000_123_456));
}

#[tokio::test]
async fn run_state_is_written_atomically_and_loads_back() {
    let dir = tempdir().unwrap();
    let path = dir.path().join(RUN_STATE_FILE);
    assert_eq!(RunState::load(&path).unwrap(), RunState::default());

    let state = RunState {
        client_store_marker: Some(99),
        last_sync_end: Some("2024-01-01T00:00:00Z".into()),
    };
    write_json_atomic(&path, &state).await.unwrap();
    assert!(!dir.path().join("run-state.json.tmp").exists());
    assert_eq!(RunState::load(&path).unwrap(), state);
}

#[tokio::test]
async fn records_file_is_consumed_on_load() {
    let dir = tempdir().unwrap();
    let path = dir.path().join(RECORDS_FILE);
    let mut record = DirectoryRecord::new("home");
    record.object_id = Some(ObjectId(42));
    record.initial_sync_done = true;
    let mut records = BTreeMap::new();
    records.insert("home", &record);
    write_json_atomic(&path, &records).await.unwrap();

    let loaded = take_records(&path).unwrap();
    assert_eq!(loaded["home"].object_id, Some(ObjectId(42)));
    assert!(!path.exists());
    assert!(take_records(&path).unwrap().is_empty());
}

#[test]
fn malformed_records_are_dropped() {
    let dir = tempdir().unwrap();
    let path = dir.path().join(RECORDS_FILE);
    std::fs::write(&path, b"[1, 2").unwrap();
    assert!(take_records(&path).unwrap().is_empty());
    assert!(!path.exists());
}
