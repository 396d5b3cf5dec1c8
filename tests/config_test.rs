// ABOUTME: Tests for loading the TOML config file and applying command-line overrides
// ABOUTME: Exercises the file format end to end through SyncConfig::load

use feedback_sync::config::{ConfigOverrides, SyncConfig};
use feedback_sync::remote::Credentials;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::tempdir;

const FULL_CONFIG: &str = r#"
[query_api]
url = "https://api.example.com/graphql"
retry_max_attempts = 4
retry_backoff_ms = 500
request_timeout_secs = 10
records_per_request = 250
default_start_timestamp = 1700000000
default_start_survey_id = "0"
survey_id_field = "a_surveyid"
initial_finish_date_field = "e_responsedate_epoch"
filter = '{ fieldIds: [ e_unit ], in: [ "north" ] }'
nodes = "comment: fieldData(fieldId: q_comment) { values }"

[auth]
token_url = "https://auth.example.com/oauth/token"
client_id = "sync-client"
client_secret = "sync-secret"

[poll]
initial_delay_ms = 1000
interval_ms = 30000

[storage]
database_path = "/var/lib/feedback-sync/records.db"
record_log_path = "/var/log/feedback-sync/records.jsonl"
"#;

#[test]
fn test_load_full_config() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("feedback-sync.toml");
    fs::write(&path, FULL_CONFIG).unwrap();

    let config = SyncConfig::load(&path).unwrap();
    config.validate().unwrap();

    assert_eq!(config.query_api.retry_max_attempts, 4);
    assert_eq!(config.retry_delay(), Duration::from_millis(500));
    assert_eq!(config.request_timeout(), Duration::from_secs(10));
    assert_eq!(config.page_size(), 250);
    assert_eq!(config.initial_delay(), Duration::from_secs(1));
    assert_eq!(config.interval(), Duration::from_secs(30));

    let fields = config.query_fields();
    assert_eq!(fields.initial_finish_date_field, "e_responsedate_epoch");
    assert!(fields.business_filter.contains("e_unit"));
    assert!(fields.custom_nodes.contains("q_comment"));

    let start = config.default_start(chrono::Utc::now()).unwrap();
    assert_eq!(start.timestamp.timestamp(), 1_700_000_000);
    assert_eq!(start.survey_id, "0");

    match config.credentials().unwrap() {
        Some(Credentials::ClientCredentials { client_id, .. }) => {
            assert_eq!(client_id, "sync-client")
        }
        other => panic!("unexpected credentials: {:?}", other),
    }
}

#[test]
fn test_overrides_take_precedence() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("feedback-sync.toml");
    fs::write(&path, FULL_CONFIG).unwrap();

    let mut config = SyncConfig::load(&path).unwrap();
    config.apply_overrides(ConfigOverrides {
        url: Some("http://localhost:8080/graphql".to_string()),
        database: Some(PathBuf::from("local.db")),
        record_log: Some(PathBuf::from("local.jsonl")),
        interval_ms: Some(5_000),
        bearer_token: Some("from-env".to_string()),
    });
    config.validate().unwrap();

    assert_eq!(config.query_api.url, "http://localhost:8080/graphql");
    assert_eq!(config.storage.database_path, PathBuf::from("local.db"));
    assert_eq!(config.storage.record_log_path, PathBuf::from("local.jsonl"));
    assert_eq!(config.interval(), Duration::from_secs(5));
    assert_eq!(
        config.credentials().unwrap(),
        Some(Credentials::Bearer("from-env".to_string()))
    );
}

#[test]
fn test_empty_token_override_is_ignored() {
    let mut config = SyncConfig::from_toml_str(FULL_CONFIG).unwrap();
    config.apply_overrides(ConfigOverrides {
        bearer_token: Some(String::new()),
        ..Default::default()
    });
    assert!(config.auth.bearer_token.is_none());
}

#[test]
fn test_url_from_command_line_only() {
    let mut config = SyncConfig::from_toml_str(
        r#"
        [query_api]
        initial_finish_date_field = "e_finish_epoch"
        "#,
    )
    .unwrap();
    assert!(config.validate().is_err());

    config.apply_overrides(ConfigOverrides {
        url: Some("https://api.example.com/graphql".to_string()),
        ..Default::default()
    });
    config.validate().unwrap();
}

#[test]
fn test_non_http_url_is_rejected() {
    let mut config = SyncConfig::from_toml_str(FULL_CONFIG).unwrap();
    config.query_api.url = "ftp://api.example.com/graphql".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn test_missing_file_reports_path() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    let err = SyncConfig::load(&path).unwrap_err();
    assert!(err.to_string().contains("absent.toml"));
}

#[test]
fn test_malformed_file_is_an_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    fs::write(&path, "[query_api\nurl = ").unwrap();
    assert!(SyncConfig::load(&path).is_err());
}

#[test]
fn test_offline_commands_need_only_query_fields() {
    let mut config = SyncConfig::from_toml_str(
        r#"
        [query_api]
        initial_finish_date_field = "e_finish_epoch"

        [storage]
        database_path = "records.db"
        "#,
    )
    .unwrap();
    config.validate_query().unwrap();
    assert!(config.validate().is_err());

    config.query_api.survey_id_field = " ".to_string();
    assert!(config.validate_query().is_err());
}
