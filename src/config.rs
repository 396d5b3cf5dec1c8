// ABOUTME: TOML configuration for the feedback sync daemon
// ABOUTME: Holds Query API, auth, polling and storage settings plus CLI overrides

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::remote::Credentials;
use crate::sync::query::{clamp_page_size, QueryFields, StartPoint};
use crate::sync::watermark::utc_from_epoch;

/// Top-level configuration, usually read from `feedback-sync.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    #[serde(default)]
    pub query_api: QueryApiConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Where and how to query for feedback records.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryApiConfig {
    /// GraphQL endpoint. Required, either here or via `--url`.
    #[serde(default)]
    pub url: String,
    /// Attempts per page request, including the first.
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    /// Fixed pause between attempts, in milliseconds.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Page size; values above 1000 are clamped and 0 means 1000.
    #[serde(default = "default_records_per_request")]
    pub records_per_request: usize,
    /// Epoch seconds to start from on an empty store. Unset means "now".
    #[serde(default)]
    pub default_start_timestamp: Option<i64>,
    #[serde(default = "default_start_survey_id")]
    pub default_start_survey_id: String,
    #[serde(default = "default_survey_id_field")]
    pub survey_id_field: String,
    /// Field holding the initial finish date in epoch seconds. Required.
    #[serde(default)]
    pub initial_finish_date_field: String,
    /// Extra filter conjuncts, inserted verbatim.
    #[serde(default)]
    pub filter: String,
    /// Extra node selections, inserted verbatim.
    #[serde(default)]
    pub nodes: String,
}

impl Default for QueryApiConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            records_per_request: default_records_per_request(),
            default_start_timestamp: None,
            default_start_survey_id: default_start_survey_id(),
            survey_id_field: default_survey_id_field(),
            initial_finish_date_field: String::new(),
            filter: String::new(),
            nodes: String::new(),
        }
    }
}

/// Either a static bearer token or OAuth2 client credentials.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub bearer_token: Option<String>,
    pub token_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollConfig {
    #[serde(default)]
    pub initial_delay_ms: u64,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 0,
            interval_ms: default_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_record_log_path")]
    pub record_log_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            record_log_path: default_record_log_path(),
        }
    }
}

fn default_retry_max_attempts() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    2_000
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_records_per_request() -> usize {
    1_000
}

fn default_start_survey_id() -> String {
    "-1".to_string()
}

fn default_survey_id_field() -> String {
    "a_surveyid".to_string()
}

fn default_interval_ms() -> u64 {
    60_000
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./feedback-sync.db")
}

fn default_record_log_path() -> PathBuf {
    PathBuf::from("./records.jsonl")
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub url: Option<String>,
    pub database: Option<PathBuf>,
    pub record_log: Option<PathBuf>,
    pub interval_ms: Option<u64>,
    pub bearer_token: Option<String>,
}

impl SyncConfig {
    /// Read and parse a config file. Call [`SyncConfig::validate`] once
    /// overrides have been applied.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("Invalid TOML configuration")
    }

    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(url) = overrides.url {
            self.query_api.url = url;
        }
        if let Some(database) = overrides.database {
            self.storage.database_path = database;
        }
        if let Some(record_log) = overrides.record_log {
            self.storage.record_log_path = record_log;
        }
        if let Some(interval_ms) = overrides.interval_ms {
            self.poll.interval_ms = interval_ms;
        }
        if let Some(token) = overrides.bearer_token.filter(|t| !t.is_empty()) {
            self.auth.bearer_token = Some(token);
        }
    }

    /// Check required settings and cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        let api = &self.query_api;

        if api.url.trim().is_empty() {
            bail!("query_api.url is required (set it in the config file or pass --url)");
        }
        let parsed = url::Url::parse(&api.url)
            .with_context(|| format!("query_api.url {:?} is not a valid URL", api.url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            bail!(
                "query_api.url must use http or https, got scheme '{}'",
                parsed.scheme()
            );
        }

        self.validate_query()?;

        if self.poll.interval_ms == 0 {
            bail!("poll.interval_ms must be greater than zero");
        }

        self.credentials()?;
        Ok(())
    }

    /// Check only what is needed to render the sync query. Offline commands
    /// use this; they never need the endpoint or credentials.
    pub fn validate_query(&self) -> Result<()> {
        let api = &self.query_api;

        if api.initial_finish_date_field.trim().is_empty() {
            bail!("query_api.initial_finish_date_field is required");
        }
        if api.survey_id_field.trim().is_empty() {
            bail!("query_api.survey_id_field must not be empty");
        }
        if let Some(ts) = api.default_start_timestamp {
            utc_from_epoch(ts).context("query_api.default_start_timestamp is out of range")?;
        }
        Ok(())
    }

    /// Page size actually sent to the Query API.
    pub fn page_size(&self) -> usize {
        clamp_page_size(self.query_api.records_per_request)
    }

    pub fn query_fields(&self) -> QueryFields {
        QueryFields {
            survey_id_field: self.query_api.survey_id_field.clone(),
            initial_finish_date_field: self.query_api.initial_finish_date_field.clone(),
            business_filter: self.query_api.filter.clone(),
            custom_nodes: self.query_api.nodes.clone(),
        }
    }

    /// Lower bound used on an empty store. An unset timestamp resolves to `now`.
    pub fn default_start(&self, now: DateTime<Utc>) -> Result<StartPoint> {
        let timestamp = match self.query_api.default_start_timestamp {
            Some(ts) => utc_from_epoch(ts)?,
            None => now,
        };
        Ok(StartPoint {
            timestamp,
            survey_id: self.query_api.default_start_survey_id.clone(),
        })
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.query_api.retry_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.query_api.request_timeout_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.poll.initial_delay_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.poll.interval_ms)
    }

    /// Resolve the auth section. A bearer token wins over client credentials.
    pub fn credentials(&self) -> Result<Option<Credentials>> {
        let auth = &self.auth;
        if let Some(token) = auth.bearer_token.as_ref().filter(|t| !t.is_empty()) {
            return Ok(Some(Credentials::Bearer(token.clone())));
        }

        match (&auth.token_url, &auth.client_id, &auth.client_secret) {
            (None, None, None) => Ok(None),
            (Some(token_url), Some(client_id), Some(client_secret)) => {
                url::Url::parse(token_url)
                    .with_context(|| format!("auth.token_url {:?} is not a valid URL", token_url))?;
                Ok(Some(Credentials::ClientCredentials {
                    token_url: token_url.clone(),
                    client_id: client_id.clone(),
                    client_secret: client_secret.clone(),
                }))
            }
            _ => bail!(
                "auth.token_url, auth.client_id and auth.client_secret must be set together"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [query_api]
        url = "https://api.example.com/graphql"
        initial_finish_date_field = "e_responsedate_epoch"
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = SyncConfig::from_toml_str(MINIMAL).unwrap();
        config.validate().unwrap();

        assert_eq!(config.query_api.retry_max_attempts, 2);
        assert_eq!(config.query_api.retry_backoff_ms, 2_000);
        assert_eq!(config.query_api.survey_id_field, "a_surveyid");
        assert_eq!(config.query_api.default_start_survey_id, "-1");
        assert_eq!(config.page_size(), 1000);
        assert_eq!(config.interval(), Duration::from_secs(60));
        assert_eq!(config.initial_delay(), Duration::ZERO);
        assert_eq!(
            config.storage.database_path,
            PathBuf::from("./feedback-sync.db")
        );
        assert!(config.credentials().unwrap().is_none());
    }

    #[test]
    fn test_page_size_is_clamped() {
        let mut config = SyncConfig::from_toml_str(MINIMAL).unwrap();
        config.query_api.records_per_request = 5_000;
        assert_eq!(config.page_size(), 1000);
        config.query_api.records_per_request = 0;
        assert_eq!(config.page_size(), 1000);
        config.query_api.records_per_request = 10;
        assert_eq!(config.page_size(), 10);
    }

    #[test]
    fn test_default_start_resolves_now_when_unset() {
        let config = SyncConfig::from_toml_str(MINIMAL).unwrap();
        let now = utc_from_epoch(1_700_000_000).unwrap();
        let start = config.default_start(now).unwrap();
        assert_eq!(start.timestamp, now);
        assert_eq!(start.survey_id, "-1");

        let mut config = config;
        config.query_api.default_start_timestamp = Some(42);
        assert_eq!(config.default_start(now).unwrap().timestamp.timestamp(), 42);
    }

    #[test]
    fn test_missing_required_fields_fail_validation() {
        let config = SyncConfig::from_toml_str("").unwrap();
        assert!(config.validate().is_err());

        let config = SyncConfig::from_toml_str(
            r#"
            [query_api]
            url = "https://api.example.com/graphql"
            "#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("initial_finish_date_field"));
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let mut config = SyncConfig::from_toml_str(MINIMAL).unwrap();
        config.poll.interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_client_credentials_are_rejected() {
        let mut config = SyncConfig::from_toml_str(MINIMAL).unwrap();
        config.auth.client_id = Some("client".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bearer_token_wins() {
        let mut config = SyncConfig::from_toml_str(MINIMAL).unwrap();
        config.auth.token_url = Some("https://auth.example.com/token".to_string());
        config.auth.client_id = Some("client".to_string());
        config.auth.client_secret = Some("secret".to_string());
        config.auth.bearer_token = Some("static".to_string());

        assert!(matches!(
            config.credentials().unwrap(),
            Some(Credentials::Bearer(token)) if token == "static"
        ));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let raw = format!("{}\nrecords_per_page = 10\n", MINIMAL);
        assert!(SyncConfig::from_toml_str(&raw).is_err());
    }
}
