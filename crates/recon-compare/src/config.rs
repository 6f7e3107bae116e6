use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{Days, NaiveDate, Utc};
use recon_core::DEFAULT_TOLERANCE;
use recon_feeds::BatchConfig;
use recon_storage::{BackoffPolicy, HttpClientConfig};

pub const DEFAULT_DESTINATION_PATH: &str = "reconciliation/compare_{timestamp}.csv";
pub const DEFAULT_QUERY_PATH: &str = "queries/warehouse_reconciliation.sql";

/// Everything a run needs except the two secrets.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconConfig {
    pub site_id: i64,
    pub site_company_group_id: i64,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub reporting_host: String,
    pub reporting_user: String,
    pub warehouse_host: String,
    pub warehouse_port: u16,
    pub warehouse_user: String,
    pub warehouse_database: String,
    pub query_path: PathBuf,
    pub profile_path: Option<PathBuf>,
    pub destination_bucket: String,
    pub destination_path: String,
    pub local_output_dir: Option<PathBuf>,
    pub notify_success_url: Option<String>,
    pub notify_failure_url: Option<String>,
    pub tolerance: f64,
    pub batch: BatchConfig,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl ReconConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let yesterday = Utc::now()
            .date_naive()
            .checked_sub_days(Days::new(1))
            .ok_or_else(|| anyhow!("cannot compute yesterday's date"))?;
        let date = |key: &str| -> Result<NaiveDate> {
            match get(key) {
                Some(raw) => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                    .with_context(|| format!("{key} must be YYYY-MM-DD, got {raw:?}")),
                None => Ok(yesterday),
            }
        };
        let batch_defaults = BatchConfig::default();
        let tolerance = parsed(&get, "RECON_TOLERANCE", DEFAULT_TOLERANCE)?;
        if !tolerance.is_finite() || tolerance < 0.0 {
            bail!("RECON_TOLERANCE must be a finite number >= 0, got {tolerance}");
        }

        Ok(Self {
            site_id: parsed(&get, "RECON_SITE_ID", 136)?,
            site_company_group_id: parsed(&get, "RECON_SITE_COMPANY_GROUP_ID", 28)?,
            start_date: date("RECON_START_DATE")?,
            end_date: date("RECON_END_DATE")?,
            reporting_host: get("REPORTING_HOST")
                .unwrap_or_else(|| "http://localhost:8080".to_string()),
            reporting_user: get("REPORTING_USER").unwrap_or_default(),
            warehouse_host: get("WAREHOUSE_HOST").unwrap_or_else(|| "localhost".to_string()),
            warehouse_port: parsed(&get, "WAREHOUSE_PORT", 5432)?,
            warehouse_user: get("WAREHOUSE_USER").unwrap_or_default(),
            warehouse_database: get("WAREHOUSE_DATABASE")
                .unwrap_or_else(|| "datamart".to_string()),
            query_path: get("RECON_QUERY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_QUERY_PATH)),
            profile_path: get("RECON_PROFILE_PATH").map(PathBuf::from),
            destination_bucket: get("RECON_DESTINATION_BUCKET")
                .unwrap_or_else(|| "recon-results".to_string()),
            destination_path: get("RECON_DESTINATION_PATH")
                .unwrap_or_else(|| DEFAULT_DESTINATION_PATH.to_string()),
            local_output_dir: get("RECON_LOCAL_OUTPUT_DIR").map(PathBuf::from),
            notify_success_url: get("RECON_NOTIFY_SUCCESS_URL"),
            notify_failure_url: get("RECON_NOTIFY_FAILURE_URL"),
            tolerance,
            batch: BatchConfig {
                target_records: parsed(
                    &get,
                    "RECON_TARGET_RECORDS",
                    batch_defaults.target_records,
                )?,
                max_window_days: parsed(
                    &get,
                    "RECON_MAX_WINDOW_DAYS",
                    batch_defaults.max_window_days,
                )?,
                empty_window_step_days: parsed(
                    &get,
                    "RECON_EMPTY_WINDOW_STEP_DAYS",
                    batch_defaults.empty_window_step_days,
                )?,
            },
            http_timeout_secs: parsed(&get, "RECON_HTTP_TIMEOUT_SECS", 300)?,
            user_agent: get("RECON_USER_AGENT").unwrap_or_else(|| "recon/0.1".to_string()),
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy::default(),
        }
    }
}

fn parsed<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|err| anyhow!("{key}={raw:?} is invalid: {err}")),
        None => Ok(default),
    }
}

/// Warehouse password and reporting token; supplied per request or from env.
#[derive(Clone, PartialEq, Eq)]
pub struct Secrets {
    pub warehouse_password: String,
    pub reporting_token: String,
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secrets")
            .field("warehouse_password", &"<redacted>")
            .field("reporting_token", &"<redacted>")
            .finish()
    }
}

pub fn env_secrets() -> Result<Secrets> {
    secrets_from_lookup(|key| std::env::var(key).ok())
}

pub fn secrets_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Secrets> {
    let require = |key: &str| {
        lookup(key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow!("{key} is not set"))
    };
    Ok(Secrets {
        warehouse_password: require("WAREHOUSE_PASSWORD")?,
        reporting_token: require("REPORTING_TOKEN")?,
    })
}
