//! One reconciliation run: fetch both sides, join, upload, notify.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use recon_core::{Notification, ResultSummary, RunParameters, RunStatus};
use recon_feeds::{
    ApiFeed, BatchingReportingClient, DatabaseClient, DatabaseParams, SqlTemplate, WarehouseFeed,
};
use recon_storage::{
    render_destination_path, Notifier, ObjectStoreSink, ReportingClient, ReportingCredentials,
    ResultSink, S3ResultSink, TracingNotifier, WebhookNotifier,
};
use serde::Serialize;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

mod config;
mod profile;
mod reconcile;

pub use config::{
    env_secrets, secrets_from_lookup, ReconConfig, Secrets, DEFAULT_DESTINATION_PATH,
    DEFAULT_QUERY_PATH,
};
pub use profile::{ComparisonProfile, TextCorrection};
pub use reconcile::{
    join, metric_value, normalize_api_side, normalize_channel, normalize_date, normalize_hotel_code,
    normalize_sub_channel, normalize_warehouse_side, reconcile, write_csv, NormalizedRow,
};

pub const CRATE_NAME: &str = "recon-compare";

/// Per-run knobs that are not part of the profile.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub parameters: RunParameters,
    pub tolerance: f64,
    pub success_destination: String,
    pub failure_destination: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub parameters: RunParameters,
    pub api_records: usize,
    pub warehouse_records: usize,
    pub joined_rows: usize,
    pub mismatch_count: usize,
    pub full_match: bool,
    pub status: RunStatus,
    pub location: String,
    pub content_hash: String,
    pub byte_size: usize,
    pub notified: String,
}

pub struct Comparer {
    settings: RunSettings,
    profile: ComparisonProfile,
    query: SqlTemplate,
    api: Box<dyn ApiFeed>,
    warehouse: Box<dyn WarehouseFeed>,
    sink: Box<dyn ResultSink>,
    notifier: Box<dyn Notifier>,
}

impl Comparer {
    pub fn new(
        settings: RunSettings,
        profile: ComparisonProfile,
        query: SqlTemplate,
        api: Box<dyn ApiFeed>,
        warehouse: Box<dyn WarehouseFeed>,
        sink: Box<dyn ResultSink>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        Self {
            settings,
            profile,
            query,
            api,
            warehouse,
            sink,
            notifier,
        }
    }

    pub async fn run(&self, bucket: &str, path_template: &str) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("comparison", %run_id, site_id = self.settings.parameters.site_id);
        self.run_inner(run_id, bucket, path_template).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        bucket: &str,
        path_template: &str,
    ) -> Result<RunSummary> {
        let started_at = Utc::now();
        let params = &self.settings.parameters;
        info!(
            start_date = %params.start_date,
            end_date = %params.end_date,
            site_company_group_id = params.site_company_group_id,
            "starting comparison"
        );

        let report = self
            .profile
            .report_descriptor(params.start_date, params.end_date, params.site_id);
        let api_records = self
            .api
            .fetch(&report)
            .await
            .context("fetching reporting api records")?;
        info!(records = api_records.len(), "reporting api side fetched");

        let sql = self
            .query
            .render(params.start_date, params.end_date, params.site_company_group_id);
        let warehouse_records = self
            .warehouse
            .run_query(&sql)
            .await
            .context("querying warehouse")?;
        info!(records = warehouse_records.len(), "warehouse side fetched");

        let result = reconcile(
            &self.profile,
            &api_records,
            &warehouse_records,
            self.settings.tolerance,
        );
        let mismatch_count = result.mismatch_count();
        info!(rows = result.rows.len(), mismatch_count, "comparison joined");

        let bytes = write_csv(&self.profile, &result)?;
        let path = render_destination_path(path_template, started_at);
        let stored = self
            .sink
            .upload(bucket, &path, bytes)
            .await
            .with_context(|| format!("uploading comparison to {bucket}/{path}"))?;

        let notification = Notification::new(
            run_id,
            started_at,
            params.clone(),
            ResultSummary {
                row_count: result.rows.len(),
                mismatch_count,
                full_match: result.is_full_match(),
                location: stored.location.clone(),
            },
        );
        let destination = match notification.status() {
            RunStatus::Success => &self.settings.success_destination,
            RunStatus::Failure => &self.settings.failure_destination,
        };
        self.notifier
            .publish(destination, &notification)
            .await
            .with_context(|| format!("publishing notification to {destination}"))?;

        let finished_at = Utc::now();
        info!(
            status = notification.status().label(),
            location = %stored.location,
            elapsed_ms = (finished_at - started_at).num_milliseconds(),
            "comparison finished"
        );

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at,
            parameters: params.clone(),
            api_records: api_records.len(),
            warehouse_records: warehouse_records.len(),
            joined_rows: result.rows.len(),
            mismatch_count,
            full_match: result.is_full_match(),
            status: notification.status(),
            location: stored.location,
            content_hash: stored.content_hash,
            byte_size: stored.byte_size,
            notified: destination.clone(),
        })
    }
}

/// Wires the production clients: batched reporting API, warehouse connection,
/// S3 (or a local directory) and webhooks or log-only notifications.
pub async fn build_comparer(config: &ReconConfig, secrets: &Secrets) -> Result<Comparer> {
    let profile = match &config.profile_path {
        Some(path) => ComparisonProfile::load(path).await?,
        None => ComparisonProfile::default(),
    };
    let query = SqlTemplate::load(&config.query_path)
        .await
        .with_context(|| format!("loading {}", config.query_path.display()))?;

    let http = config.http_client_config();
    let reporting = ReportingClient::new(
        ReportingCredentials {
            host: config.reporting_host.clone(),
            user: config.reporting_user.clone(),
            token: secrets.reporting_token.clone(),
        },
        http.clone(),
    )?;
    let api = BatchingReportingClient::new(reporting, config.batch);

    let warehouse = DatabaseClient::connect(&DatabaseParams {
        host: config.warehouse_host.clone(),
        port: config.warehouse_port,
        username: config.warehouse_user.clone(),
        password: secrets.warehouse_password.clone(),
        database: config.warehouse_database.clone(),
    })
    .await?;

    let sink: Box<dyn ResultSink> = match &config.local_output_dir {
        Some(dir) => Box::new(ObjectStoreSink::local(dir)?),
        None => Box::new(S3ResultSink),
    };

    let (notifier, success_destination, failure_destination): (Box<dyn Notifier>, String, String) =
        match (&config.notify_success_url, &config.notify_failure_url) {
            (Some(success), Some(failure)) => (
                Box::new(WebhookNotifier::new(&http)?),
                success.clone(),
                failure.clone(),
            ),
            _ => (
                Box::new(TracingNotifier),
                "log:success".to_string(),
                "log:failure".to_string(),
            ),
        };

    let settings = RunSettings {
        parameters: RunParameters {
            site_id: config.site_id,
            site_company_group_id: config.site_company_group_id,
            start_date: config.start_date,
            end_date: config.end_date,
        },
        tolerance: config.tolerance,
        success_destination,
        failure_destination,
    };

    Ok(Comparer::new(
        settings,
        profile,
        query,
        Box::new(api),
        Box::new(warehouse),
        sink,
        notifier,
    ))
}

pub async fn run_compare(config: &ReconConfig, secrets: &Secrets) -> Result<RunSummary> {
    let comparer = build_comparer(config, secrets).await?;
    comparer
        .run(&config.destination_bucket, &config.destination_path)
        .await
}

pub async fn run_compare_from_env() -> Result<RunSummary> {
    let config = ReconConfig::from_env()?;
    let secrets = env_secrets()?;
    run_compare(&config, &secrets).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use recon_core::{Record, ReportDescriptor};
    use recon_storage::{NotifyError, ReportingError};
    use object_store::ObjectStore;
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    struct FixedApi(Vec<Record>);

    #[async_trait]
    impl ApiFeed for FixedApi {
        async fn fetch(&self, report: &ReportDescriptor) -> Result<Vec<Record>, ReportingError> {
            assert_eq!(report.publisher(), "other_publishers");
            Ok(self.0.clone())
        }
    }

    struct FixedWarehouse {
        rows: Vec<Record>,
        seen_sql: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl WarehouseFeed for FixedWarehouse {
        async fn run_query(&self, sql: &str) -> Result<Vec<Record>> {
            self.seen_sql.lock().unwrap().push(sql.to_string());
            Ok(self.rows.clone())
        }
    }

    struct FailingWarehouse;

    #[async_trait]
    impl WarehouseFeed for FailingWarehouse {
        async fn run_query(&self, _sql: &str) -> Result<Vec<Record>> {
            anyhow::bail!("connection reset")
        }
    }

    #[derive(Clone, Default)]
    struct RecordingNotifier {
        sent: Arc<Mutex<Vec<(String, Notification)>>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn publish(
            &self,
            destination: &str,
            notification: &Notification,
        ) -> Result<(), NotifyError> {
            self.sent
                .lock()
                .unwrap()
                .push((destination.to_string(), notification.clone()));
            Ok(())
        }
    }

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn row(hotel: &str, channel: &str, bookings: i64) -> Record {
        record(json!({
            "hotelCode": hotel,
            "date": "2019-06-01",
            "channelName": channel,
            "subChannelName": "COREBRAND",
            "bookings": bookings,
        }))
    }

    fn settings() -> RunSettings {
        let day = NaiveDate::from_ymd_opt(2019, 6, 1).unwrap();
        RunSettings {
            parameters: RunParameters {
                site_id: 136,
                site_company_group_id: 28,
                start_date: day,
                end_date: day,
            },
            tolerance: recon_core::DEFAULT_TOLERANCE,
            success_destination: "ok-topic".into(),
            failure_destination: "failed-topic".into(),
        }
    }

    fn comparer(
        api: Vec<Record>,
        warehouse: Box<dyn WarehouseFeed>,
        sink: ObjectStoreSink,
        notifier: RecordingNotifier,
    ) -> Comparer {
        Comparer::new(
            settings(),
            ComparisonProfile::default(),
            SqlTemplate::parse("SELECT * FROM t WHERE d BETWEEN {} AND {} AND g = {}").unwrap(),
            Box::new(FixedApi(api)),
            warehouse,
            Box::new(sink),
            Box::new(notifier),
        )
    }

    #[tokio::test]
    async fn matching_sides_upload_and_notify_success() {
        let sink = ObjectStoreSink::in_memory();
        let store = sink.store();
        let notifier = RecordingNotifier::default();
        let seen_sql = Arc::new(Mutex::new(Vec::new()));
        let warehouse = FixedWarehouse {
            rows: vec![row("AB-123", "display", 5)],
            seen_sql: Arc::clone(&seen_sql),
        };

        let summary = comparer(
            vec![row("AB123", "DISPLAY", 5)],
            Box::new(warehouse),
            sink,
            notifier.clone(),
        )
        .run("results", "recon/compare_{timestamp}.csv")
        .await
        .unwrap();

        assert!(summary.full_match);
        assert_eq!(summary.status, RunStatus::Success);
        assert_eq!(summary.joined_rows, 1);
        assert_eq!(summary.notified, "ok-topic");
        assert!(summary.location.starts_with("memory://results/recon/compare_"));
        assert_eq!(
            seen_sql.lock().unwrap()[0],
            "SELECT * FROM t WHERE d BETWEEN '2019-06-01' AND '2019-06-01' AND g = 28"
        );

        let path = summary.location.trim_start_matches("memory://");
        let stored = store
            .get(&object_store::path::Path::from(path))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(stored.len(), summary.byte_size);
        assert!(String::from_utf8_lossy(&stored).starts_with("hotelCode,date,"));

        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.status(), RunStatus::Success);
        assert_eq!(sent[0].1.message().result.location, summary.location);
    }

    #[tokio::test]
    async fn mismatch_routes_to_failure_destination() {
        let notifier = RecordingNotifier::default();
        let warehouse = FixedWarehouse {
            rows: vec![row("AB123", "DISPLAY", 4)],
            seen_sql: Arc::default(),
        };

        let summary = comparer(
            vec![row("AB123", "DISPLAY", 5), row("ZZ9", "DISPLAY", 1)],
            Box::new(warehouse),
            ObjectStoreSink::in_memory(),
            notifier.clone(),
        )
        .run("results", "out.csv")
        .await
        .unwrap();

        assert!(!summary.full_match);
        assert_eq!(summary.mismatch_count, 2);
        assert_eq!(summary.notified, "failed-topic");
        let sent = notifier.sent.lock().unwrap();
        assert!(sent[0].1.subject().contains("2 of 2 rows differ"));
    }

    #[tokio::test]
    async fn warehouse_failure_aborts_before_publishing() {
        let notifier = RecordingNotifier::default();
        let err = comparer(
            vec![row("AB123", "DISPLAY", 5)],
            Box::new(FailingWarehouse),
            ObjectStoreSink::in_memory(),
            notifier.clone(),
        )
        .run("results", "out.csv")
        .await
        .unwrap_err();

        assert!(format!("{err:#}").contains("connection reset"));
        assert!(notifier.sent.lock().unwrap().is_empty());
    }
}
