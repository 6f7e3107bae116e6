//! Core domain model for reconciliation runs.
//!
//! Everything in here is pure: field vocabularies, report descriptors, joined
//! rows and the notification message built at the end of a run.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "recon-core";

/// Absolute delta above which a metric counts as a mismatch.
pub const DEFAULT_TOLERANCE: f64 = 0.01;

/// One reporting API row, keyed by caller-vocabulary field name.
pub type Record = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMapping {
    pub caller_name: &'static str,
    pub source_name: &'static str,
}

const HPA_FIELDS: &[FieldMapping] = &[
    FieldMapping {
        caller_name: "placement",
        source_name: "search_type",
    },
    FieldMapping {
        caller_name: "rank_avg",
        source_name: "true_rank_avg",
    },
];

const TRIVAGO_FIELDS: &[FieldMapping] = &[FieldMapping {
    caller_name: "rank_avg",
    source_name: "pos_avg",
}];

/// Per-publisher field renames between caller and source vocabularies.
pub const FIELD_MAPPINGS: &[(&str, &[FieldMapping])] =
    &[("hpa", HPA_FIELDS), ("trivago", TRIVAGO_FIELDS)];

/// Bidirectional field-name translation over [`FIELD_MAPPINGS`].
///
/// Fields without an entry for the publisher pass through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldConverter;

impl FieldConverter {
    pub fn mappings_for(publisher: &str) -> &'static [FieldMapping] {
        FIELD_MAPPINGS
            .iter()
            .find(|(name, _)| *name == publisher)
            .map(|(_, mappings)| *mappings)
            .unwrap_or(&[])
    }

    pub fn to_source_vocabulary(field: &str, publisher: &str) -> String {
        Self::mappings_for(publisher)
            .iter()
            .find(|m| m.caller_name == field)
            .map(|m| m.source_name)
            .unwrap_or(field)
            .to_string()
    }

    pub fn to_caller_vocabulary(field: &str, publisher: &str) -> String {
        Self::mappings_for(publisher)
            .iter()
            .find(|m| m.source_name == field)
            .map(|m| m.caller_name)
            .unwrap_or(field)
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub operation: String,
    pub value: String,
    #[serde(rename = "or_group", alias = "combinator")]
    pub combinator: String,
}

impl Filter {
    pub fn new(
        field: impl Into<String>,
        operation: impl Into<String>,
        value: impl Into<String>,
        combinator: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            operation: operation.into(),
            value: value.into(),
            combinator: combinator.into(),
        }
    }
}

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn single_day(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    /// Whole days between start and end; zero for a single-day window.
    pub fn span_days(&self) -> i64 {
        (self.end - self.start).num_days()
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Immutable description of one reporting API query.
///
/// Field, dimension and filter names are held in the publisher's source
/// vocabulary; translation happens once, in [`ReportDescriptor::new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportDescriptor {
    fields: Vec<String>,
    dimensions: Vec<String>,
    filters: Vec<Filter>,
    window: DateWindow,
    site_id: i64,
    publisher: String,
}

/// Wire body for `POST /api/reporting/{site_id}/{publisher}`.
#[derive(Debug, Clone, Serialize)]
pub struct ReportRequestBody<'a> {
    pub fields: &'a [String],
    pub dimensions: &'a [String],
    pub filters: &'a [Filter],
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl ReportDescriptor {
    pub fn new<S: AsRef<str>>(
        fields: &[S],
        dimensions: &[S],
        filters: &[Filter],
        start_date: NaiveDate,
        end_date: NaiveDate,
        site_id: i64,
        publisher: impl Into<String>,
    ) -> Self {
        let publisher = publisher.into();
        let translate = |names: &[S]| {
            names
                .iter()
                .map(|name| FieldConverter::to_source_vocabulary(name.as_ref(), &publisher))
                .collect::<Vec<_>>()
        };
        let fields = translate(fields);
        let dimensions = translate(dimensions);
        let filters = filters
            .iter()
            .map(|filter| Filter {
                field: FieldConverter::to_source_vocabulary(&filter.field, &publisher),
                ..filter.clone()
            })
            .collect();

        Self {
            fields,
            dimensions,
            filters,
            window: DateWindow::new(start_date, end_date),
            site_id,
            publisher,
        }
    }

    /// Same query over a different date range.
    pub fn with_window(&self, window: DateWindow) -> Self {
        Self {
            window,
            ..self.clone()
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn dimensions(&self) -> &[String] {
        &self.dimensions
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn window(&self) -> DateWindow {
        self.window
    }

    pub fn start_date(&self) -> NaiveDate {
        self.window.start
    }

    pub fn end_date(&self) -> NaiveDate {
        self.window.end
    }

    pub fn site_id(&self) -> i64 {
        self.site_id
    }

    pub fn publisher(&self) -> &str {
        &self.publisher
    }

    pub fn body(&self) -> ReportRequestBody<'_> {
        ReportRequestBody {
            fields: &self.fields,
            dimensions: &self.dimensions,
            filters: &self.filters,
            start_date: self.window.start,
            end_date: self.window.end,
        }
    }
}

impl fmt::Display for ReportDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.body()) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{}/{} {}", self.site_id, self.publisher, self.window),
        }
    }
}

/// Join key shared by both sides after normalization.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReconKey {
    pub hotel_code: String,
    pub date: String,
    pub channel_name: String,
    pub sub_channel_name: String,
}

/// One side's contribution to a joined row. Metric order follows the
/// comparison's metric list.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SideValues {
    pub brand: Option<String>,
    pub metrics: Vec<f64>,
}

impl SideValues {
    pub fn missing(metric_count: usize) -> Self {
        Self {
            brand: None,
            metrics: vec![0.0; metric_count],
        }
    }

    fn metric(&self, idx: usize) -> f64 {
        self.metrics.get(idx).copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRow {
    pub key: ReconKey,
    pub api: SideValues,
    pub warehouse: SideValues,
    pub deltas: Vec<f64>,
    pub has_diff: bool,
}

impl ReconciliationRow {
    /// Builds a joined row; metrics absent on either side count as zero and
    /// `has_diff` is set when any `|api - warehouse|` exceeds `tolerance`.
    pub fn new(
        key: ReconKey,
        api: SideValues,
        warehouse: SideValues,
        metric_count: usize,
        tolerance: f64,
    ) -> Self {
        let mut api = api;
        let mut warehouse = warehouse;
        api.metrics = (0..metric_count).map(|i| api.metric(i)).collect();
        warehouse.metrics = (0..metric_count).map(|i| warehouse.metric(i)).collect();

        let deltas: Vec<f64> = api
            .metrics
            .iter()
            .zip(&warehouse.metrics)
            .map(|(a, b)| a - b)
            .collect();
        let has_diff = deltas.iter().any(|d| d.abs() > tolerance);

        Self {
            key,
            api,
            warehouse,
            deltas,
            has_diff,
        }
    }
}

/// Full joined table of a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub metrics: Vec<String>,
    pub rows: Vec<ReconciliationRow>,
}

impl ComparisonResult {
    pub fn mismatches(&self) -> impl Iterator<Item = &ReconciliationRow> {
        self.rows.iter().filter(|row| row.has_diff)
    }

    pub fn mismatch_count(&self) -> usize {
        self.mismatches().count()
    }

    pub fn is_full_match(&self) -> bool {
        self.mismatch_count() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Success,
    Failure,
}

impl RunStatus {
    pub fn label(&self) -> &'static str {
        match self {
            RunStatus::Success => "SUCCESS",
            RunStatus::Failure => "FAILURE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunParameters {
    pub site_id: i64,
    pub site_company_group_id: i64,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub row_count: usize,
    pub mismatch_count: usize,
    pub full_match: bool,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub run_id: Uuid,
    pub executed_at: DateTime<Utc>,
    pub parameters: RunParameters,
    pub result: ResultSummary,
    pub status: RunStatus,
}

/// Status message published once per run. Fields are fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    subject: String,
    message: NotificationMessage,
}

impl Notification {
    pub fn new(
        run_id: Uuid,
        executed_at: DateTime<Utc>,
        parameters: RunParameters,
        result: ResultSummary,
    ) -> Self {
        let status = if result.full_match {
            RunStatus::Success
        } else {
            RunStatus::Failure
        };
        let outcome = match status {
            RunStatus::Success => format!("all {} rows match", result.row_count),
            RunStatus::Failure => format!(
                "{} of {} rows differ",
                result.mismatch_count, result.row_count
            ),
        };
        let subject = format!(
            "[{}] Reconciliation for site {} ({} to {}): {}",
            status.label(),
            parameters.site_id,
            parameters.start_date,
            parameters.end_date,
            outcome
        );

        Self {
            subject,
            message: NotificationMessage {
                run_id,
                executed_at,
                parameters,
                result,
                status,
            },
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn message(&self) -> &NotificationMessage {
        &self.message
    }

    pub fn status(&self) -> RunStatus {
        self.message.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn key(hotel: &str) -> ReconKey {
        ReconKey {
            hotel_code: hotel.into(),
            date: "2019-06-01".into(),
            channel_name: "DISPLAY".into(),
            sub_channel_name: "CORE BRAND".into(),
        }
    }

    #[test]
    fn unmapped_fields_pass_through_both_ways() {
        for publisher in ["other_publishers", "hpa", "trivago"] {
            assert_eq!(FieldConverter::to_source_vocabulary("profit", publisher), "profit");
            assert_eq!(FieldConverter::to_caller_vocabulary("profit", publisher), "profit");
        }
        assert_eq!(
            FieldConverter::to_source_vocabulary("placement", "trivago"),
            "placement"
        );
    }

    #[test]
    fn mapped_fields_round_trip() {
        for (publisher, mappings) in FIELD_MAPPINGS {
            for mapping in mappings.iter() {
                let source = FieldConverter::to_source_vocabulary(mapping.caller_name, publisher);
                assert_eq!(source, mapping.source_name);
                assert_eq!(
                    FieldConverter::to_caller_vocabulary(&source, publisher),
                    mapping.caller_name
                );
            }
        }
    }

    #[test]
    fn descriptor_translates_without_touching_inputs() {
        let fields = vec!["rank_avg".to_string(), "clicks".to_string()];
        let dimensions = vec!["placement".to_string()];
        let filters = vec![Filter::new("placement", "in", "a,b", "AND")];

        let report = ReportDescriptor::new(
            &fields,
            &dimensions,
            &filters,
            day("2019-06-01"),
            day("2019-06-03"),
            136,
            "hpa",
        );

        assert_eq!(report.fields(), &["true_rank_avg", "clicks"]);
        assert_eq!(report.dimensions(), &["search_type"]);
        assert_eq!(report.filters()[0].field, "search_type");
        assert_eq!(fields[0], "rank_avg");
        assert_eq!(dimensions[0], "placement");
        assert_eq!(filters[0].field, "placement");
    }

    #[test]
    fn descriptor_body_matches_wire_shape() {
        let report = ReportDescriptor::new(
            &["profit"],
            &["report_date"],
            &[Filter::new("hotel_country", "in", "US,CA", "AND")],
            day("2019-06-01"),
            day("2019-06-02"),
            136,
            "other_publishers",
        );
        let body = serde_json::to_value(report.body()).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "fields": ["profit"],
                "dimensions": ["report_date"],
                "filters": [{
                    "field": "hotel_country",
                    "operation": "in",
                    "value": "US,CA",
                    "or_group": "AND",
                }],
                "start_date": "2019-06-01",
                "end_date": "2019-06-02",
            })
        );

        let rewindowed = report.with_window(DateWindow::single_day(day("2019-06-05")));
        assert_eq!(rewindowed.start_date(), day("2019-06-05"));
        assert_eq!(rewindowed.fields(), report.fields());
        assert_eq!(report.start_date(), day("2019-06-01"));
    }

    #[test]
    fn delta_below_tolerance_is_not_a_diff() {
        let row = ReconciliationRow::new(
            key("AB123"),
            SideValues {
                brand: None,
                metrics: vec![100.0],
            },
            SideValues {
                brand: None,
                metrics: vec![100.005],
            },
            1,
            DEFAULT_TOLERANCE,
        );
        assert!((row.deltas[0].abs() - 0.005).abs() < 1e-9);
        assert!(!row.has_diff);

        let row = ReconciliationRow::new(
            key("AB123"),
            SideValues {
                brand: None,
                metrics: vec![100.0],
            },
            SideValues {
                brand: None,
                metrics: vec![99.0],
            },
            1,
            DEFAULT_TOLERANCE,
        );
        assert!((row.deltas[0] - 1.0).abs() < 1e-9);
        assert!(row.has_diff);
    }

    #[test]
    fn missing_side_counts_as_zero() {
        let row = ReconciliationRow::new(
            key("AB123"),
            SideValues {
                brand: Some("X".into()),
                metrics: vec![0.0, 3.0],
            },
            SideValues::missing(0),
            2,
            DEFAULT_TOLERANCE,
        );
        assert_eq!(row.warehouse.metrics, vec![0.0, 0.0]);
        assert_eq!(row.deltas, vec![0.0, 3.0]);
        assert!(row.has_diff);

        let zeros = ReconciliationRow::new(
            key("AB124"),
            SideValues {
                brand: None,
                metrics: vec![0.0, 0.0],
            },
            SideValues::missing(2),
            2,
            DEFAULT_TOLERANCE,
        );
        assert!(!zeros.has_diff);
    }

    #[test]
    fn notification_status_follows_match_flag() {
        let params = RunParameters {
            site_id: 136,
            site_company_group_id: 28,
            start_date: day("2019-06-01"),
            end_date: day("2019-06-01"),
        };
        let ok = Notification::new(
            Uuid::new_v4(),
            Utc::now(),
            params.clone(),
            ResultSummary {
                row_count: 4,
                mismatch_count: 0,
                full_match: true,
                location: "bucket/out.csv".into(),
            },
        );
        assert_eq!(ok.status(), RunStatus::Success);
        assert!(ok.subject().starts_with("[SUCCESS]"));

        let failed = Notification::new(
            Uuid::new_v4(),
            Utc::now(),
            params,
            ResultSummary {
                row_count: 4,
                mismatch_count: 1,
                full_match: false,
                location: "bucket/out.csv".into(),
            },
        );
        assert_eq!(failed.status(), RunStatus::Failure);
        assert!(failed.subject().contains("1 of 4 rows differ"));
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["message"]["status"], "FAILURE");
    }
}
