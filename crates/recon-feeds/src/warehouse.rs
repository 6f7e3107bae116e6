//! Warehouse side: one connection, one rendered query.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use recon_core::Record;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::{Column, Connection, Row, TypeInfo};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::WarehouseFeed;

#[derive(Clone)]
pub struct DatabaseParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
}

impl fmt::Debug for DatabaseParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

/// Owns a single warehouse connection for the lifetime of one run.
pub struct DatabaseClient {
    conn: Mutex<PgConnection>,
}

impl DatabaseClient {
    pub async fn connect(params: &DatabaseParams) -> Result<Self> {
        debug!(
            host = %params.host,
            port = params.port,
            database = %params.database,
            username = %params.username,
            "creating warehouse connection"
        );
        let options = PgConnectOptions::new()
            .host(&params.host)
            .port(params.port)
            .username(&params.username)
            .password(&params.password)
            .database(&params.database)
            .application_name("recon");
        let conn = PgConnection::connect_with(&options)
            .await
            .with_context(|| {
                format!("connecting to warehouse {}/{}", params.host, params.database)
            })?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub async fn run_query(&self, sql: &str) -> Result<Vec<Record>> {
        let mut conn = self.conn.lock().await;
        let rows = sqlx::query(sql)
            .fetch_all(&mut *conn)
            .await
            .context("running warehouse query")?;
        info!(rows = rows.len(), "warehouse query returned");
        rows.iter().map(row_to_record).collect()
    }
}

#[async_trait]
impl WarehouseFeed for DatabaseClient {
    async fn run_query(&self, sql: &str) -> Result<Vec<Record>> {
        DatabaseClient::run_query(self, sql).await
    }
}

/// Column types the warehouse query may return. Anything else must be cast in
/// the query text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Text,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    Bool,
    Date,
    Timestamp,
    TimestampTz,
}

impl ColumnKind {
    fn from_type_name(type_name: &str) -> Option<Self> {
        let kind = match type_name {
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => Self::Text,
            "INT2" => Self::Int2,
            "INT4" => Self::Int4,
            "INT8" => Self::Int8,
            "FLOAT4" => Self::Float4,
            "FLOAT8" => Self::Float8,
            "NUMERIC" => Self::Numeric,
            "BOOL" => Self::Bool,
            "DATE" => Self::Date,
            "TIMESTAMP" => Self::Timestamp,
            "TIMESTAMPTZ" => Self::TimestampTz,
            _ => return None,
        };
        Some(kind)
    }
}

fn row_to_record(row: &PgRow) -> Result<Record> {
    let mut record = Record::new();
    for column in row.columns() {
        let type_name = column.type_info().name();
        let kind = ColumnKind::from_type_name(type_name).ok_or_else(|| {
            anyhow!(
                "warehouse column {} has unsupported type {type_name}, cast it in the query",
                column.name()
            )
        })?;
        let value = decode_column(row, column.ordinal(), kind)
            .with_context(|| format!("decoding warehouse column {}", column.name()))?;
        record.insert(column.name().to_string(), value);
    }
    Ok(record)
}

fn decimal_value(value: Decimal) -> JsonValue {
    value.to_f64().map_or(JsonValue::Null, JsonValue::from)
}

fn decode_column(row: &PgRow, idx: usize, kind: ColumnKind) -> Result<JsonValue, sqlx::Error> {
    let value = match kind {
        ColumnKind::Text => row.try_get::<Option<String>, _>(idx)?.map(JsonValue::from),
        ColumnKind::Int2 => row.try_get::<Option<i16>, _>(idx)?.map(JsonValue::from),
        ColumnKind::Int4 => row.try_get::<Option<i32>, _>(idx)?.map(JsonValue::from),
        ColumnKind::Int8 => row.try_get::<Option<i64>, _>(idx)?.map(JsonValue::from),
        ColumnKind::Float4 => row
            .try_get::<Option<f32>, _>(idx)?
            .map(|v| JsonValue::from(f64::from(v))),
        ColumnKind::Float8 => row.try_get::<Option<f64>, _>(idx)?.map(JsonValue::from),
        ColumnKind::Numeric => row.try_get::<Option<Decimal>, _>(idx)?.map(decimal_value),
        ColumnKind::Bool => row.try_get::<Option<bool>, _>(idx)?.map(JsonValue::from),
        ColumnKind::Date => row
            .try_get::<Option<NaiveDate>, _>(idx)?
            .map(|d| JsonValue::from(d.format("%Y-%m-%d").to_string())),
        ColumnKind::Timestamp => row
            .try_get::<Option<NaiveDateTime>, _>(idx)?
            .map(|d| JsonValue::from(d.format("%Y-%m-%d %H:%M:%S").to_string())),
        ColumnKind::TimestampTz => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)?
            .map(|d| JsonValue::from(d.to_rfc3339())),
    };
    Ok(value.unwrap_or(JsonValue::Null))
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("reading sql template {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("sql template has {found} positional slots, expected {expected}")]
    SlotCount { found: usize, expected: usize },
    #[error("unmatched brace at byte {0} of sql template")]
    UnmatchedBrace(usize),
}

/// SELECT text with three `{}` slots: quoted start date, quoted end date and
/// the site company group id. `{{` and `}}` stand for literal braces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlTemplate {
    segments: Vec<String>,
}

impl SqlTemplate {
    pub const SLOTS: usize = 3;

    pub fn parse(text: &str) -> Result<Self, TemplateError> {
        let mut segments = vec![String::new()];
        let mut chars = text.char_indices().peekable();
        while let Some((pos, c)) = chars.next() {
            match c {
                '{' => match chars.peek() {
                    Some((_, '{')) => {
                        chars.next();
                        push_char(&mut segments, '{');
                    }
                    Some((_, '}')) => {
                        chars.next();
                        segments.push(String::new());
                    }
                    _ => return Err(TemplateError::UnmatchedBrace(pos)),
                },
                '}' => match chars.peek() {
                    Some((_, '}')) => {
                        chars.next();
                        push_char(&mut segments, '}');
                    }
                    _ => return Err(TemplateError::UnmatchedBrace(pos)),
                },
                other => push_char(&mut segments, other),
            }
        }

        let found = segments.len() - 1;
        if found != Self::SLOTS {
            return Err(TemplateError::SlotCount {
                found,
                expected: Self::SLOTS,
            });
        }
        Ok(Self { segments })
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, TemplateError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| TemplateError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(&text)
    }

    pub fn render(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
        site_company_group_id: i64,
    ) -> String {
        let values = [
            format!("'{}'", start_date.format("%Y-%m-%d")),
            format!("'{}'", end_date.format("%Y-%m-%d")),
            site_company_group_id.to_string(),
        ];
        let mut out = String::new();
        for (idx, segment) in self.segments.iter().enumerate() {
            out.push_str(segment);
            if let Some(value) = values.get(idx) {
                out.push_str(value);
            }
        }
        out
    }
}

fn push_char(segments: &mut [String], c: char) {
    if let Some(last) = segments.last_mut() {
        last.push(c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn renders_quoted_dates_and_group_id_in_order() {
        let template = SqlTemplate::parse(
            "SELECT * FROM stats WHERE day BETWEEN {} AND {} AND group_id = {}",
        )
        .unwrap();
        assert_eq!(
            template.render(day("2019-06-01"), day("2019-06-02"), 28),
            "SELECT * FROM stats WHERE day BETWEEN '2019-06-01' AND '2019-06-02' AND group_id = 28"
        );
    }

    #[test]
    fn doubled_braces_are_literal() {
        let template = SqlTemplate::parse("SELECT '{{x}}', {}, {}, {}").unwrap();
        assert_eq!(
            template.render(day("2019-06-01"), day("2019-06-01"), 1),
            "SELECT '{x}', '2019-06-01', '2019-06-01', 1"
        );
    }

    #[test]
    fn wrong_slot_count_is_rejected() {
        assert!(matches!(
            SqlTemplate::parse("SELECT {} , {}"),
            Err(TemplateError::SlotCount { found: 2, expected: 3 })
        ));
        assert!(matches!(
            SqlTemplate::parse("SELECT {0}, {}, {}"),
            Err(TemplateError::UnmatchedBrace(7))
        ));
    }

    #[tokio::test]
    async fn loads_template_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("query.sql");
        std::fs::write(&path, "SELECT {} {} {}").unwrap();
        let template = SqlTemplate::load(&path).await.unwrap();
        assert_eq!(
            template.render(day("2020-01-01"), day("2020-01-31"), 7),
            "SELECT '2020-01-01' '2020-01-31' 7"
        );

        let missing = SqlTemplate::load(dir.path().join("nope.sql")).await;
        assert!(matches!(missing, Err(TemplateError::Io { .. })));
    }

    #[test]
    fn column_types_dispatch_by_name() {
        assert_eq!(ColumnKind::from_type_name("NUMERIC"), Some(ColumnKind::Numeric));
        assert_eq!(ColumnKind::from_type_name("VARCHAR"), Some(ColumnKind::Text));
        assert_eq!(ColumnKind::from_type_name("FLOAT8"), Some(ColumnKind::Float8));
        assert_eq!(ColumnKind::from_type_name("JSONB"), None);
        assert_eq!(ColumnKind::from_type_name("UUID"), None);
    }

    #[test]
    fn numeric_values_decode_to_floats() {
        assert_eq!(decimal_value(Decimal::new(105, 1)), serde_json::json!(10.5));
        assert_eq!(decimal_value(Decimal::ZERO), serde_json::json!(0.0));
    }

    #[tokio::test]
    async fn shipped_query_has_three_slots() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../queries/warehouse_reconciliation.sql");
        let template = SqlTemplate::load(&path).await.unwrap();
        let sql = template.render(day("2019-06-01"), day("2019-06-02"), 28);
        assert!(sql.contains("BETWEEN '2019-06-01' AND '2019-06-02'"));
        assert!(sql.contains("site_company_group_id = 28"));
    }

    #[test]
    fn database_params_debug_hides_password() {
        let params = DatabaseParams {
            host: "db".into(),
            port: 5432,
            username: "reportrunner".into(),
            password: "hunter2".into(),
            database: "datamart".into(),
        };
        assert!(!format!("{params:?}").contains("hunter2"));
    }
}
