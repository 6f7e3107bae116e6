//! Normalization of both sides onto the shared key, outer join and CSV output.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use recon_core::{ComparisonResult, ReconKey, ReconciliationRow, Record, SideValues};
use serde_json::Value;

use crate::profile::{
    ComparisonProfile, TextCorrection, BRAND, CHANNEL_NAME, DATE, HOTEL_CODE, SUB_CHANNEL_NAME,
};

/// One side's row after normalization; `None` metrics were absent or unparsable.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRow {
    pub key: ReconKey,
    pub brand: Option<String>,
    pub metrics: Vec<Option<f64>>,
}

impl NormalizedRow {
    fn into_side(self) -> SideValues {
        SideValues {
            brand: self.brand,
            metrics: self.metrics.into_iter().map(|m| m.unwrap_or(0.0)).collect(),
        }
    }
}

fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

pub fn normalize_hotel_code(raw: &str) -> String {
    raw.trim().replace('-', "")
}

pub fn normalize_channel(raw: &str) -> String {
    raw.trim().to_uppercase()
}

pub fn normalize_sub_channel(raw: &str, corrections: &[TextCorrection]) -> String {
    let mut name = raw.to_uppercase();
    for correction in corrections {
        if !correction.find.is_empty() {
            name = name.replace(&correction.find, &correction.replace);
        }
    }
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `2019-06-01T00:00:00` and `2019-06-01 00:00:00` both become `2019-06-01`.
pub fn normalize_date(raw: &str) -> String {
    let raw = raw.trim();
    match raw.get(..10) {
        Some(prefix) if NaiveDate::parse_from_str(prefix, "%Y-%m-%d").is_ok() => prefix.to_string(),
        _ => raw.to_string(),
    }
}

pub fn metric_value(value: Option<&Value>) -> Option<f64> {
    let parsed = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn normalize_record(profile: &ComparisonProfile, record: &Record) -> NormalizedRow {
    let field = |name: &str| text(record.get(name)).unwrap_or_default();
    NormalizedRow {
        key: ReconKey {
            hotel_code: normalize_hotel_code(&field(HOTEL_CODE)),
            date: normalize_date(&field(DATE)),
            channel_name: normalize_channel(&field(CHANNEL_NAME)),
            sub_channel_name: normalize_sub_channel(
                &field(SUB_CHANNEL_NAME),
                &profile.sub_channel_corrections,
            ),
        },
        brand: text(record.get(BRAND)).map(|b| b.trim().to_string()),
        metrics: profile
            .metrics
            .iter()
            .map(|metric| metric_value(record.get(metric)))
            .collect(),
    }
}

fn rename_columns(profile: &ComparisonProfile, record: &Record) -> Record {
    record
        .iter()
        .map(|(name, value)| (profile.shared_column(name).to_string(), value.clone()))
        .collect()
}

fn add_metric(acc: Option<f64>, next: Option<f64>) -> Option<f64> {
    match (acc, next) {
        (Some(a), Some(b)) => Some(a + b),
        (Some(v), None) | (None, Some(v)) => Some(v),
        (None, None) => None,
    }
}

/// Side A: rename, normalize, drop excluded channels, then sum per (key, brand).
pub fn normalize_api_side(profile: &ComparisonProfile, records: &[Record]) -> Vec<NormalizedRow> {
    let excluded: Vec<String> = profile
        .excluded_channels
        .iter()
        .map(|c| normalize_channel(c))
        .collect();

    let mut grouped: BTreeMap<(ReconKey, Option<String>), Vec<Option<f64>>> = BTreeMap::new();
    for record in records {
        let row = normalize_record(profile, &rename_columns(profile, record));
        if excluded.contains(&row.key.channel_name) {
            continue;
        }
        match grouped.entry((row.key, row.brand)) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(row.metrics);
            }
            std::collections::btree_map::Entry::Occupied(mut slot) => {
                for (acc, next) in slot.get_mut().iter_mut().zip(row.metrics) {
                    *acc = add_metric(*acc, next);
                }
            }
        }
    }

    grouped
        .into_iter()
        .map(|((key, brand), metrics)| NormalizedRow { key, brand, metrics })
        .collect()
}

/// Side B columns already use the shared names.
pub fn normalize_warehouse_side(
    profile: &ComparisonProfile,
    records: &[Record],
) -> Vec<NormalizedRow> {
    records
        .iter()
        .map(|record| normalize_record(profile, record))
        .collect()
}

/// Full outer join on the key. Duplicate keys pair as a cross product; rows come
/// out ordered by key.
pub fn join(
    api: Vec<NormalizedRow>,
    warehouse: Vec<NormalizedRow>,
    metric_count: usize,
    tolerance: f64,
) -> Vec<ReconciliationRow> {
    let mut by_key: BTreeMap<ReconKey, (Vec<SideValues>, Vec<SideValues>)> = BTreeMap::new();
    for row in api {
        let key = row.key.clone();
        by_key.entry(key).or_default().0.push(row.into_side());
    }
    for row in warehouse {
        let key = row.key.clone();
        by_key.entry(key).or_default().1.push(row.into_side());
    }

    let mut joined = Vec::new();
    for (key, (api_rows, warehouse_rows)) in by_key {
        let api_rows = if api_rows.is_empty() {
            vec![SideValues::missing(metric_count)]
        } else {
            api_rows
        };
        let warehouse_rows = if warehouse_rows.is_empty() {
            vec![SideValues::missing(metric_count)]
        } else {
            warehouse_rows
        };
        for a in &api_rows {
            for b in &warehouse_rows {
                joined.push(ReconciliationRow::new(
                    key.clone(),
                    a.clone(),
                    b.clone(),
                    metric_count,
                    tolerance,
                ));
            }
        }
    }
    joined
}

pub fn reconcile(
    profile: &ComparisonProfile,
    api: &[Record],
    warehouse: &[Record],
    tolerance: f64,
) -> ComparisonResult {
    let api_rows = normalize_api_side(profile, api);
    let warehouse_rows = normalize_warehouse_side(profile, warehouse);
    ComparisonResult {
        metrics: profile.metrics.clone(),
        rows: join(api_rows, warehouse_rows, profile.metrics.len(), tolerance),
    }
}

/// UTF-8 CSV with a header row in [`ComparisonProfile::output_columns`] order.
pub fn write_csv(profile: &ComparisonProfile, result: &ComparisonResult) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(profile.output_columns())
        .context("writing csv header")?;

    for row in &result.rows {
        let mut record = vec![
            row.key.hotel_code.clone(),
            row.key.date.clone(),
            row.key.channel_name.clone(),
            row.key.sub_channel_name.clone(),
        ];
        for side in [&row.api, &row.warehouse] {
            record.push(side.brand.clone().unwrap_or_default());
            record.extend(side.metrics.iter().map(f64::to_string));
        }
        record.extend(row.deltas.iter().map(f64::to_string));
        record.push(row.has_diff.to_string());
        writer.write_record(&record).context("writing csv row")?;
    }

    writer
        .into_inner()
        .map_err(|err| err.into_error())
        .context("flushing csv")
}
