//! Which report to pull and how to map it onto the warehouse schema.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use recon_core::{Filter, ReportDescriptor};
use serde::{Deserialize, Serialize};

pub const HOTEL_CODE: &str = "hotelCode";
pub const DATE: &str = "date";
pub const CHANNEL_NAME: &str = "channelName";
pub const SUB_CHANNEL_NAME: &str = "subChannelName";
pub const BRAND: &str = "brand";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextCorrection {
    pub find: String,
    pub replace: String,
}

impl TextCorrection {
    pub fn new(find: impl Into<String>, replace: impl Into<String>) -> Self {
        Self {
            find: find.into(),
            replace: replace.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonProfile {
    pub publisher: String,
    pub fields: Vec<String>,
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    /// Reporting API field name -> shared column name.
    #[serde(default)]
    pub renames: BTreeMap<String, String>,
    pub metrics: Vec<String>,
    /// Channel names (upper case) dropped from the API side before grouping.
    #[serde(default)]
    pub excluded_channels: Vec<String>,
    /// Applied in order to upper-cased sub-channel names on both sides.
    #[serde(default)]
    pub sub_channel_corrections: Vec<TextCorrection>,
    #[serde(default = "default_api_label")]
    pub api_label: String,
    #[serde(default = "default_warehouse_label")]
    pub warehouse_label: String,
}

fn default_api_label() -> String {
    "api".to_string()
}

fn default_warehouse_label() -> String {
    "warehouse".to_string()
}

impl Default for ComparisonProfile {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let renames = [
            ("profit", "revenue"),
            ("transactions", "bookings"),
            ("custom_decimal_4", "consumedRevenue"),
            ("custom_integer_3", "roomNights"),
            ("sub_placement", SUB_CHANNEL_NAME),
            ("placement", CHANNEL_NAME),
            ("report_date", DATE),
            ("hotel_id", HOTEL_CODE),
            ("hotel_chain", BRAND),
        ]
        .into_iter()
        .map(|(from, to)| (from.to_string(), to.to_string()))
        .collect();

        Self {
            publisher: "other_publishers".to_string(),
            fields: strings(&["transactions", "profit", "custom_decimal_4", "custom_integer_3"]),
            dimensions: strings(&[
                "sub_placement",
                "placement",
                "report_date",
                "hotel_id",
                "hotel_chain",
            ]),
            filters: vec![Filter::new("hotel_country", "in", "US,CA", "AND")],
            renames,
            metrics: strings(&["bookings", "roomNights", "revenue", "consumedRevenue"]),
            excluded_channels: strings(&["UNATTRIBUTED"]),
            sub_channel_corrections: vec![
                TextCorrection::new("_", " "),
                TextCorrection::new("COREBRAND", "CORE BRAND"),
            ],
            api_label: default_api_label(),
            warehouse_label: default_warehouse_label(),
        }
    }
}

impl ComparisonProfile {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing comparison profile")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn report_descriptor(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
        site_id: i64,
    ) -> ReportDescriptor {
        ReportDescriptor::new(
            &self.fields,
            &self.dimensions,
            &self.filters,
            start_date,
            end_date,
            site_id,
            self.publisher.as_str(),
        )
    }

    pub fn shared_column<'a>(&'a self, api_field: &'a str) -> &'a str {
        self.renames.get(api_field).map(String::as_str).unwrap_or(api_field)
    }

    /// Output header: key columns, per-side brand and metrics, deltas, flag.
    pub fn output_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = [HOTEL_CODE, DATE, CHANNEL_NAME, SUB_CHANNEL_NAME]
            .iter()
            .map(|c| c.to_string())
            .collect();
        for label in [&self.api_label, &self.warehouse_label] {
            columns.push(format!("{BRAND}_{label}"));
            columns.extend(self.metrics.iter().map(|m| format!("{m}_{label}")));
        }
        columns.extend(self.metrics.iter().map(|m| format!("{m}_diff")));
        columns.push("hasDiff".to_string());
        columns
    }
}
