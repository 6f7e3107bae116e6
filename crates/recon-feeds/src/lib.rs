//! The two sides of a reconciliation: the windowed reporting API feed and the
//! warehouse query feed.

use anyhow::Result;
use async_trait::async_trait;
use recon_core::{Record, ReportDescriptor};
use recon_storage::ReportingError;

mod batching;
mod warehouse;

pub use batching::{BatchConfig, BatchingReportingClient, ReportFetcher};
pub use warehouse::{DatabaseClient, DatabaseParams, SqlTemplate, TemplateError};

pub const CRATE_NAME: &str = "recon-feeds";

/// Side A: every record the reporting API holds for a descriptor's date range.
#[async_trait]
pub trait ApiFeed: Send + Sync {
    async fn fetch(&self, report: &ReportDescriptor) -> Result<Vec<Record>, ReportingError>;
}

/// Side B: rows returned by one rendered warehouse query.
#[async_trait]
pub trait WarehouseFeed: Send + Sync {
    async fn run_query(&self, sql: &str) -> Result<Vec<Record>>;
}
