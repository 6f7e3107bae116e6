//! Adaptive date-window batching over a single-shot reporting fetcher.

use async_trait::async_trait;
use chrono::Days;
use recon_core::{DateWindow, Record, ReportDescriptor};
use recon_storage::{ReportingClient, ReportingError};
use tracing::{debug, info};

use crate::ApiFeed;

/// One request per descriptor; `Ok(None)` is "no data for this window".
#[async_trait]
pub trait ReportFetcher: Send + Sync {
    async fn fetch_records(
        &self,
        report: &ReportDescriptor,
    ) -> Result<Option<Vec<Record>>, ReportingError>;
}

#[async_trait]
impl ReportFetcher for ReportingClient {
    async fn fetch_records(
        &self,
        report: &ReportDescriptor,
    ) -> Result<Option<Vec<Record>>, ReportingError> {
        ReportingClient::fetch_records(self, report).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub target_records: usize,
    pub max_window_days: u32,
    pub empty_window_step_days: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            target_records: 100_000,
            max_window_days: 30,
            empty_window_step_days: 3,
        }
    }
}

impl BatchConfig {
    /// Plans the window following `previous` (the last window and how many
    /// records it returned) inside `overall`. The first window is the single
    /// day `overall.start`; `None` once `overall.end` has been covered.
    ///
    /// `max_window_days` caps the end offset: a capped window ends
    /// `max_window_days` days after its start and so spans that many days plus one.
    pub fn next_window(
        &self,
        overall: DateWindow,
        previous: Option<(DateWindow, usize)>,
    ) -> Option<DateWindow> {
        let Some((prev, records)) = previous else {
            if overall.start > overall.end {
                return None;
            }
            return Some(DateWindow::single_day(overall.start));
        };

        if prev.end >= overall.end {
            return None;
        }
        let start = prev.end.succ_opt()?;

        let offset_days = if records > 0 {
            let grown =
                (prev.span_days() + 1) as f64 * self.target_records as f64 / records as f64;
            grown.min(f64::from(self.max_window_days)).floor() as u64
        } else {
            u64::from(self.empty_window_step_days)
        };

        let end = start
            .checked_add_days(Days::new(offset_days))
            .map_or(overall.end, |end| end.min(overall.end));
        Some(DateWindow::new(start, end))
    }
}

/// Splits a descriptor's range into adaptively sized windows and fetches them
/// one after another, concatenating results in window order.
#[derive(Debug, Clone)]
pub struct BatchingReportingClient<F = ReportingClient> {
    fetcher: F,
    config: BatchConfig,
}

impl<F: ReportFetcher> BatchingReportingClient<F> {
    pub fn new(fetcher: F, config: BatchConfig) -> Self {
        Self { fetcher, config }
    }

    pub async fn fetch_all(
        &self,
        report: &ReportDescriptor,
    ) -> Result<Vec<Record>, ReportingError> {
        let overall = report.window();
        info!(
            site_id = report.site_id(),
            publisher = report.publisher(),
            %overall,
            "preparing batched reporting request"
        );

        let mut records = Vec::new();
        let mut previous = None;
        while let Some(window) = self.config.next_window(overall, previous) {
            let windowed = report.with_window(window);
            let count = match self.fetcher.fetch_records(&windowed).await? {
                Some(batch) => {
                    let count = batch.len();
                    records.extend(batch);
                    info!(%window, records = count, "window fetched");
                    debug!(total = records.len(), "accumulated records");
                    count
                }
                None => {
                    info!(
                        site_id = report.site_id(),
                        publisher = report.publisher(),
                        %window,
                        "window has no response"
                    );
                    0
                }
            };
            previous = Some((window, count));
        }

        Ok(records)
    }
}

#[async_trait]
impl<F: ReportFetcher> ApiFeed for BatchingReportingClient<F> {
    async fn fetch(&self, report: &ReportDescriptor) -> Result<Vec<Record>, ReportingError> {
        self.fetch_all(report).await
    }
}
