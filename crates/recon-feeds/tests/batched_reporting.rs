use std::time::Duration;

use chrono::NaiveDate;
use recon_core::ReportDescriptor;
use recon_feeds::{ApiFeed, BatchConfig, BatchingReportingClient};
use recon_storage::{BackoffPolicy, HttpClientConfig, ReportingClient, ReportingCredentials};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn day(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn rows(n: usize, date: &str) -> serde_json::Value {
    let data: Vec<_> = (0..n).map(|i| json!([format!("H{i}"), date, 1])).collect();
    json!({
        "headers": ["hotel_id", "report_date", "transactions"],
        "pretty_headers": {"hotel_id": "Hotel", "report_date": "Date", "transactions": "Bookings"},
        "data": data,
    })
}

async fn mount_window(server: &MockServer, start: &str, end: &str, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/api/reporting/136/other_publishers"))
        .and(body_partial_json(json!({"start_date": start, "end_date": end})))
        .respond_with(response)
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn batches_windows_and_skips_failed_ones() {
    let server = MockServer::start().await;

    mount_window(
        &server,
        "2019-06-01",
        "2019-06-01",
        ResponseTemplate::new(200).set_body_json(rows(2, "2019-06-01")),
    )
    .await;
    // target 2, D = 0, R = 2 -> one day offset
    mount_window(&server, "2019-06-02", "2019-06-03", ResponseTemplate::new(500)).await;
    // failed window counts as empty -> three day step
    mount_window(
        &server,
        "2019-06-04",
        "2019-06-07",
        ResponseTemplate::new(200).set_body_json(json!({"status": "empty"})),
    )
    .await;
    mount_window(
        &server,
        "2019-06-08",
        "2019-06-08",
        ResponseTemplate::new(200).set_body_json(rows(1, "2019-06-08")),
    )
    .await;

    let reporting = ReportingClient::new(
        ReportingCredentials {
            host: server.uri(),
            user: "u".into(),
            token: "t".into(),
        },
        HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: None,
            backoff: BackoffPolicy::none(),
        },
    )
    .unwrap();
    let batched = BatchingReportingClient::new(
        reporting,
        BatchConfig {
            target_records: 2,
            ..BatchConfig::default()
        },
    );

    let report = ReportDescriptor::new(
        &["transactions"],
        &["hotel_id", "report_date"],
        &[],
        day("2019-06-01"),
        day("2019-06-08"),
        136,
        "other_publishers",
    );
    let records = batched.fetch(&report).await.expect("batch");

    assert_eq!(records.len(), 3);
    assert_eq!(records[0]["report_date"], json!("2019-06-01"));
    assert_eq!(records[2]["report_date"], json!("2019-06-08"));
    assert_eq!(records[2]["hotel_id"], json!("H0"));
}
