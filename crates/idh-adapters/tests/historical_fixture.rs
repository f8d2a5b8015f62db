use std::path::PathBuf;
use std::time::Duration;

use chrono::{Datelike, TimeZone, Utc};
use idh_adapters::{parse_payload, StatisticsClient, StatisticsSource};
use idh_core::{OrgId, TimeRange};
use idh_storage::{HttpClientConfig, HttpFetcher, PayloadArchive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn fixture_bytes() -> Vec<u8> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/idporten/sample/hours_2020-05-01.json");
    std::fs::read(&path).unwrap_or_else(|err| panic!("reading {}: {err}", path.display()))
}

#[test]
fn may_2020_sample_parses_into_may_2020_observations() {
    let rows = parse_payload(&fixture_bytes()).expect("fixture parses");
    assert_eq!(rows.len(), 25);
    for row in &rows {
        assert_eq!(row.timestamp.year(), 2020, "{row:?}");
        assert_eq!(row.timestamp.month(), 5, "{row:?}");
        assert_eq!(row.source_org, Some(OrgId::new("889640782")));
    }

    let first = &rows[0];
    assert_eq!(first.timestamp, Utc.with_ymd_and_hms(2020, 5, 1, 0, 0, 0).unwrap());
    assert_eq!(first.measurements.antall, 4256);
    assert_eq!(first.measurements.bankid, 151);
    assert_eq!(first.measurements.federated, 3904);
}

#[test]
fn reported_total_is_federated_plus_method_sum() {
    for row in parse_payload(&fixture_bytes()).expect("fixture parses") {
        let m = row.measurements;
        assert_eq!(
            m.method_sum() + i64::from(m.federated),
            i64::from(m.antall),
            "{row:?}"
        );
    }
}

/// Serve one canned HTTP response and hand back the request line the client sent.
async fn serve_once(body: Vec<u8>) -> (String, tokio::task::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.expect("read");
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        let header = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        socket.write_all(header.as_bytes()).await.expect("write header");
        socket.write_all(&body).await.expect("write body");
        socket.shutdown().await.ok();
        String::from_utf8_lossy(&request)
            .lines()
            .next()
            .unwrap_or_default()
            .to_string()
    });
    (format!("http://{addr}"), handle)
}

#[tokio::test]
async fn client_fetches_trims_and_archives_one_day() {
    let (base_url, server) = serve_once(fixture_bytes()).await;
    let archive_dir = tempfile::tempdir().expect("tempdir");
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        min_interval: Duration::ZERO,
        ..Default::default()
    })
    .expect("http client");
    let client = StatisticsClient::new(http, base_url, "991825827/idporten-innlogging/hours")
        .with_archive(PayloadArchive::new(archive_dir.path()));

    let range = TimeRange::new(
        Utc.with_ymd_and_hms(2020, 5, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2020, 5, 2, 0, 0, 0).unwrap(),
    )
    .unwrap();
    let rows = client
        .fetch_hours(&range, &OrgId::new("889640782"))
        .await
        .expect("fetch");

    assert_eq!(rows.len(), 24);
    assert!(rows.iter().all(|r| r.timestamp < range.to));

    let request_line = server.await.expect("server task");
    assert!(request_line.starts_with("GET /991825827/idporten-innlogging/hours?"));
    assert!(request_line.contains("from=2020-05-01T00:00:00Z"));
    assert!(request_line.contains("categories=TE-orgnum=889640782"));

    assert!(archive_dir.path().join("889640782").join("20200501_000000").exists());
}
