//! Integration tests over real HTTP: reqwest transport, negotiator and engine
//! against a wiremock server that honors `Range` and conditional headers.

use std::sync::Arc;
use std::time::Duration;

use rangefetch_core::{
    Database, DownloadEngine, DownloadStatus, EngineConfig, HttpTransport, Negotiator,
    ReqwestTransport, RequestOptions, RetryPolicy, TaskRegistry,
};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, Request, Respond, ResponseTemplate};

mod support;
use support::socket_guard::{socket_skip_return, start_mock_server_or_skip};

macro_rules! require_mock_server {
    () => {{
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return socket_skip_return();
        };
        mock_server
    }};
}

const LAST_MODIFIED: &str = "Wed, 21 Oct 2015 07:28:00 GMT";

/// Serves `body` with byte-range and `If-Modified-Since` support.
struct RangeResponder {
    body: Vec<u8>,
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let header = |name: &str| {
            request
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        if header("if-modified-since").as_deref() == Some(LAST_MODIFIED) {
            return ResponseTemplate::new(304);
        }

        let len = self.body.len();
        let requested = header("range").and_then(|value| {
            let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
            let start: usize = start.parse().ok()?;
            let end = if end.is_empty() {
                len - 1
            } else {
                end.parse::<usize>().ok()?.min(len - 1)
            };
            (start <= end).then_some((start, end))
        });

        match requested {
            Some((start, end)) => ResponseTemplate::new(206)
                .insert_header("content-range", format!("bytes {start}-{end}/{len}").as_str())
                .insert_header("last-modified", LAST_MODIFIED)
                .set_body_bytes(self.body[start..=end].to_vec()),
            None => ResponseTemplate::new(200)
                .insert_header("accept-ranges", "bytes")
                .insert_header("last-modified", LAST_MODIFIED)
                .set_body_bytes(self.body.clone()),
        }
    }
}

fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

async fn mount_resource(server: &wiremock::MockServer, route: &str, body: Vec<u8>) {
    Mock::given(path(route))
        .respond_with(RangeResponder { body })
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_negotiator_detects_range_support() -> Result<(), Box<dyn std::error::Error>> {
    let mock_server = require_mock_server!();
    mount_resource(&mock_server, "/archive.zip", content(4096)).await;

    let negotiator = Negotiator::new(Arc::new(ReqwestTransport::new()?));
    let url = format!("{}/archive.zip", mock_server.uri());
    let probe = negotiator.probe_range_support(&url).await?;

    assert!(probe.supports_range);
    assert_eq!(probe.content_length, Some(4096));
    assert_eq!(probe.freshness_token.as_deref(), Some(LAST_MODIFIED));
    assert_eq!(probe.suggested_file_name, "archive.zip");
    Ok(())
}

#[tokio::test]
async fn test_negotiator_freshness_uses_if_modified_since() -> Result<(), Box<dyn std::error::Error>>
{
    let mock_server = require_mock_server!();
    mount_resource(&mock_server, "/archive.zip", content(16)).await;

    let negotiator = Negotiator::new(Arc::new(ReqwestTransport::new()?));
    let url = format!("{}/archive.zip", mock_server.uri());

    let unchanged = negotiator.probe_freshness(&url, LAST_MODIFIED).await?;
    assert!(!unchanged.changed);
    assert_eq!(unchanged.status, 304);
    assert!(unchanged.capabilities.is_none());

    let changed = negotiator
        .probe_freshness(&url, "Mon, 01 Jan 2001 00:00:00 GMT")
        .await?;
    assert!(changed.changed);
    let capabilities = changed.capabilities.ok_or("changed probe lacks capabilities")?;
    assert!(capabilities.supports_range);
    assert_eq!(capabilities.content_length, Some(16));
    assert_eq!(capabilities.freshness_token.as_deref(), Some(LAST_MODIFIED));
    assert_eq!(capabilities.suggested_file_name, "archive.zip");
    Ok(())
}

#[tokio::test]
async fn test_negotiator_maps_error_status() -> Result<(), Box<dyn std::error::Error>> {
    let mock_server = require_mock_server!();
    Mock::given(method("HEAD"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let negotiator = Negotiator::new(Arc::new(ReqwestTransport::new()?));
    let err = negotiator
        .probe_range_support(&format!("{}/missing", mock_server.uri()))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("404"));
    Ok(())
}

#[tokio::test]
async fn test_transport_ranged_get_returns_slice() -> Result<(), Box<dyn std::error::Error>> {
    use futures_util::StreamExt;

    let mock_server = require_mock_server!();
    let body = content(1000);
    mount_resource(&mock_server, "/blob", body.clone()).await;

    let transport = ReqwestTransport::new()?;
    let response = transport
        .get(
            &format!("{}/blob", mock_server.uri()),
            &RequestOptions::range("bytes=100-199"),
        )
        .await?;
    assert_eq!(response.head.status, 206);
    assert_eq!(response.head.content_range_total(), Some(1000));

    let mut received = Vec::new();
    let mut stream = response.body;
    while let Some(piece) = stream.next().await {
        received.extend_from_slice(&piece?);
    }
    assert_eq!(received, body[100..200]);
    Ok(())
}

#[tokio::test]
async fn test_engine_downloads_over_http_in_ranges() -> Result<(), Box<dyn std::error::Error>> {
    let mock_server = require_mock_server!();
    let body = content(10_000);
    mount_resource(&mock_server, "/dataset.bin", body.clone()).await;

    let dir = TempDir::new()?;
    let db = Database::new(&dir.path().join("tasks.db")).await?;
    let config = EngineConfig::default()
        .with_save_dir(dir.path().join("out"))
        .with_thread_count(4)
        .with_retry_policy(RetryPolicy::new(
            2,
            Duration::from_millis(5),
            Duration::from_millis(10),
            2.0,
        ))
        .with_chunk_launch_stagger(Duration::from_millis(1));
    let engine = DownloadEngine::new(
        config,
        Arc::new(ReqwestTransport::new()?),
        Arc::new(TaskRegistry::new(db)),
    )?;

    let url = format!("{}/dataset.bin", mock_server.uri());
    let task = engine.prepare(&url).await?;
    assert!(task.supports_range);

    let last = tokio::time::timeout(Duration::from_secs(10), engine.start(&task)?.wait())
        .await?
        .ok_or("no terminal snapshot")?;
    assert_eq!(last.status, DownloadStatus::Completed);
    assert_eq!(
        std::fs::read(dir.path().join("out").join("dataset.bin"))?,
        body
    );

    let ranged_gets = mock_server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.method.as_str() == "GET")
        .filter(|r| r.headers.contains_key("range"))
        .count();
    assert_eq!(ranged_gets, 4);
    Ok(())
}
