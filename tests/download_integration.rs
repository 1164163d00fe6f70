//! Integration tests for probing, strategy selection, and both download engines.
//!
//! Every test runs against a local wiremock server whose GET handler serves
//! byte ranges from a fixed payload and can be told to fail chosen ranges.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use funget::download::{
    Downloader, EngineError, HttpClient, Mode, ProgressSnapshot, Strategy, TransferDescriptor,
    TransferOptions, download, multi_block_download, single_stream_download,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod support;
use support::{RangeResponder, payload, serve, serve_trickle};

const MIB: u64 = 1024 * 1024;

/// Options with no backoff so retry tests run instantly.
fn options(block_size: u64, workers: usize) -> TransferOptions {
    TransferOptions {
        block_size,
        worker_limit: workers,
        min_multi_size: 1,
        retry_base_delay: Duration::ZERO,
        ..TransferOptions::default()
    }
}

fn recording_observer() -> (
    Arc<Mutex<Vec<ProgressSnapshot>>>,
    Arc<dyn funget::ProgressObserver>,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let observer: Arc<dyn funget::ProgressObserver> =
        Arc::new(move |s: ProgressSnapshot| sink.lock().unwrap().push(s));
    (seen, observer)
}

// ==================== Multi-Block ====================

#[tokio::test]
async fn test_ten_mib_in_one_mib_blocks_with_eight_workers() {
    let body = payload(10 * MIB as usize);
    let responder = RangeResponder::new(body.clone());
    let (_server, url) = serve(&responder).await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("big.bin");

    let descriptor = TransferDescriptor::new(&url, &dest, &options(MIB, 8)).unwrap();
    let (seen, observer) = recording_observer();
    let report = Downloader::new(HttpClient::new())
        .with_observer(observer)
        .download(&descriptor)
        .await
        .unwrap();

    assert_eq!(report.strategy, Some(Strategy::MultiBlock));
    assert_eq!(report.blocks, 10);
    assert_eq!(report.bytes, 10 * MIB);
    assert_eq!(report.retries, 0);
    assert_eq!(std::fs::read(&dest).unwrap(), body);

    for i in 0..10 {
        assert_eq!(responder.hits_for(i * MIB, (i + 1) * MIB - 1), 1, "block {i}");
    }

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 10);
    assert!(
        seen.windows(2)
            .all(|w| w[0].bytes_transferred <= w[1].bytes_transferred)
    );
    let last = seen.last().unwrap();
    assert_eq!(last.bytes_transferred, 10 * MIB);
    assert_eq!(last.total_bytes, Some(10 * MIB));
    assert!(last.is_complete());
}

#[tokio::test]
async fn test_small_resource_is_one_block() {
    let body = payload(1000);
    let responder = RangeResponder::new(body.clone());
    let (_server, url) = serve(&responder).await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("small.bin");

    let report = download(&url, &dest, &options(100 * MIB, 10))
        .await
        .unwrap();

    assert_eq!(report.strategy, Some(Strategy::MultiBlock));
    assert_eq!(report.blocks, 1);
    assert_eq!(responder.hits_for(0, 999), 1);
    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn test_last_block_is_truncated() {
    let body = payload(2500);
    let responder = RangeResponder::new(body.clone());
    let (_server, url) = serve(&responder).await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("odd.bin");

    let report = download(&url, &dest, &options(1000, 4)).await.unwrap();

    assert_eq!(report.blocks, 3);
    assert_eq!(responder.hits_for(2000, 2499), 1);
    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn test_multi_block_and_single_stream_produce_identical_files() {
    let body = payload(300_000);
    let responder = RangeResponder::new(body.clone());
    let (_server, url) = serve(&responder).await;
    let dir = TempDir::new().unwrap();
    let multi_dest = dir.path().join("multi.bin");
    let single_dest = dir.path().join("single.bin");

    let multi = multi_block_download(&url, &multi_dest, &options(64 * 1024, 3))
        .await
        .unwrap();
    let single = single_stream_download(&url, &single_dest, &options(64 * 1024, 3))
        .await
        .unwrap();

    assert_eq!(multi.strategy, Some(Strategy::MultiBlock));
    assert_eq!(multi.blocks, 5);
    assert_eq!(single.strategy, Some(Strategy::SingleStream));
    assert_eq!(single.blocks, 0);
    let multi_bytes = std::fs::read(&multi_dest).unwrap();
    assert_eq!(multi_bytes, std::fs::read(&single_dest).unwrap());
    assert_eq!(multi_bytes, body);
}

#[tokio::test]
async fn test_below_min_multi_size_streams() {
    let responder = RangeResponder::new(payload(4096));
    let (_server, url) = serve(&responder).await;
    let dir = TempDir::new().unwrap();
    let opts = TransferOptions {
        min_multi_size: MIB,
        ..options(1024, 4)
    };

    let report = download(&url, dir.path().join("f.bin"), &opts)
        .await
        .unwrap();

    assert_eq!(report.strategy, Some(Strategy::SingleStream));
    let ranged: Vec<_> = responder.ranges_seen().into_iter().flatten().collect();
    assert_eq!(ranged, vec!["bytes=0-0".to_string()]);
}

// ==================== Range support ====================

#[tokio::test]
async fn test_server_without_ranges_gets_single_stream_only() {
    let body = payload(3 * MIB as usize);
    let responder = RangeResponder::new(body.clone()).without_ranges();
    let (_server, url) = serve(&responder).await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("plain.bin");

    let report = multi_block_download(&url, &dest, &options(MIB, 4))
        .await
        .unwrap();

    assert_eq!(report.strategy, Some(Strategy::SingleStream));
    assert_eq!(std::fs::read(&dest).unwrap(), body);
    for range in responder.ranges_seen().into_iter().flatten() {
        assert_eq!(range, "bytes=0-0", "only the probe may carry a Range header");
    }
}

#[tokio::test]
async fn test_probe_reports_size_and_range_support() {
    let responder = RangeResponder::new(payload(5000));
    let (_server, url) = serve(&responder).await;
    let descriptor = TransferDescriptor::new(&url, "/tmp/unused", &options(MIB, 1)).unwrap();
    let downloader = Downloader::default();

    let meta = downloader.probe(&descriptor).await.unwrap();
    assert_eq!(meta.total_size, Some(5000));
    assert!(meta.supports_range);

    let info = downloader.file_info(&descriptor).await.unwrap();
    assert_eq!(info.file_size, Some(5000));
    assert_eq!(info.file_name, "unused");
    assert!(!info.overwrite);
    assert!(downloader.validate_url(&descriptor).await);
}

#[tokio::test]
async fn test_probe_without_ranges() {
    let responder = RangeResponder::new(payload(5000)).without_ranges();
    let (_server, url) = serve(&responder).await;
    let descriptor = TransferDescriptor::new(&url, "/tmp/unused", &options(MIB, 1)).unwrap();

    let meta = Downloader::default().probe(&descriptor).await.unwrap();
    assert_eq!(meta.total_size, Some(5000));
    assert!(!meta.supports_range);
}

// ==================== Retries ====================

#[tokio::test]
async fn test_flaky_block_recovers_within_budget() {
    let body = payload(4 * MIB as usize);
    let responder = RangeResponder::new(body.clone()).fail_range(MIB, 2 * MIB - 1, 2);
    let (_server, url) = serve(&responder).await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("flaky.bin");

    let report = download(&url, &dest, &options(MIB, 4)).await.unwrap();

    assert_eq!(report.retries, 2);
    assert_eq!(responder.hits_for(MIB, 2 * MIB - 1), 3);
    assert_eq!(responder.hits_for(0, MIB - 1), 1);
    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn test_block_exhausting_retries_fails_transfer_and_others_finish() {
    let responder = RangeResponder::new(payload(4 * MIB as usize)).fail_range(MIB, 2 * MIB - 1, 3);
    let (_server, url) = serve(&responder).await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("broken.bin");

    let err = download(&url, &dest, &options(MIB, 2)).await.unwrap_err();

    let EngineError::Transfer { failures, .. } = &err else {
        panic!("expected transfer error, got {err}");
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].index, 1);
    assert_eq!((failures[0].start, failures[0].end), (MIB, Some(2 * MIB - 1)));
    assert_eq!(failures[0].attempts, 3);
    assert!(failures[0].error.contains("500"));
    assert_eq!(responder.hits_for(MIB, 2 * MIB - 1), 3);
    for i in [0, 2, 3] {
        assert_eq!(responder.hits_for(i * MIB, (i + 1) * MIB - 1), 1, "block {i}");
    }
    assert!(dest.exists(), "partial files are kept");
}

#[tokio::test]
async fn test_permanent_block_error_is_not_retried() {
    let responder = RangeResponder::new(payload(2 * MIB as usize))
        .fail_range(0, MIB - 1, 1)
        .fail_status(404);
    let (_server, url) = serve(&responder).await;
    let dir = TempDir::new().unwrap();

    let err = download(&url, dir.path().join("gone.bin"), &options(MIB, 2))
        .await
        .unwrap_err();

    assert_eq!(err.failures().len(), 1);
    assert_eq!(err.failures()[0].attempts, 1);
    assert_eq!(responder.hits_for(0, MIB - 1), 1);
}

#[tokio::test]
async fn test_single_stream_retries_from_scratch() {
    let body = payload(200_000);
    let responder = RangeResponder::new(body.clone())
        .without_ranges()
        .fail_full(2);
    let (_server, url) = serve(&responder).await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("stream.bin");

    let report = download(&url, &dest, &options(MIB, 1)).await.unwrap();

    assert_eq!(report.strategy, Some(Strategy::SingleStream));
    assert_eq!(report.retries, 2);
    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn test_single_stream_exhausts_retries() {
    let responder = RangeResponder::new(payload(1000))
        .without_ranges()
        .fail_full(5);
    let (_server, url) = serve(&responder).await;
    let dir = TempDir::new().unwrap();

    let err = single_stream_download(&url, dir.path().join("s.bin"), &options(MIB, 1))
        .await
        .unwrap_err();

    let failures = err.failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].stream);
    assert_eq!((failures[0].start, failures[0].end), (0, Some(999)));
    assert_eq!(failures[0].attempts, 3);
    let msg = err.to_string();
    assert!(msg.contains("stream [0-999]"), "{msg}");
    assert!(!msg.contains("block 0"), "{msg}");
}

// ==================== Timeouts ====================

#[tokio::test]
async fn test_slow_steady_body_outlives_timeout() {
    let body = payload(20);
    let url = serve_trickle(body.clone(), Duration::from_millis(100), None).await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("slow.bin");
    let opts = TransferOptions {
        timeout: Duration::from_secs(1),
        max_retries: 1,
        ..options(MIB, 1)
    };

    let report = single_stream_download(&url, &dest, &opts).await.unwrap();

    assert_eq!(report.bytes, 20);
    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn test_stalled_body_times_out() {
    let url = serve_trickle(payload(20), Duration::from_millis(5), Some(5)).await;
    let dir = TempDir::new().unwrap();
    let opts = TransferOptions {
        timeout: Duration::from_millis(300),
        max_retries: 1,
        ..options(MIB, 1)
    };

    let started = Instant::now();
    let err = single_stream_download(&url, dir.path().join("stall.bin"), &opts)
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(5));
    let failures = err.failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].error.contains("timeout"), "{err}");
}

#[tokio::test]
async fn test_single_stream_short_body_is_retried_then_fails() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/short"))
        .respond_with(ResponseTemplate::new(200).insert_header("Content-Length", "2000"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/short"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(1000)))
        .expect(1 + 2)
        .mount(&server)
        .await;
    let dir = TempDir::new().unwrap();
    let opts = TransferOptions {
        max_retries: 2,
        ..options(MIB, 1)
    };

    let err = download(&format!("{}/short", server.uri()), dir.path().join("s"), &opts)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("short read"), "{err}");
    assert_eq!(err.failures()[0].attempts, 2);
}

// ==================== Destination ====================

#[tokio::test]
async fn test_existing_destination_conflicts_without_touching_it() {
    let responder = RangeResponder::new(payload(1000));
    let (server, url) = serve(&responder).await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("exists.bin");
    std::fs::write(&dest, b"keep me").unwrap();

    let err = download(&url, &dest, &options(MIB, 1)).await.unwrap_err();

    assert!(matches!(err, EngineError::Conflict { .. }), "{err}");
    assert_eq!(std::fs::read(&dest).unwrap(), b"keep me");
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_overwrite_replaces_existing_file() {
    let body = payload(3000);
    let responder = RangeResponder::new(body.clone());
    let (_server, url) = serve(&responder).await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("exists.bin");
    std::fs::write(&dest, vec![7u8; 10_000]).unwrap();
    let opts = TransferOptions {
        overwrite: true,
        ..options(1000, 2)
    };

    download(&url, &dest, &opts).await.unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn test_create_dirs_controls_parent_creation() {
    let responder = RangeResponder::new(payload(100));
    let (_server, url) = serve(&responder).await;
    let dir = TempDir::new().unwrap();
    let nested = dir.path().join("a").join("b").join("f.bin");

    let no_dirs = TransferOptions {
        create_dirs: false,
        ..options(MIB, 1)
    };
    let err = download(&url, &nested, &no_dirs).await.unwrap_err();
    assert!(matches!(err, EngineError::Io { .. }), "{err}");

    download(&url, &nested, &options(MIB, 1)).await.unwrap();
    assert_eq!(std::fs::read(&nested).unwrap().len(), 100);
}

#[tokio::test]
async fn test_zero_length_resource_creates_empty_file() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/empty"))
        .respond_with(ResponseTemplate::new(200).insert_header("Content-Length", "0"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/empty"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("empty.bin");

    let report = download(&format!("{}/empty", server.uri()), &dest, &options(MIB, 4))
        .await
        .unwrap();

    assert_eq!(report.bytes, 0);
    assert_eq!(report.strategy, None);
    assert_eq!(std::fs::metadata(&dest).unwrap().len(), 0);
}

// ==================== Failures before transfer ====================

#[tokio::test]
async fn test_head_404_is_resolution_error() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("missing.bin");
    let url = format!("{}/missing", server.uri());

    let err = download(&url, &dest, &options(MIB, 1)).await.unwrap_err();

    assert!(matches!(err, EngineError::Resolution { .. }), "{err}");
    assert!(!dest.exists());

    let descriptor = TransferDescriptor::new(&url, &dest, &options(MIB, 1)).unwrap();
    assert!(!Downloader::default().validate_url(&descriptor).await);
}

#[tokio::test]
async fn test_caller_headers_are_sent() {
    let responder = RangeResponder::new(payload(2048));
    let (server, url) = serve(&responder).await;
    let dir = TempDir::new().unwrap();
    let opts = options(1024, 2).header("X-Token", "secret");

    download(&url, dir.path().join("h.bin"), &opts).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert!(requests.len() >= 4);
    for request in requests {
        assert_eq!(
            request.headers.get("x-token").and_then(|v| v.to_str().ok()),
            Some("secret")
        );
    }
}

// ==================== Cancellation ====================

#[tokio::test]
async fn test_cancel_during_multi_block_returns_cancelled() {
    let responder = RangeResponder::new(payload(4 * MIB as usize));
    let (_server, url) = serve(&responder).await;
    let dir = TempDir::new().unwrap();
    let descriptor =
        TransferDescriptor::new(&url, dir.path().join("c.bin"), &options(256 * 1024, 1)).unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let downloader = Downloader::default()
        .with_cancel_token(cancel)
        .with_observer(Arc::new(move |_: ProgressSnapshot| trigger.cancel()));

    let err = downloader
        .download_with(&descriptor, Mode::MultiBlock)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Cancelled), "{err}");
    let fetched = responder.ranges_seen().len();
    assert!(fetched < 1 + 16, "cancel should stop further blocks, saw {fetched}");
}

#[tokio::test]
async fn test_cancel_before_start_sends_nothing() {
    let responder = RangeResponder::new(payload(100));
    let (server, url) = serve(&responder).await;
    let dir = TempDir::new().unwrap();
    let descriptor =
        TransferDescriptor::new(&url, dir.path().join("c.bin"), &options(MIB, 1)).unwrap();
    let downloader = Downloader::default();
    downloader.cancel();

    let err = downloader.download(&descriptor).await.unwrap_err();

    assert!(matches!(err, EngineError::Cancelled));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_interrupts_retry_after_wait_for_block() {
    let responder = RangeResponder::new(payload(100))
        .fail_range(0, 99, 5)
        .fail_status(429)
        .retry_after("20");
    let (_server, url) = serve(&responder).await;
    let dir = TempDir::new().unwrap();
    let descriptor =
        TransferDescriptor::new(&url, dir.path().join("b.bin"), &options(100, 1)).unwrap();
    let downloader = Downloader::default();
    let token = downloader.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        token.cancel();
    });

    let started = Instant::now();
    let err = downloader
        .download_with(&descriptor, Mode::MultiBlock)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Cancelled), "{err}");
    assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
    assert_eq!(responder.hits_for(0, 99), 1);
}

#[tokio::test]
async fn test_cancel_interrupts_retry_after_wait_for_stream() {
    let responder = RangeResponder::new(payload(100))
        .without_ranges()
        .fail_full(5)
        .fail_status(429)
        .retry_after("20");
    let (_server, url) = serve(&responder).await;
    let dir = TempDir::new().unwrap();
    let descriptor =
        TransferDescriptor::new(&url, dir.path().join("s.bin"), &options(MIB, 1)).unwrap();
    let downloader = Downloader::default();
    let token = downloader.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        token.cancel();
    });

    let started = Instant::now();
    let err = downloader
        .download_with(&descriptor, Mode::SingleStream)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Cancelled), "{err}");
    assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
}
