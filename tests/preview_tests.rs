// 预览获取集成测试

mod common;

use common::{orchestrator, test_config, MockTransport};
use media_ingest::config::QueueLimits;
use media_ingest::transport::TransportErrorKind;
use media_ingest::{FetchError, Fingerprint};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn fingerprints(n: u8) -> Vec<Fingerprint> {
    (0..n)
        .map(|i| Fingerprint::from_hex(format!("{:02x}", i).repeat(32)).unwrap())
        .collect()
}

#[tokio::test]
async fn test_cache_hit_avoids_network() {
    let transport = Arc::new(MockTransport::new());
    let orch = orchestrator(&test_config(3), transport.clone());
    let fp = Fingerprint::from_hex("ab".repeat(32)).unwrap();

    let first = orch.fetch_cached(&fp).await.unwrap();
    let second = orch.fetch_cached(&fp).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(transport.preview_calls.load(Ordering::SeqCst), 1);
    assert!(orch.cache().contains(&media_ingest::CacheKey::preview(fp)));
}

#[tokio::test]
async fn test_uppercase_fingerprint_shares_cache_entry() {
    let transport = Arc::new(MockTransport::new());
    let orch = orchestrator(&test_config(3), transport.clone());

    assert!("aaaaaaaaaaa\u{e9}".parse::<Fingerprint>().is_err());
    assert!("../../etc/passwd".parse::<Fingerprint>().is_err());

    let upper: Fingerprint = "AB".repeat(32).parse().unwrap();
    let lower: Fingerprint = "ab".repeat(32).parse().unwrap();
    assert_eq!(upper, lower);

    orch.fetch_cached(&upper).await.unwrap();
    orch.fetch_cached(&lower).await.unwrap();
    assert_eq!(transport.preview_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_batch_respects_shared_queue_bound() {
    let transport = Arc::new(MockTransport::with_latency(Duration::from_millis(10)));
    let orch = orchestrator(&test_config(2), transport.clone());
    let fps = fingerprints(10);

    let results = orch.fetch_batch(&fps).await;

    assert_eq!(results.len(), 10);
    for (fp, result) in fps.iter().zip(&results) {
        assert_eq!(result.as_ref().unwrap().fingerprint(), fp);
    }
    assert!(transport.peak() <= 2, "peak={}", transport.peak());
    assert_eq!(transport.preview_calls.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn test_dedicated_preview_queue() {
    let transport = Arc::new(MockTransport::with_latency(Duration::from_millis(5)));
    let mut config = test_config(1);
    config.queue.preview = Some(QueueLimits {
        max_concurrent: 4,
        inter_dispatch_ms: 0,
    });
    let orch = orchestrator(&config, transport.clone());

    assert_eq!(orch.queue().max_concurrent(), 1);
    assert_eq!(orch.preview_queue().max_concurrent(), 4);

    let results = orch.fetch_batch(&fingerprints(8)).await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert!(orch.preview_queue().peak_running() <= 4);
    assert_eq!(orch.queue().peak_running(), 0);
}

#[tokio::test]
async fn test_eviction_releases_oldest() {
    let transport = Arc::new(MockTransport::new());
    let mut config = test_config(2);
    config.cache.max_entries = 3;
    let orch = orchestrator(&config, transport.clone());
    let fps = fingerprints(5);

    let mut blobs = Vec::new();
    for fp in &fps {
        blobs.push(orch.fetch_cached(fp).await.unwrap());
    }

    assert_eq!(orch.cache().len(), 3);
    assert!(blobs[0].is_released());
    assert!(blobs[1].is_released());
    assert!(!blobs[4].is_released());

    // 被淘汰的条目再次获取会走网络
    orch.fetch_cached(&fps[0]).await.unwrap();
    assert_eq!(transport.preview_calls.load(Ordering::SeqCst), 6);

    assert_eq!(orch.clear_cache(), 3);
    assert!(orch.cache().is_empty());
    assert!(blobs[4].is_released());
}

#[tokio::test]
async fn test_terminal_preview_error_is_not_cached() {
    let transport = Arc::new(MockTransport::new());
    transport.fail_preview(TransportErrorKind::NotFound, 1);
    let orch = orchestrator(&test_config(2), transport.clone());
    let fp = Fingerprint::from_hex("ef".repeat(32)).unwrap();

    let err = orch.fetch_cached(&fp).await.unwrap_err();
    assert!(matches!(
        err,
        FetchError::Transport(ref e) if e.kind == TransportErrorKind::NotFound
    ));
    assert!(orch.cache().is_empty());

    assert!(orch.fetch_cached(&fp).await.is_ok());
    assert_eq!(transport.preview_calls.load(Ordering::SeqCst), 2);
}
