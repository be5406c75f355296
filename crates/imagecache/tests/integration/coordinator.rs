use std::sync::Arc;

use futures::future::join_all;
use imagecache::caching::CacheError;
use imagecache::types::{Image, ResourceKey};
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

use crate::{MockFetcher, MockResponse, key, png_bytes, setup_cache, wait_for_file, wait_until};

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_requests_are_coalesced() {
    let fetcher = MockFetcher::gated(MockResponse::Ok(png_bytes(4, 4).into()));
    let (cache, _cache_dir) = setup_cache(&fetcher, |_| {});
    let key = key("coalesced.png");

    let requests = join_all((0..10).map(|_| cache.resolve(&key)));
    let release = async {
        fetcher.wait_for_calls(1).await;
        fetcher.release();
    };
    let (results, ()) = tokio::join!(requests, release);

    assert_eq!(fetcher.calls(), 1);
    for result in results {
        let image = result.unwrap();
        assert_eq!(image.data().as_ref(), &png_bytes(4, 4)[..]);
    }
    assert_eq!(cache.in_flight_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_coalesced_waiters_share_the_image() {
    let fetcher = MockFetcher::gated(MockResponse::Ok(png_bytes(4, 4).into()));
    let (cache, _cache_dir) = setup_cache(&fetcher, |_| {});
    let key = key("shared.png");

    let first = tokio::spawn({
        let cache = cache.clone();
        let key = key.clone();
        async move { cache.resolve(&key).await }
    });
    fetcher.wait_for_calls(1).await;
    assert!(cache.in_flight(&key));

    // the download is registered, so this joins it instead of starting another one
    let second = tokio::spawn({
        let cache = cache.clone();
        let key = key.clone();
        async move { cache.resolve(&key).await }
    });
    // give the second request time to get past the disk lookup
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    fetcher.release();

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_memory_hit_skips_network() {
    let fetcher = MockFetcher::unreachable();
    let (cache, _cache_dir) = setup_cache(&fetcher, |_| {});
    let key = key("memory.png");

    let image = Arc::new(Image::decode(png_bytes(2, 2).into()).unwrap());
    cache.memory().put(key.clone(), Arc::clone(&image));

    let resolved = cache.resolve(&key).await.unwrap();
    assert!(Arc::ptr_eq(&resolved, &image));
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn test_disk_hit_skips_network() {
    let fetcher = MockFetcher::unreachable();
    let (cache, _cache_dir) = setup_cache(&fetcher, |_| {});
    let key = key("disk.png");
    std::fs::write(cache.disk().path_for(&key), png_bytes(3, 5)).unwrap();

    let image = cache.resolve(&key).await.unwrap();
    assert_eq!((image.width(), image.height()), (3, 5));
    assert_eq!(fetcher.calls(), 0);

    // disk hits are not promoted by default
    assert!(!cache.memory().contains(&key));
}

#[tokio::test]
async fn test_disk_hit_promotion() {
    let fetcher = MockFetcher::unreachable();
    let (cache, _cache_dir) = setup_cache(&fetcher, |config| config.promote_disk_hits = true);
    let key = key("promoted.png");
    std::fs::write(cache.disk().path_for(&key), png_bytes(3, 5)).unwrap();

    let first = cache.resolve(&key).await.unwrap();
    assert!(cache.memory().contains(&key));

    std::fs::remove_file(cache.disk().path_for(&key)).unwrap();
    let second = cache.resolve(&key).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn test_corrupt_file_is_an_error() {
    let fetcher = MockFetcher::image();
    let (cache, _cache_dir) = setup_cache(&fetcher, |_| {});
    let key = key("corrupt.png");
    std::fs::write(cache.disk().path_for(&key), b"definitely not a png").unwrap();

    let result = cache.resolve(&key).await;

    assert!(matches!(result, Err(CacheError::Corrupt(_))));
    assert!(result.unwrap_err().is_decode_error());
    // no fallback to the network
    assert_eq!(fetcher.calls(), 0);
    assert_eq!(cache.in_flight_count(), 0);
}

#[tokio::test]
async fn test_download_populates_caches() {
    let fetcher = MockFetcher::image();
    let (cache, _cache_dir) = setup_cache(&fetcher, |_| {});
    let key = key("fresh.png");

    let first = cache.resolve(&key).await.unwrap();
    assert_eq!(fetcher.calls(), 1);
    assert!(cache.memory().contains(&key));
    assert_eq!(cache.in_flight_count(), 0);

    let second = cache.resolve(&key).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(fetcher.calls(), 1);

    let persisted = wait_for_file(&cache.disk().path_for(&key)).await;
    assert_eq!(persisted, png_bytes(4, 4));
}

#[tokio::test]
async fn test_persisted_image_survives_clear_memory() {
    let fetcher = MockFetcher::image();
    let (cache, _cache_dir) = setup_cache(&fetcher, |_| {});
    let key = key("persisted.png");

    cache.resolve(&key).await.unwrap();
    wait_for_file(&cache.disk().path_for(&key)).await;

    cache.clear_memory();
    assert!(!cache.memory().contains(&key));

    let image = cache.resolve(&key).await.unwrap();
    assert_eq!(image.data().as_ref(), &png_bytes(4, 4)[..]);
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_bad_response() {
    let fetcher = MockFetcher::new(MockResponse::Status(StatusCode::NOT_FOUND));
    let (cache, _cache_dir) = setup_cache(&fetcher, |_| {});
    let key = key("missing.png");

    let result = cache.resolve(&key).await;

    assert_eq!(
        result.unwrap_err(),
        CacheError::BadResponse(StatusCode::NOT_FOUND)
    );
    assert_eq!(cache.in_flight_count(), 0);
    assert!(!cache.memory().contains(&key));
    assert!(!cache.disk().path_for(&key).exists());

    // errors are not cached
    let result = cache.resolve(&key).await;
    assert!(matches!(result, Err(CacheError::BadResponse(_))));
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn test_malformed_download() {
    let fetcher = MockFetcher::new(MockResponse::Ok("<html>login</html>".into()));
    let (cache, _cache_dir) = setup_cache(&fetcher, |_| {});
    let key = key("malformed.png");

    let result = cache.resolve(&key).await;

    assert!(matches!(result, Err(CacheError::Malformed(_))));
    assert_eq!(cache.in_flight_count(), 0);
    assert!(!cache.memory().contains(&key));
    assert!(!cache.disk().path_for(&key).exists());
}

#[tokio::test]
async fn test_transport_error() {
    let fetcher = MockFetcher::unreachable();
    let (cache, _cache_dir) = setup_cache(&fetcher, |_| {});

    let result = cache.resolve(&key("unreachable.png")).await;

    let error = result.unwrap_err();
    assert!(error.is_transport_error());
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(cache.in_flight_count(), 0);
}

#[tokio::test]
async fn test_invalid_key() {
    let fetcher = MockFetcher::image();
    let (cache, _cache_dir) = setup_cache(&fetcher, |_| {});

    for key in ["not a url", "file:///etc/passwd", ""] {
        let result = cache.resolve(&ResourceKey::from(key)).await;
        assert!(
            matches!(result, Err(CacheError::InvalidKey(_))),
            "{key:?} resolved to {result:?}"
        );
    }
    assert_eq!(fetcher.calls(), 0);
    assert_eq!(cache.in_flight_count(), 0);
}

#[tokio::test]
async fn test_panicking_fetch() {
    let fetcher = MockFetcher::new(MockResponse::Panic);
    let (cache, _cache_dir) = setup_cache(&fetcher, |_| {});
    let key = key("panic.png");

    let result = cache.resolve(&key).await;

    assert_eq!(result.unwrap_err(), CacheError::InternalError);
    assert!(!cache.in_flight(&key));
}

#[tokio::test]
async fn test_already_cancelled() {
    let fetcher = MockFetcher::image();
    let (cache, _cache_dir) = setup_cache(&fetcher, |_| {});
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = cache.resolve_with(&key("cancelled.png"), &cancel).await;

    assert_eq!(result.unwrap_err(), CacheError::Cancelled);
    assert_eq!(fetcher.calls(), 0);
    assert_eq!(cache.in_flight_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancellation_is_isolated() {
    let fetcher = MockFetcher::gated(MockResponse::Ok(png_bytes(4, 4).into()));
    let (cache, _cache_dir) = setup_cache(&fetcher, |_| {});
    let key = key("isolated.png");

    let cancel_a = CancellationToken::new();
    let a = tokio::spawn({
        let cache = cache.clone();
        let key = key.clone();
        let cancel = cancel_a.clone();
        async move { cache.resolve_with(&key, &cancel).await }
    });
    let b = tokio::spawn({
        let cache = cache.clone();
        let key = key.clone();
        async move { cache.resolve(&key).await }
    });
    fetcher.wait_for_calls(1).await;
    // both callers are waiting on the same download
    wait_until(|| cache.waiters(&key) == 2).await;

    cancel_a.cancel();
    wait_until(|| cache.waiters(&key) == 1).await;
    assert_eq!(a.await.unwrap().unwrap_err(), CacheError::Cancelled);
    assert!(cache.in_flight(&key));

    fetcher.release();
    let image = b.await.unwrap().unwrap();
    assert_eq!(image.data().as_ref(), &png_bytes(4, 4)[..]);
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancelling_last_waiter_completes_download() {
    let fetcher = MockFetcher::gated(MockResponse::Ok(png_bytes(4, 4).into()));
    let (cache, _cache_dir) = setup_cache(&fetcher, |_| {});
    let key = key("abandoned.png");

    let cancel = CancellationToken::new();
    let request = tokio::spawn({
        let cache = cache.clone();
        let key = key.clone();
        let cancel = cancel.clone();
        async move { cache.resolve_with(&key, &cancel).await }
    });
    fetcher.wait_for_calls(1).await;

    cancel.cancel();
    assert_eq!(request.await.unwrap().unwrap_err(), CacheError::Cancelled);
    assert!(cache.in_flight(&key));

    fetcher.release();
    wait_until(|| !cache.in_flight(&key)).await;

    assert!(cache.memory().contains(&key));
    let persisted = wait_for_file(&cache.disk().path_for(&key)).await;
    assert_eq!(persisted, png_bytes(4, 4));

    // served from memory, without another download
    cache.resolve(&key).await.unwrap();
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dropped_waiter_completes_download() {
    let fetcher = MockFetcher::gated(MockResponse::Ok(png_bytes(4, 4).into()));
    let (cache, _cache_dir) = setup_cache(&fetcher, |_| {});
    let key = key("dropped.png");

    let request = tokio::spawn({
        let cache = cache.clone();
        let key = key.clone();
        async move { cache.resolve(&key).await }
    });
    fetcher.wait_for_calls(1).await;

    request.abort();
    assert!(request.await.unwrap_err().is_cancelled());

    fetcher.release();
    wait_until(|| !cache.in_flight(&key)).await;
    assert!(cache.memory().contains(&key));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_distinct_keys_are_not_coalesced() {
    let fetcher = MockFetcher::image();
    let (cache, _cache_dir) = setup_cache(&fetcher, |_| {});

    let keys: Vec<_> = (0..5).map(|i| key(&format!("{i}.png"))).collect();
    let results = join_all(keys.iter().map(|key| cache.resolve(key))).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(fetcher.calls(), 5);
}
