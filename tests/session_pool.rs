//! Session pool reuse, eviction and keying.

mod support;

use std::time::Duration;

use support::Fixture;
use vdepot::depot::config::DepotConfig;
use vdepot::settings::keys;

#[tokio::test]
async fn test_allocate_free_reuses_one_session() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(dir.path());
    let config = fixture.config();
    let pool = &fixture.context.pool;

    let session = pool.allocate(&config, "test").await.unwrap();
    pool.free(&config, session).await;
    let session = pool.allocate(&config, "test").await.unwrap();
    pool.free(&config, session).await;

    assert_eq!(pool.free_count().await, 1);
}

#[tokio::test]
async fn test_parallel_peaks_grow_the_pool() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(dir.path());
    let pool = &fixture.context.pool;

    // Three identities, peak of two concurrent sessions per identity.
    let configs = [
        DepotConfig::new("perforce:1666", "alice", "ws-one"),
        DepotConfig::new("perforce:1666", "alice", "ws-two"),
        DepotConfig::new("edge:1666", "bob", "ws-three"),
    ];
    for config in &configs {
        let first = pool.allocate(config, "a").await.unwrap();
        let second = pool.allocate(config, "b").await.unwrap();
        pool.free(config, first).await;
        pool.free(config, second).await;
    }
    assert_eq!(pool.free_count().await, 6);

    // Repeated single checkouts do not grow it further.
    for config in &configs {
        let session = pool.allocate(config, "c").await.unwrap();
        pool.free(config, session).await;
    }
    assert_eq!(pool.free_count().await, 6);
}

#[tokio::test]
async fn test_pool_key_is_case_insensitive() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(dir.path());
    let pool = &fixture.context.pool;

    let lower = DepotConfig::new("perforce:1666", "alice", "dev-ws");
    let upper = DepotConfig::new("PERFORCE:1666", "Alice", "DEV-WS");

    let session = pool.allocate(&lower, "test").await.unwrap();
    pool.free(&lower, session).await;
    let session = pool.allocate(&upper, "test").await.unwrap();
    pool.free(&upper, session).await;

    assert_eq!(pool.free_count().await, 1);
}

#[tokio::test]
async fn test_faulted_session_dropped_on_next_allocation() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(dir.path());
    let config = fixture.config();
    let pool = &fixture.context.pool;

    let mut session = pool.allocate(&config, "test").await.unwrap();

    // Fault the session mid-use, then return it anyway.
    fixture.depot.set_refuse_connect(true);
    let result = session.run_simple("info", &[]).await;
    assert!(result.has_error());
    assert!(session.is_faulted());
    pool.free(&config, session).await;
    assert_eq!(pool.free_count().await, 1);
    fixture.depot.set_refuse_connect(false);

    // The faulted entry is discarded and replaced with a fresh one.
    let session = pool.allocate(&config, "test").await.unwrap();
    assert!(!session.is_faulted());
    pool.free(&config, session).await;
    assert_eq!(pool.free_count().await, 1);
}

#[tokio::test]
async fn test_idle_timeout_eviction() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(dir.path());
    fixture.settings.set_from_text(keys::DEPOT_CLIENT_CACHE_IDLE_TIMEOUT_MS, "0");
    let config = fixture.config();
    let pool = &fixture.context.pool;

    let session = pool.allocate(&config, "test").await.unwrap();
    pool.free(&config, session).await;

    // Zero TTL: the pooled session is stale the moment it is considered.
    let session = pool.allocate(&config, "test").await.unwrap();
    pool.free(&config, session).await;
    assert_eq!(pool.free_count().await, 1);
}

#[tokio::test]
async fn test_clear_and_garbage_collect() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(dir.path());
    let config = fixture.config();
    let pool = &fixture.context.pool;

    let session = pool.allocate(&config, "test").await.unwrap();
    pool.free(&config, session).await;

    pool.garbage_collect(Duration::from_secs(3600)).await;
    assert_eq!(pool.free_count().await, 1);

    pool.garbage_collect(Duration::ZERO).await;
    assert_eq!(pool.free_count().await, 0);

    let session = pool.allocate(&config, "test").await.unwrap();
    pool.free(&config, session).await;
    pool.clear().await;
    assert_eq!(pool.free_count().await, 0);
}

#[tokio::test]
async fn test_rekey_on_free() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(dir.path());
    let pool = &fixture.context.pool;

    let original = DepotConfig::new("perforce:1666", "alice", "dev-ws");
    let rekeyed = DepotConfig::new("edge:1666", "alice", "dev-ws");

    let session = pool.allocate(&original, "test").await.unwrap();
    pool.free(&rekeyed, session).await;
    assert_eq!(pool.free_count().await, 1);

    // The session now answers for the key it was freed under.
    let session = pool.allocate(&rekeyed, "test").await.unwrap();
    pool.free(&rekeyed, session).await;
    assert_eq!(pool.free_count().await, 1);
}
