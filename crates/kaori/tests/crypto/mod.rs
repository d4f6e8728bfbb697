use std::{sync::Arc, time::Duration};

use kaori::{decrypt::CryptoEngine, HttpClient, KaoriError};
use wiremock::MockServer;

use crate::{AssertWrapper, HlsMock, KEY};

const TTL: Duration = Duration::from_secs(3600);

#[tokio::test]
async fn test_concurrent_lookups_fetch_once() -> anyhow::Result<()> {
    let cache = tempfile::tempdir()?;
    let server = MockServer::start().await;
    server.mock_times("/key.bin", KEY.to_vec(), 1).await;

    let engine = Arc::new(CryptoEngine::new(HttpClient::default(), cache.path(), TTL));
    let key_uri = format!("{}/key.bin", server.uri());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        let key_uri = key_uri.clone();
        handles.push(tokio::spawn(async move {
            engine.get_key("ep01", &key_uri).await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await?.assert_success(), KEY);
    }

    assert_eq!(tokio::fs::read(engine.cache_path("ep01")).await?, KEY);
    Ok(())
}

#[tokio::test]
async fn test_keys_are_cached_per_task() -> anyhow::Result<()> {
    let cache = tempfile::tempdir()?;
    let server = MockServer::start().await;
    // same URI, two tasks: fetched once for each of them
    server.mock_times("/key.bin", KEY.to_vec(), 2).await;

    let engine = CryptoEngine::new(HttpClient::default(), cache.path(), TTL);
    let key_uri = format!("{}/key.bin", server.uri());

    engine.get_key("ep01", &key_uri).await?;
    engine.get_key("ep02", &key_uri).await?;
    engine.get_key("ep01", &key_uri).await?;

    assert!(engine.cache_path("ep01").exists());
    assert!(engine.cache_path("ep02").exists());
    Ok(())
}

#[tokio::test]
async fn test_disk_cache_survives_restart() -> anyhow::Result<()> {
    let cache = tempfile::tempdir()?;
    let server = MockServer::start().await;
    server.mock_times("/key.bin", KEY.to_vec(), 1).await;
    let key_uri = format!("{}/key.bin", server.uri());

    CryptoEngine::new(HttpClient::default(), cache.path(), TTL)
        .get_key("ep01", &key_uri)
        .await?;
    let key = CryptoEngine::new(HttpClient::default(), cache.path(), TTL)
        .get_key("ep01", &key_uri)
        .await?;

    assert_eq!(key, KEY);
    Ok(())
}

#[tokio::test]
async fn test_expired_keys_are_fetched_again() -> anyhow::Result<()> {
    let cache = tempfile::tempdir()?;
    let server = MockServer::start().await;
    server.mock_times("/key.bin", KEY.to_vec(), 2).await;

    let engine = CryptoEngine::new(HttpClient::default(), cache.path(), Duration::ZERO);
    let key_uri = format!("{}/key.bin", server.uri());
    engine.get_key("ep01", &key_uri).await?;
    engine.get_key("ep01", &key_uri).await?;
    Ok(())
}

#[tokio::test]
async fn test_short_keys_are_padded() -> anyhow::Result<()> {
    let cache = tempfile::tempdir()?;
    let server = MockServer::start().await;
    server.mock("/short.bin", b"0123456789".to_vec()).await;

    let engine = CryptoEngine::new(HttpClient::default(), cache.path(), TTL);
    let key = engine
        .get_key("ep01", &format!("{}/short.bin", server.uri()))
        .await?;

    assert_eq!(&key[..10], b"0123456789");
    assert_eq!(&key[10..], &[0; 6]);
    Ok(())
}

#[tokio::test]
async fn test_missing_key() -> anyhow::Result<()> {
    let cache = tempfile::tempdir()?;
    let server = MockServer::start().await;
    server.mock_status("/key.bin", 403, None).await;

    let engine = CryptoEngine::new(HttpClient::default(), cache.path(), TTL);
    let result = engine
        .get_key("ep01", &format!("{}/key.bin", server.uri()))
        .await;

    assert!(matches!(result, Err(KaoriError::MissingKey { .. })));
    assert!(!engine.cache_path("ep01").exists());
    Ok(())
}

#[tokio::test]
async fn test_forget_and_purge() -> anyhow::Result<()> {
    let cache = tempfile::tempdir()?;
    let server = MockServer::start().await;
    // ep01 is fetched again after being forgotten
    server.mock_times("/key.bin", KEY.to_vec(), 3).await;

    let engine = CryptoEngine::new(HttpClient::default(), cache.path(), TTL);
    let key_uri = format!("{}/key.bin", server.uri());
    engine.get_key("ep01", &key_uri).await?;
    engine.get_key("ep02", &key_uri).await?;

    engine.forget("ep01").await?;
    assert!(!engine.cache_path("ep01").exists());
    assert!(engine.cache_path("ep02").exists());
    engine.get_key("ep01", &key_uri).await?;

    engine.purge().await?;
    assert!(!engine.cache_path("ep01").exists());

    engine
        .get_key("ep02", &format!("{}/key.bin", server.uri()))
        .await?;
    assert!(!engine.cache_path("ep02").exists());
    Ok(())
}

#[tokio::test]
async fn test_custom_key_skips_network() -> anyhow::Result<()> {
    let cache = tempfile::tempdir()?;
    let server = MockServer::start().await;
    server.mock_times("/key.bin", KEY.to_vec(), 0).await;

    let engine = CryptoEngine::new(HttpClient::default(), cache.path(), TTL)
        .with_custom_key(Some(b"local key bytes!".to_vec()));
    let key = engine
        .get_key("ep01", &format!("{}/key.bin", server.uri()))
        .await?;

    assert_eq!(&key, b"local key bytes!");
    Ok(())
}

#[tokio::test]
async fn test_custom_key_wins_over_disk_cache() -> anyhow::Result<()> {
    let cache = tempfile::tempdir()?;
    let server = MockServer::start().await;
    server.mock_times("/key.bin", KEY.to_vec(), 0).await;

    // left behind by an earlier run with a network key
    let stale_path = cache.path().join("ep01.key");
    tokio::fs::write(&stale_path, b"stale disk key!!").await?;

    let engine = CryptoEngine::new(HttpClient::default(), cache.path(), TTL)
        .with_custom_key(Some(b"local key bytes!".to_vec()));
    let key = engine
        .get_key("ep01", &format!("{}/key.bin", server.uri()))
        .await?;

    assert_eq!(&key, b"local key bytes!");
    assert_eq!(tokio::fs::read(&stale_path).await?, b"stale disk key!!");

    engine
        .get_key("ep02", &format!("{}/key.bin", server.uri()))
        .await?;
    assert!(!engine.cache_path("ep02").exists());
    Ok(())
}
