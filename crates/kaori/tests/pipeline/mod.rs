use std::{num::NonZeroUsize, time::Duration};

use kaori::{
    decrypt::derive_iv, ErrorKind, FailurePhase, KaoriError, ProgressPhase, TaskOrchestrator,
    TaskRequest,
};
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use crate::{
    encrypt, init_test_tracing, media_playlist, test_config, ts_segment, AssertWrapper, HlsMock,
    KEY,
};

/// Serves `body` at `mock_path` after `delay`, expecting exactly `times` requests.
async fn mock_delayed(
    server: &MockServer,
    mock_path: &str,
    body: Vec<u8>,
    delay: Duration,
    times: u64,
) {
    Mock::given(method("GET"))
        .and(path(mock_path))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body).set_delay(delay))
        .expect(times)
        .mount(server)
        .await;
}

fn segment_names(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("seg{i}.ts")).collect()
}

/// Mounts `count` plain segments under `prefix`, each expected once, and their playlist.
async fn mock_plain_task(server: &MockServer, prefix: &str, count: usize) -> Vec<u8> {
    let mut expected = Vec::new();
    for i in 0..count {
        let data = ts_segment(i as u8, 3);
        server
            .mock_times(&format!("{prefix}/seg{i}.ts"), data.clone(), 1)
            .await;
        expected.extend(data);
    }
    server
        .mock(
            &format!("{prefix}/index.m3u8"),
            media_playlist(&segment_names(count), 0, None),
        )
        .await;
    expected
}

#[tokio::test]
async fn test_encrypted_task_end_to_end() -> anyhow::Result<()> {
    init_test_tracing();
    let root = tempfile::tempdir()?;
    let server = MockServer::start().await;

    let mut expected = Vec::new();
    for i in 0..10u8 {
        let plain = ts_segment(i, 3 + i as usize % 4);
        let iv = derive_iv(5 + i as u128);
        server
            .mock_times(&format!("/video/seg{i}.ts"), encrypt(&plain, &KEY, &iv), 1)
            .await;
        expected.extend(plain);
    }
    server.mock_times("/video/key.bin", KEY.to_vec(), 1).await;
    server
        .mock(
            "/video/index.m3u8",
            media_playlist(&segment_names(10), 5, Some("key.bin")),
        )
        .await;

    let config = test_config(root.path());
    let temp_root = config.temp_dir.clone();
    let output_dir = root.path().join("output");
    let orchestrator = TaskOrchestrator::new(config)?;

    let result = orchestrator
        .run_task(TaskRequest::new(
            "episode 01",
            format!("{}/video/index.m3u8", server.uri()),
            &output_dir,
        ))
        .await;

    assert!(result.success, "{:?}", result.error);
    let output = result.output_path.assert_success();
    assert_eq!(output, output_dir.join("episode 01.mp4"));
    assert_eq!(tokio::fs::read(&output).await?, expected);
    assert!(!temp_root.join("episode 01").exists());

    let snapshot = orchestrator.progress().task("episode 01").assert_success();
    assert_eq!(snapshot.phase, ProgressPhase::Done);
    assert_eq!((snapshot.completed, snapshot.failed, snapshot.total), (10, 0, 10));
    Ok(())
}

#[tokio::test]
async fn test_segment_recovers_after_two_failures() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let server = MockServer::start().await;

    // mounted first, so it answers the first two requests
    server.mock_status("/seg3.ts", 500, Some(2)).await;
    let expected = mock_plain_task(&server, "", 5).await;

    let config = kaori::DownloadConfig {
        max_attempts: 3,
        ..test_config(root.path())
    };
    let result = TaskOrchestrator::new(config)?
        .run_task(TaskRequest::new(
            "recover",
            format!("{}/index.m3u8", server.uri()),
            root.path(),
        ))
        .await;

    assert!(result.success, "{:?}", result.error);
    let output = result.output_path.assert_success();
    assert_eq!(tokio::fs::read(&output).await?, expected);
    Ok(())
}

#[tokio::test]
async fn test_permanent_failure_creates_no_output() -> anyhow::Result<()> {
    init_test_tracing();
    let root = tempfile::tempdir()?;
    let server = MockServer::start().await;

    for i in [0, 1, 3, 4] {
        server
            .mock_times(&format!("/seg{i}.ts"), ts_segment(i, 3), 1)
            .await;
    }
    // two attempts in the parallel pass, two more in the single retry pass
    server.mock_status("/seg2.ts", 404, Some(4)).await;
    server
        .mock("/index.m3u8", media_playlist(&segment_names(5), 0, None))
        .await;

    let config = kaori::DownloadConfig {
        max_attempts: 2,
        retry_passes: 1,
        ..test_config(root.path())
    };
    let temp_dir = config.temp_dir.join("broken");
    let orchestrator = TaskOrchestrator::new(config)?;
    let result = orchestrator
        .run_task(TaskRequest::new(
            "broken",
            format!("{}/index.m3u8", server.uri()),
            root.path(),
        ))
        .await;

    assert!(!result.success);
    assert!(result.output_path.is_none());
    let failure = result.error.assert_success();
    assert_eq!(failure.phase, FailurePhase::Download);
    assert_eq!(failure.missing_segments(), Some(1));
    assert!(!root.path().join("broken.mp4").exists());

    // valid segments stay for the next run
    assert!(temp_dir.join("000000_seg0.ts").exists());
    assert!(temp_dir.join("000004_seg4.ts").exists());
    assert!(!temp_dir.join("000002_seg2.ts").exists());

    let snapshot = orchestrator.progress().task("broken").assert_success();
    assert_eq!(snapshot.phase, ProgressPhase::Failed);
    assert_eq!((snapshot.completed, snapshot.failed), (4, 1));
    Ok(())
}

#[tokio::test]
async fn test_retry_bound() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let server = MockServer::start().await;

    server.mock_status("/seg0.ts", 503, Some(3)).await;
    server
        .mock("/index.m3u8", media_playlist(&segment_names(1), 0, None))
        .await;

    let config = kaori::DownloadConfig {
        max_attempts: 3,
        retry_passes: 0,
        ..test_config(root.path())
    };
    let result = TaskOrchestrator::new(config)?
        .run_task(TaskRequest::new(
            "unavailable",
            format!("{}/index.m3u8", server.uri()),
            root.path(),
        ))
        .await;

    assert!(matches!(
        result.error.assert_success().error,
        KaoriError::MissingSegments {
            missing: 1,
            total: 1
        }
    ));
    Ok(())
}

#[tokio::test]
async fn test_resume_skips_downloaded_segments() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let server = MockServer::start().await;
    // every segment may only be requested once over both runs
    let expected = mock_plain_task(&server, "", 6).await;

    let config = kaori::DownloadConfig {
        keep_segments: true,
        ..test_config(root.path())
    };
    let request = TaskRequest::new(
        "resume",
        format!("{}/index.m3u8", server.uri()),
        root.path(),
    );

    let first = TaskOrchestrator::new(config.clone())?
        .run_task(request.clone())
        .await;
    let output = first.output_path.assert_success();
    tokio::fs::remove_file(&output).await?;

    let orchestrator = TaskOrchestrator::new(config)?;
    let second = orchestrator.run_task(request).await;
    assert!(second.success, "{:?}", second.error);
    assert_eq!(tokio::fs::read(&output).await?, expected);

    let snapshot = orchestrator.progress().task("resume").assert_success();
    assert_eq!(snapshot.completed, 6);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_tasks_are_isolated() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let server = MockServer::start().await;

    // identical basenames inside and across tasks
    let mut expected = Vec::new();
    for (task, seed) in [("a", 0xa0u8), ("b", 0xb0)] {
        let first = ts_segment(seed, 4);
        let second = ts_segment(seed + 1, 5);
        server
            .mock_times(&format!("/{task}/seg.ts"), first.clone(), 1)
            .await;
        server
            .mock_times(&format!("/{task}/alt/seg.ts"), second.clone(), 1)
            .await;
        server
            .mock(
                &format!("/{task}/index.m3u8"),
                media_playlist(&["seg.ts".to_string(), "alt/seg.ts".to_string()], 0, None),
            )
            .await;
        expected.push([first, second].concat());
    }

    let orchestrator = TaskOrchestrator::new(test_config(root.path()))?;
    let output_dir = root.path().join("output");
    let requests = ["a", "b", "missing"]
        .into_iter()
        .map(|task| {
            TaskRequest::new(
                task,
                format!("{}/{task}/index.m3u8", server.uri()),
                &output_dir,
            )
        })
        .collect();
    let results = orchestrator.run_batch(requests, 3).await;

    assert_eq!(results.len(), 3);
    assert_eq!(
        tokio::fs::read(output_dir.join("a.mp4")).await?,
        expected[0]
    );
    assert_eq!(
        tokio::fs::read(output_dir.join("b.mp4")).await?,
        expected[1]
    );
    assert_eq!(
        results["missing"].error.as_ref().map(|e| e.phase),
        Some(FailurePhase::Resolve)
    );

    let summary = orchestrator.progress().summary();
    assert_eq!((summary.total, summary.completed, summary.failed), (3, 2, 1));
    Ok(())
}

#[tokio::test]
async fn test_no_decrypt_keeps_ciphertext() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let server = MockServer::start().await;

    let mut expected = Vec::new();
    for i in 0..3u8 {
        let encrypted = encrypt(&ts_segment(i, 3), &KEY, &derive_iv(i as u128));
        server
            .mock_times(&format!("/seg{i}.ts"), encrypted.clone(), 1)
            .await;
        expected.extend(encrypted);
    }
    server.mock_times("/key.bin", KEY.to_vec(), 0).await;
    server
        .mock(
            "/index.m3u8",
            media_playlist(&segment_names(3), 0, Some("key.bin")),
        )
        .await;

    let config = kaori::DownloadConfig {
        decrypt: false,
        ..test_config(root.path())
    };
    let result = TaskOrchestrator::new(config)?
        .run_task(TaskRequest::new(
            "raw",
            format!("{}/index.m3u8", server.uri()),
            root.path(),
        ))
        .await;

    let output = result.output_path.assert_success();
    assert_eq!(tokio::fs::read(&output).await?, expected);
    Ok(())
}

#[tokio::test]
async fn test_custom_key_and_iv() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let server = MockServer::start().await;

    let iv = [7u8; 16];
    let plain = ts_segment(1, 5);
    server
        .mock_times("/seg0.ts", encrypt(&plain, &KEY, &iv), 1)
        .await;
    server.mock_times("/key.bin", b"wrong key bytes!".to_vec(), 0).await;
    server
        .mock(
            "/index.m3u8",
            media_playlist(&segment_names(1), 40, Some("key.bin")),
        )
        .await;

    let key_path = root.path().join("local.key");
    tokio::fs::write(&key_path, KEY).await?;
    let config = kaori::DownloadConfig {
        custom_key_path: Some(key_path),
        custom_iv: Some(format!("0x{}", hex::encode(iv))),
        ..test_config(root.path())
    };
    let result = TaskOrchestrator::new(config)?
        .run_task(TaskRequest::new(
            "custom",
            format!("{}/index.m3u8", server.uri()),
            root.path(),
        ))
        .await;

    let output = result.output_path.assert_success();
    assert_eq!(tokio::fs::read(&output).await?, plain);
    Ok(())
}

#[tokio::test]
async fn test_disk_error_stops_the_task() -> anyhow::Result<()> {
    init_test_tracing();
    let root = tempfile::tempdir()?;
    let server = MockServer::start().await;

    // one request only, neither attempts nor passes may repeat it
    server.mock_times("/seg0.ts", ts_segment(0, 3), 1).await;
    server
        .mock("/index.m3u8", media_playlist(&segment_names(1), 0, None))
        .await;

    let config = kaori::DownloadConfig {
        max_attempts: 3,
        retry_passes: 3,
        ..test_config(root.path())
    };
    // a directory where the segment is written first
    let blocked = config.temp_dir.join("blocked").join("000000_seg0.ts.part");
    tokio::fs::create_dir_all(&blocked).await?;

    let result = TaskOrchestrator::new(config)?
        .run_task(TaskRequest::new(
            "blocked",
            format!("{}/index.m3u8", server.uri()),
            root.path(),
        ))
        .await;

    assert!(result.output_path.is_none());
    let failure = result.error.assert_success();
    assert_eq!(failure.phase, FailurePhase::Download);
    assert_eq!(failure.error.kind(), ErrorKind::Resource);
    assert!(!root.path().join("blocked.mp4").exists());
    Ok(())
}

#[tokio::test]
async fn test_key_failure_fetches_no_segment() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let server = MockServer::start().await;

    for i in 0..3u8 {
        server
            .mock_times(&format!("/seg{i}.ts"), ts_segment(i, 3), 0)
            .await;
    }
    server.mock_status("/key.bin", 403, None).await;
    server
        .mock(
            "/index.m3u8",
            media_playlist(&segment_names(3), 0, Some("key.bin")),
        )
        .await;

    let orchestrator = TaskOrchestrator::new(test_config(root.path()))?;
    let result = orchestrator
        .run_task(TaskRequest::new(
            "locked",
            format!("{}/index.m3u8", server.uri()),
            root.path(),
        ))
        .await;

    let failure = result.error.assert_success();
    assert_eq!(failure.phase, FailurePhase::Key);
    assert!(matches!(failure.error, KaoriError::MissingKey { .. }));
    assert!(!root.path().join("keys").join("locked.key").exists());

    let snapshot = orchestrator.progress().task("locked").assert_success();
    assert_eq!(snapshot.phase, ProgressPhase::Failed);
    assert_eq!(snapshot.completed, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_stops_new_fetches_and_tasks() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let server = MockServer::start().await;

    // the first segment is in flight when the cancel arrives, the rest never start
    for i in 0..5u8 {
        let times = if i == 0 { 1 } else { 0 };
        mock_delayed(
            &server,
            &format!("/slow/seg{i}.ts"),
            ts_segment(i, 3),
            Duration::from_millis(800),
            times,
        )
        .await;
    }
    server
        .mock("/slow/index.m3u8", media_playlist(&segment_names(5), 0, None))
        .await;
    server
        .mock_times("/later/index.m3u8", media_playlist(&segment_names(1), 0, None), 0)
        .await;

    let config = kaori::DownloadConfig {
        threads: NonZeroUsize::MIN,
        retry_passes: 2,
        ..test_config(root.path())
    };
    let orchestrator = TaskOrchestrator::new(config)?;
    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
    });

    let requests = ["slow", "later"]
        .into_iter()
        .map(|task| {
            TaskRequest::new(
                task,
                format!("{}/{task}/index.m3u8", server.uri()),
                root.path(),
            )
        })
        .collect();
    let results = orchestrator.run_batch(requests, 1).await;

    let slow = results["slow"].error.as_ref().assert_success();
    assert_eq!(slow.phase, FailurePhase::Download);
    assert!(matches!(slow.error, KaoriError::Cancelled));
    let later = results["later"].error.as_ref().assert_success();
    assert!(matches!(later.error, KaoriError::Cancelled));
    assert!(!root.path().join("slow.mp4").exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_output_follows_playlist_order() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let server = MockServer::start().await;

    // later segments answer first
    let mut expected = Vec::new();
    for (i, delay) in [300u64, 200, 100, 0].into_iter().enumerate() {
        let data = ts_segment(i as u8, 2 + i);
        mock_delayed(
            &server,
            &format!("/seg{i}.ts"),
            data.clone(),
            Duration::from_millis(delay),
            1,
        )
        .await;
        expected.extend(data);
    }
    server
        .mock("/index.m3u8", media_playlist(&segment_names(4), 0, None))
        .await;

    let result = TaskOrchestrator::new(test_config(root.path()))?
        .run_task(TaskRequest::new(
            "ordered",
            format!("{}/index.m3u8", server.uri()),
            root.path(),
        ))
        .await;

    let output = result.output_path.assert_success();
    assert_eq!(tokio::fs::read(&output).await?, expected);
    Ok(())
}
