use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::{
    decrypt::{self, CryptoEngine, EncryptionContext},
    error::{KaoriError, KaoriResult},
    segment::{FrameCheck, Segment},
    util::http::HttpClient,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Backoff after the failed attempt `attempt` (0-indexed): `base_delay * 2^attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error or runs out of attempts.
    ///
    /// The token is checked before every attempt and interrupts backoff sleeps.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> KaoriResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = KaoriResult<T>>,
    {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(KaoriError::Cancelled);
            }

            let error = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if !error.is_retryable() || attempt + 1 >= self.max_attempts {
                return Err(error);
            }

            let delay = self.delay(attempt);
            tracing::debug!(
                "Attempt {}/{} failed, retry in {delay:?}. {error}",
                attempt + 1,
                self.max_attempts
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(KaoriError::Cancelled),
            }
            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// What a fetcher needs to know about the task a segment belongs to.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub task_name: String,
    pub temp_dir: PathBuf,
    /// Set when segments must be decrypted before they are stored.
    pub encryption: Option<EncryptionContext>,
    pub frame_check: FrameCheck,
}

impl FetchContext {
    pub fn new(task_name: impl Into<String>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            task_name: task_name.into(),
            temp_dir: temp_dir.into(),
            encryption: None,
            frame_check: FrameCheck::MpegTs,
        }
    }

    pub fn with_encryption(mut self, encryption: Option<EncryptionContext>) -> Self {
        self.encryption = encryption;
        self
    }

    pub fn with_frame_check(mut self, frame_check: FrameCheck) -> Self {
        self.frame_check = frame_check;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A valid file was already on disk.
    Skipped,
    /// The segment was downloaded and stored with this many bytes.
    Downloaded(usize),
}

#[derive(Clone)]
pub struct SegmentFetcher {
    client: HttpClient,
    crypto: Arc<CryptoEngine>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    /// Overrides the playlist IV and sequence derivation when set.
    custom_iv: Option<[u8; 16]>,
}

impl SegmentFetcher {
    pub fn new(client: HttpClient, crypto: Arc<CryptoEngine>, retry: RetryPolicy) -> Self {
        Self {
            client,
            crypto,
            retry,
            cancel: CancellationToken::new(),
            custom_iv: None,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_custom_iv(mut self, iv: Option<[u8; 16]>) -> Self {
        self.custom_iv = iv;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Makes sure a valid copy of `segment` exists under the task's temp directory.
    pub async fn fetch(&self, segment: &Segment, task: &FetchContext) -> KaoriResult<FetchOutcome> {
        let path = segment.path(&task.temp_dir);
        if task.frame_check.check_file(&path).await {
            tracing::debug!("{} of {} already exists, skipping.", segment.file_name, task.task_name);
            return Ok(FetchOutcome::Skipped);
        }
        remove_stale(&path).await?;

        self.retry
            .run(&self.cancel, |attempt| {
                self.fetch_once(segment, task, &path, attempt)
            })
            .await
            .map(FetchOutcome::Downloaded)
    }

    async fn fetch_once(
        &self,
        segment: &Segment,
        task: &FetchContext,
        path: &Path,
        attempt: u32,
    ) -> KaoriResult<usize> {
        let result = self.download(segment, task, path).await;
        if let Err(e) = &result {
            let attempt = attempt + 1;
            let max_attempts = self.retry.max_attempts;
            tracing::warn!(
                "Processing {} of {} failed ({attempt}/{max_attempts}). {e}",
                segment.file_name,
                task.task_name
            );
        }
        result
    }

    async fn download(&self, segment: &Segment, task: &FetchContext, path: &Path) -> KaoriResult<usize> {
        let response = self.client.get(&segment.url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            if let Ok(body) = response.text().await {
                tracing::debug!("Error body: {body}");
            }
            return Err(KaoriError::HttpError(status));
        }
        let bytes = response.bytes().await?;

        let data = match &task.encryption {
            Some(encryption) => {
                let key_uri = encryption.key_uri.as_deref().unwrap_or_default();
                let key = self.crypto.get_key(&task.task_name, key_uri).await?;
                let iv = self.custom_iv.or(encryption.iv);
                // always the playlist index, never a position in the list of remaining segments
                let sequence = encryption.sequence_number(segment.index);
                decrypt::decrypt(&bytes, &key, iv.as_ref(), sequence)?
            }
            None => bytes.to_vec(),
        };

        let invalid = || KaoriError::InvalidSegment {
            file_name: segment.file_name.clone(),
        };
        if !task.frame_check.check(&data) {
            return Err(invalid());
        }

        write_atomic(path, &data).await?;
        if !task.frame_check.check_file(path).await {
            remove_stale(path).await?;
            return Err(invalid());
        }

        tracing::debug!("Processing {} of {} finished.", segment.file_name, task.task_name);
        Ok(data.len())
    }
}

/// Writes through a `.part` file which is flushed, synced and renamed into place.
pub(crate) async fn write_atomic(path: &Path, data: &[u8]) -> KaoriResult<()> {
    let mut part = path.as_os_str().to_owned();
    part.push(".part");
    let part = PathBuf::from(part);

    let result = async {
        let mut file = tokio::fs::File::create(&part).await?;
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&part, path).await
    }
    .await;

    if result.is_err() {
        _ = tokio::fs::remove_file(&part).await;
    }
    Ok(result?)
}

async fn remove_stale(path: &Path) -> KaoriResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            tracing::debug!("Removed invalid file {}.", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
