use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
};

use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{
    config::DownloadConfig,
    decrypt::CryptoEngine,
    error::{ErrorKind, KaoriError, KaoriResult},
    fetch::{FetchContext, SegmentFetcher},
    merge::MergeCoordinator,
    playlist::{M3u8PlaylistResolver, PlaylistResolver},
    progress::ProgressAggregator,
    segment::{FrameCheck, Segment, SegmentStatus},
    task::{FailurePhase, Task, TaskFailure, TaskRequest, TaskResult, TaskStatus},
    util::{http::HttpClient, validate_task_name},
};

/// Drives tasks from playlist to merged output.
///
/// Cloning is cheap and every clone shares the same key cache, progress and cancellation
/// token.
pub struct TaskOrchestrator<R = M3u8PlaylistResolver> {
    config: Arc<DownloadConfig>,
    resolver: Arc<R>,
    crypto: Arc<CryptoEngine>,
    fetcher: SegmentFetcher,
    merger: Arc<MergeCoordinator>,
    progress: Arc<ProgressAggregator>,
    cancel: CancellationToken,
}

impl<R> Clone for TaskOrchestrator<R> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            resolver: self.resolver.clone(),
            crypto: self.crypto.clone(),
            fetcher: self.fetcher.clone(),
            merger: self.merger.clone(),
            progress: self.progress.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl TaskOrchestrator<M3u8PlaylistResolver> {
    pub fn new(config: DownloadConfig) -> KaoriResult<Self> {
        let client = HttpClient::from_config(&config)?;
        let cancel = CancellationToken::new();
        let resolver = M3u8PlaylistResolver::new(client.clone())
            .with_retry(config.retry_policy()?)
            .with_cancellation(cancel.clone());
        Ok(Self::with_resolver(config, client, resolver)?.with_cancellation(cancel))
    }
}

impl<R> TaskOrchestrator<R>
where
    R: PlaylistResolver + 'static,
{
    pub fn with_resolver(config: DownloadConfig, client: HttpClient, resolver: R) -> KaoriResult<Self> {
        let cancel = CancellationToken::new();
        let crypto = Arc::new(
            CryptoEngine::new(client.clone(), &config.key_cache_dir, config.key_cache_ttl())
                .with_custom_key(config.custom_key()?),
        );
        let fetcher = SegmentFetcher::new(client, crypto.clone(), config.retry_policy()?)
            .with_cancellation(cancel.clone())
            .with_custom_iv(config.custom_iv()?);

        Ok(Self {
            merger: Arc::new(MergeCoordinator::from_config(&config)),
            progress: Arc::new(ProgressAggregator::new(config.display_slots())),
            config: Arc::new(config),
            resolver: Arc::new(resolver),
            crypto,
            fetcher,
            cancel,
        })
    }

    /// Replaces the cancellation token, e.g. with one the resolver already observes.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.fetcher = self.fetcher.with_cancellation(cancel.clone());
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    pub fn progress(&self) -> &Arc<ProgressAggregator> {
        &self.progress
    }

    pub fn crypto(&self) -> &Arc<CryptoEngine> {
        &self.crypto
    }

    /// Cancelling this token stops scheduling new work. Requests in flight finish.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Runs one task to completion. Errors are reported in the result, never raised.
    pub async fn run_task(&self, request: TaskRequest) -> TaskResult {
        let name = request.name.clone();
        self.progress.register_task(&name, 0);

        match self.process(&request).await {
            Ok(output) => {
                self.progress.finish(&name, true, None);
                tracing::info!(
                    "All finished. Please checkout your files at {}",
                    output.display()
                );
                TaskResult::success(name, output)
            }
            Err(failure) => {
                self.progress
                    .finish(&name, false, Some(failure.error.to_string()));
                tracing::error!("Task {name} failed in {failure}");
                TaskResult::failure(name, failure)
            }
        }
    }

    /// Runs `requests` with at most `max_concurrent` tasks at a time.
    ///
    /// A failing task never stops its siblings. Later tasks reusing the name of an earlier
    /// one are rejected, as they would share a temp directory.
    pub async fn run_batch(
        &self,
        requests: Vec<TaskRequest>,
        max_concurrent: usize,
    ) -> HashMap<String, TaskResult> {
        tracing::info!(
            "Start processing {} task(s), {} at a time.",
            requests.len(),
            max_concurrent.max(1)
        );

        let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let mut seen = HashSet::new();
        let mut results = HashMap::new();
        let mut handles = JoinSet::new();

        for request in requests {
            if !seen.insert(request.name.clone()) {
                let error = KaoriError::DuplicateTask(request.name.clone());
                tracing::error!("{error}, skipping {}.", request.url);
                continue;
            }

            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            if self.cancel.is_cancelled() {
                let failure = TaskFailure::new(FailurePhase::Resolve, KaoriError::Cancelled);
                results.insert(request.name.clone(), TaskResult::failure(request.name, failure));
                continue;
            }

            let this = self.clone();
            handles.spawn(async move {
                let result = this.run_task(request).await;
                drop(permit);
                result
            });
        }

        while let Some(joined) = handles.join_next().await {
            match joined {
                Ok(result) => {
                    results.insert(result.name.clone(), result);
                }
                Err(e) => tracing::error!("Task aborted unexpectedly: {e}"),
            }
        }

        if self.config.purge_key_cache {
            if let Err(e) = self.crypto.purge().await {
                tracing::warn!("Failed to purge key cache: {e}");
            }
        }
        results
    }

    async fn process(&self, request: &TaskRequest) -> Result<PathBuf, TaskFailure> {
        let fail = |phase: FailurePhase| move |error: KaoriError| TaskFailure::new(phase, error);

        validate_task_name(&request.name).map_err(fail(FailurePhase::Resolve))?;
        if self.cancel.is_cancelled() {
            return Err(fail(FailurePhase::Resolve)(KaoriError::Cancelled));
        }

        let mut task = Task::new(request, &self.config.temp_dir);
        let playlist = self
            .resolver
            .resolve(&request.url)
            .await
            .map_err(fail(FailurePhase::Resolve))?;
        if playlist.segments.is_empty() {
            return Err(fail(FailurePhase::Resolve)(KaoriError::EmptyPlaylist));
        }
        task.segments = Segment::from_urls(playlist.segments);
        task.encryption = playlist.encryption;
        self.progress.set_total(&task.name, task.segments.len());
        tracing::info!("{}: {} segments resolved.", task.name, task.segments.len());

        let (encryption, frame_check) = match &task.encryption {
            Some(encryption) if self.config.decrypt => {
                let key_uri = encryption.key_uri.as_deref().unwrap_or_default();
                self.crypto
                    .get_key(&task.name, key_uri)
                    .await
                    .map_err(fail(FailurePhase::Key))?;
                (Some(encryption.clone()), FrameCheck::MpegTs)
            }
            Some(_) => {
                tracing::warn!("{}: decryption disabled, keeping segments encrypted.", task.name);
                (None, FrameCheck::NonEmpty)
            }
            None => (None, FrameCheck::MpegTs),
        };

        tokio::fs::create_dir_all(&task.temp_dir)
            .await
            .map_err(|e| fail(FailurePhase::Download)(e.into()))?;
        let context = Arc::new(
            FetchContext::new(&task.name, &task.temp_dir)
                .with_encryption(encryption)
                .with_frame_check(frame_check),
        );

        task.status = TaskStatus::Downloading;
        self.progress.start_download(&task.name);
        let missing = self
            .download(&mut task, context)
            .await
            .map_err(|error| match error.kind() {
                ErrorKind::MissingKey => fail(FailurePhase::Key)(error),
                _ => fail(FailurePhase::Download)(error),
            })?;
        if missing > 0 {
            task.status = TaskStatus::Failed;
            return Err(fail(FailurePhase::Download)(KaoriError::MissingSegments {
                missing,
                total: task.segments.len(),
            }));
        }
        task.status = TaskStatus::DownloadComplete;

        task.status = TaskStatus::Merging;
        self.progress.on_merge_start(&task.name);
        let output = task.output_path(&self.config.container_ext);
        let report = self
            .merger
            .merge(&task.name, &task.segment_paths(), frame_check, &output)
            .await;
        match report {
            Ok(report) => {
                self.progress.on_merge_complete(&task.name, true, None);
                tracing::debug!("{}: merged {} bytes.", task.name, report.size);
            }
            Err(e) => {
                task.status = TaskStatus::Failed;
                self.progress
                    .on_merge_complete(&task.name, false, Some(e.to_string()));
                return Err(fail(FailurePhase::Merge)(e));
            }
        }

        if !self.config.keep_segments {
            if let Err(e) = tokio::fs::remove_dir_all(&task.temp_dir).await {
                tracing::warn!("Failed to remove {}: {e}", task.temp_dir.display());
            }
        }
        task.status = TaskStatus::Completed;
        Ok(output)
    }

    /// Fetches every segment not yet on disk. Returns how many are still missing.
    ///
    /// Successes are reported as they happen, failures only once the last retry pass is
    /// over, so every segment is reported exactly once. The first error that no retry can
    /// fix (disk, key) stops all scheduling and is returned as is.
    async fn download(&self, task: &mut Task, context: Arc<FetchContext>) -> KaoriResult<usize> {
        let name = task.name.clone();
        // cancelled with the orchestrator, or by this task alone on a fatal error
        let abort = self.cancel.child_token();
        let fetcher = self.fetcher.clone().with_cancellation(abort.clone());

        let mut remaining = Vec::new();
        for segment in task.segments.iter_mut() {
            if context.frame_check.check_file(segment.path(&task.temp_dir)).await {
                segment.status = SegmentStatus::Downloaded;
                self.progress.on_segment_complete(&name, true);
            } else {
                remaining.push(segment.clone());
            }
        }
        tracing::info!(
            "{name}: {} segments to download with {} thread(s), {} already on disk.",
            remaining.len(),
            self.config.threads,
            task.segments.len() - remaining.len()
        );

        let permits = Arc::new(Semaphore::new(self.config.threads.get()));
        let mut handles = JoinSet::new();
        for segment in remaining.iter() {
            if abort.is_cancelled() {
                break;
            }
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            // the wait for a permit may have outlived the task
            if abort.is_cancelled() {
                break;
            }

            let mut segment = segment.clone();
            segment.status = SegmentStatus::Downloading;
            let fetcher = fetcher.clone();
            let context = context.clone();
            let abort = abort.clone();
            handles.spawn(async move {
                let result = fetcher.fetch(&segment, &context).await;
                if result.as_ref().is_err_and(is_fatal) {
                    abort.cancel();
                }
                drop(permit);
                (segment.index, result)
            });
        }

        let mut downloaded = HashSet::new();
        let mut fatal = None;
        while let Some(joined) = handles.join_next().await {
            match joined {
                Ok((index, Ok(_))) => {
                    downloaded.insert(index);
                    self.progress.on_segment_complete(&name, true);
                }
                Ok((index, Err(e))) if is_fatal(&e) => {
                    tracing::error!("{name}: segment {index} failed, stopping the task. {e}");
                    fatal.get_or_insert(e);
                }
                Ok((index, Err(e))) => {
                    tracing::debug!("{name}: segment {index} left for retry passes. {e}");
                }
                Err(e) => tracing::error!("{name}: segment worker aborted: {e}"),
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }
        let mut missing: Vec<_> = remaining
            .into_iter()
            .filter(|s| !downloaded.contains(&s.index))
            .collect();

        for pass in 1..=self.config.retry_passes {
            if missing.is_empty() || self.cancel.is_cancelled() {
                break;
            }
            tracing::info!(
                "{name}: retry pass {pass}/{} for {} segments.",
                self.config.retry_passes,
                missing.len()
            );

            let mut still_missing = Vec::new();
            for segment in missing {
                if self.cancel.is_cancelled() {
                    still_missing.push(segment);
                    continue;
                }
                match fetcher.fetch(&segment, &context).await {
                    Ok(_) => {
                        downloaded.insert(segment.index);
                        self.progress.on_segment_complete(&name, true);
                    }
                    Err(e) if is_fatal(&e) => {
                        tracing::error!("{name}: segment {} failed, stopping the task. {e}", segment.index);
                        return Err(e);
                    }
                    Err(e) => {
                        tracing::warn!("{name}: segment {} still failing. {e}", segment.index);
                        still_missing.push(segment);
                    }
                }
            }
            missing = still_missing;
        }

        for segment in task.segments.iter_mut() {
            if downloaded.contains(&segment.index) {
                segment.status = SegmentStatus::Downloaded;
            }
        }
        if !missing.is_empty() {
            tracing::error!("{name}: failed to download {} segments:", missing.len());
        }
        for segment in &missing {
            tracing::error!("  - {}", segment.file_name);
            if let Some(s) = task.segments.iter_mut().find(|s| s.index == segment.index) {
                s.status = SegmentStatus::Failed;
            }
            self.progress.on_segment_complete(&name, false);
        }

        if !missing.is_empty() && self.cancel.is_cancelled() {
            return Err(KaoriError::Cancelled);
        }
        Ok(missing.len())
    }
}

/// Errors retrying can not fix and which are not a plain cancellation.
fn is_fatal(error: &KaoriError) -> bool {
    !error.is_retryable() && error.kind() != ErrorKind::Cancelled
}
