//! Reassembling downloaded segments into the final output file.
//!
//! Every merge runs inside its own [`MergeWorkspace`]. The external muxer is preferred;
//! when it is missing or fails, segments are concatenated byte by byte instead.

mod concat;
mod ffmpeg;
mod workspace;

pub use concat::{binary_concat, move_file};
pub use ffmpeg::{concat_list_entry, ffmpeg_concat, write_concat_list};
pub use workspace::{MergeWorkspace, WORKSPACES_DIR};

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    config::DownloadConfig,
    error::{KaoriError, KaoriResult},
    segment::FrameCheck,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Concat demuxer of the external muxer with stream copy.
    Muxer,
    /// Plain byte concatenation.
    BinaryConcat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub strategy: MergeStrategy,
    pub output_path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct MergeCoordinator {
    temp_root: PathBuf,
    muxer: String,
    timeout: Duration,
    buffer_size: usize,
    keep_segments: bool,
}

impl MergeCoordinator {
    pub fn new(temp_root: impl Into<PathBuf>) -> Self {
        Self {
            temp_root: temp_root.into(),
            muxer: "ffmpeg".to_string(),
            timeout: Duration::from_secs(600),
            buffer_size: 1024 * 1024,
            keep_segments: false,
        }
    }

    pub fn from_config(config: &DownloadConfig) -> Self {
        Self::new(&config.temp_dir)
            .with_muxer(&config.muxer)
            .with_timeout(config.merge_timeout())
            .with_buffer_size(config.buffer_size)
            .with_keep_segments(config.keep_segments)
    }

    pub fn with_muxer(mut self, muxer: impl Into<String>) -> Self {
        self.muxer = muxer.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_keep_segments(mut self, keep_segments: bool) -> Self {
        self.keep_segments = keep_segments;
        self
    }

    /// Merges `segments`, already in playback order, into `output`.
    ///
    /// Nothing is written unless every segment exists and passes `frame_check`. Source
    /// segments are removed after a successful merge unless configured otherwise.
    pub async fn merge(
        &self,
        task_name: &str,
        segments: &[PathBuf],
        frame_check: FrameCheck,
        output: &Path,
    ) -> KaoriResult<MergeReport> {
        if segments.is_empty() {
            return Err(KaoriError::MergeFailed("no segments to merge".to_string()));
        }

        let mut missing = 0;
        for segment in segments {
            if !frame_check.check_file(segment).await {
                tracing::warn!("Segment {} of {task_name} is missing or invalid.", segment.display());
                missing += 1;
            }
        }
        if missing > 0 {
            return Err(KaoriError::MissingSegments {
                missing,
                total: segments.len(),
            });
        }

        let mut absolute = Vec::with_capacity(segments.len());
        for segment in segments {
            absolute.push(tokio::fs::canonicalize(segment).await?);
        }

        let extension = output
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mp4");
        let workspace = MergeWorkspace::create(&self.temp_root, task_name, extension).await?;
        tracing::info!(
            "Merging {} segments of {task_name} in {}...",
            segments.len(),
            workspace.task_id()
        );

        let strategy = match self.muxer_merge(&workspace, &absolute).await {
            Ok(()) => MergeStrategy::Muxer,
            Err(e) => {
                tracing::warn!("Muxer can not merge {task_name}, falling back to binary concatenation. {e}");
                if workspace.temp_output_path().exists() {
                    tokio::fs::remove_file(workspace.temp_output_path()).await?;
                }
                binary_concat(&absolute, workspace.temp_output_path(), self.buffer_size)
                    .await
                    .map_err(|e| KaoriError::MergeFailed(format!("binary concatenation failed: {e}")))?;
                MergeStrategy::BinaryConcat
            }
        };

        move_file(workspace.temp_output_path(), output).await?;
        let size = tokio::fs::metadata(output).await?.len();

        if !self.keep_segments {
            for segment in segments {
                if let Err(e) = tokio::fs::remove_file(segment).await {
                    tracing::warn!("Failed to remove {}: {e}", segment.display());
                }
            }
        }
        drop(workspace);

        tracing::info!("Merged {task_name} into {} ({strategy:?}).", output.display());
        Ok(MergeReport {
            strategy,
            output_path: output.to_path_buf(),
            size,
        })
    }

    async fn muxer_merge(&self, workspace: &MergeWorkspace, segments: &[PathBuf]) -> KaoriResult<()> {
        write_concat_list(workspace.file_list_path(), segments).await?;
        ffmpeg_concat(
            &self.muxer,
            workspace.file_list_path(),
            workspace.temp_output_path(),
            self.timeout,
        )
        .await
    }
}
