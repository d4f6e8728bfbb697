use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    decrypt::EncryptionContext,
    error::{ErrorKind, KaoriError},
    segment::Segment,
};

/// A job as submitted by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub name: String,
    pub url: String,
    pub output_dir: PathBuf,
}

impl TaskRequest {
    pub fn new(name: impl Into<String>, url: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            output_dir: output_dir.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskStatus {
    #[default]
    Pending,
    Downloading,
    DownloadComplete,
    Merging,
    Completed,
    Failed,
}

/// A task after its playlist has been resolved.
#[derive(Debug, Clone)]
pub struct Task {
    pub name: String,
    pub playlist_url: String,
    pub output_dir: PathBuf,
    /// `{temp_root}/{name}`, shared by nothing else.
    pub temp_dir: PathBuf,
    pub segments: Vec<Segment>,
    pub encryption: Option<EncryptionContext>,
    pub status: TaskStatus,
}

impl Task {
    pub fn new(request: &TaskRequest, temp_root: &Path) -> Self {
        Self {
            name: request.name.clone(),
            playlist_url: request.url.clone(),
            output_dir: request.output_dir.clone(),
            temp_dir: temp_root.join(&request.name),
            segments: Vec::new(),
            encryption: None,
            status: TaskStatus::Pending,
        }
    }

    pub fn output_path(&self, container_ext: &str) -> PathBuf {
        self.output_dir.join(format!("{}.{container_ext}", self.name))
    }

    /// Segment paths in merge order.
    pub fn segment_paths(&self) -> Vec<PathBuf> {
        let mut segments: Vec<_> = self.segments.iter().collect();
        segments.sort_by_key(|s| s.index);
        segments.iter().map(|s| s.path(&self.temp_dir)).collect()
    }
}

/// Where in its lifecycle a task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePhase {
    Resolve,
    Key,
    Download,
    Merge,
}

#[derive(Debug)]
pub struct TaskFailure {
    pub phase: FailurePhase,
    pub error: KaoriError,
}

impl TaskFailure {
    pub fn new(phase: FailurePhase, error: KaoriError) -> Self {
        Self { phase, error }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    /// Number of segments missing when the task failed for that reason.
    pub fn missing_segments(&self) -> Option<usize> {
        match &self.error {
            KaoriError::MissingSegments { missing, .. } => Some(*missing),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} phase: {}", self.phase, self.error)
    }
}

#[derive(Debug)]
pub struct TaskResult {
    pub name: String,
    pub success: bool,
    pub output_path: Option<PathBuf>,
    pub error: Option<TaskFailure>,
}

impl TaskResult {
    pub fn success(name: impl Into<String>, output_path: PathBuf) -> Self {
        Self {
            name: name.into(),
            success: true,
            output_path: Some(output_path),
            error: None,
        }
    }

    pub fn failure(name: impl Into<String>, failure: TaskFailure) -> Self {
        Self {
            name: name.into(),
            success: false,
            output_path: None,
            error: Some(failure),
        }
    }
}
