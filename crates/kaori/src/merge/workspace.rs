use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::error::KaoriResult;

pub const WORKSPACES_DIR: &str = "merge_workspaces";

/// Scratch directory owned by exactly one merge call.
///
/// Its name is the task name plus a random suffix, so two merges of the same task never
/// share a concat list or temporary output. The directory is removed when the value is
/// dropped, including when the merge future is cancelled.
pub struct MergeWorkspace {
    task_id: String,
    dir: TempDir,
    file_list_path: PathBuf,
    temp_output_path: PathBuf,
}

impl MergeWorkspace {
    pub async fn create(
        temp_root: impl AsRef<Path>,
        task_name: &str,
        extension: &str,
    ) -> KaoriResult<Self> {
        let root = temp_root.as_ref().join(WORKSPACES_DIR);
        tokio::fs::create_dir_all(&root).await?;

        let prefix = format!("{task_name}_");
        let dir = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(&prefix)
                .rand_bytes(8)
                .tempdir_in(&root)
        })
        .await
        .map_err(std::io::Error::from)??;
        let task_id = dir
            .path()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| task_name.to_string());

        let file_list_path = dir.path().join("concat_list.txt");
        let temp_output_path = dir.path().join(format!("output.{extension}"));
        tracing::debug!("Created merge workspace {}.", dir.path().display());

        Ok(Self {
            task_id,
            dir,
            file_list_path,
            temp_output_path,
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn work_dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn file_list_path(&self) -> &Path {
        &self.file_list_path
    }

    pub fn temp_output_path(&self) -> &Path {
        &self.temp_output_path
    }
}
