use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    error::{KaoriError, KaoriResult},
    task::TaskRequest,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskEntry {
    name: String,
    url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output_dir: Option<PathBuf>,
}

/// A batch of tasks stored as a JSON array of `{ "name", "url", "output_dir"? }`.
pub struct TaskList;

impl TaskList {
    /// Parses a task list.
    ///
    /// A relative `output_dir` is resolved against `base_output_dir`. Tasks without one
    /// are written to `{base_output_dir}/{name}`.
    pub fn parse(data: &str, base_output_dir: &Path) -> KaoriResult<Vec<TaskRequest>> {
        let entries: Vec<TaskEntry> = serde_json::from_str(data)?;
        Ok(entries
            .into_iter()
            .map(|entry| {
                let output_dir = match entry.output_dir {
                    Some(dir) if dir.is_absolute() => dir,
                    Some(dir) => base_output_dir.join(dir),
                    None => base_output_dir.join(&entry.name),
                };
                TaskRequest {
                    name: entry.name,
                    url: entry.url,
                    output_dir,
                }
            })
            .collect())
    }

    pub fn load(path: impl AsRef<Path>, base_output_dir: &Path) -> KaoriResult<Vec<TaskRequest>> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| KaoriError::ConfigError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&data, base_output_dir)
    }

    pub fn save(path: impl AsRef<Path>, tasks: &[TaskRequest]) -> KaoriResult<()> {
        let entries: Vec<_> = tasks
            .iter()
            .map(|task| TaskEntry {
                name: task.name.clone(),
                url: task.url.clone(),
                output_dir: Some(task.output_dir.clone()),
            })
            .collect();
        std::fs::write(path, serde_json::to_string_pretty(&entries)?)?;
        Ok(())
    }
}
