use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use tokio::process::Command;

use crate::error::{KaoriError, KaoriResult};

/// Muxer stderr kept in error messages, in bytes.
const STDERR_TAIL: usize = 2048;

/// Quotes a path for the ffmpeg concat demuxer: `file '<path>'`.
pub fn concat_list_entry(path: &Path) -> String {
    let path = path.to_string_lossy().replace('\'', r"'\''");
    format!("file '{path}'")
}

/// Writes the concat list for `segments`, which must be absolute and in merge order.
pub async fn write_concat_list(list_path: &Path, segments: &[PathBuf]) -> KaoriResult<()> {
    let mut content = String::new();
    for segment in segments {
        content.push_str(&concat_list_entry(segment));
        content.push('\n');
    }
    tokio::fs::write(list_path, content).await?;
    Ok(())
}

/// Concatenates the segments of `list_path` into `output` with stream copy.
///
/// The muxer is killed when `timeout` expires or the future is dropped.
pub async fn ffmpeg_concat(
    muxer: &str,
    list_path: &Path,
    output: &Path,
    timeout: Duration,
) -> KaoriResult<()> {
    let ffmpeg = which::which(muxer)?;
    tracing::debug!("Concatenating with {}...", ffmpeg.display());

    let child = Command::new(ffmpeg)
        .args(["-hide_banner", "-loglevel", "error"])
        .args(["-f", "concat", "-safe", "0", "-i"])
        .arg(list_path)
        .args(["-c", "copy", "-bsf:a", "aac_adtstoasc", "-y"])
        .arg(output)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let result = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| KaoriError::MergeFailed(format!("muxer timed out after {timeout:?}")))??;

    if !result.status.success() {
        let stderr = String::from_utf8_lossy(&result.stderr);
        let stderr = stderr.trim();
        let start = stderr
            .char_indices()
            .rev()
            .nth(STDERR_TAIL)
            .map(|(i, _)| i)
            .unwrap_or(0);
        return Err(KaoriError::MuxerFailed {
            status: result.status.to_string(),
            stderr: stderr[start..].to_string(),
        });
    }

    let size = tokio::fs::metadata(output)
        .await
        .map(|m| m.len())
        .unwrap_or_default();
    if size == 0 {
        return Err(KaoriError::MergeFailed(
            "muxer exited successfully without producing output".to_string(),
        ));
    }
    Ok(())
}
