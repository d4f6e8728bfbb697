use std::path::{Path, PathBuf};

use tokio::{
    fs::File,
    io::{AsyncWriteExt, BufWriter},
};

use crate::error::KaoriResult;

/// Appends the segments byte by byte into `output`, in the given order.
///
/// Returns the number of bytes written.
pub async fn binary_concat(segments: &[PathBuf], output: &Path, buffer_size: usize) -> KaoriResult<u64> {
    tracing::debug!("Concatenating {} segments in binary mode...", segments.len());

    let file = File::create(output).await?;
    let mut writer = BufWriter::with_capacity(buffer_size.max(1), file);

    let mut written = 0;
    for segment in segments {
        let mut input = File::open(segment).await?;
        written += tokio::io::copy(&mut input, &mut writer).await?;
    }

    writer.flush().await?;
    writer.into_inner().sync_all().await?;
    Ok(written)
}

/// Moves `from` to `to`, copying when a rename is not possible (e.g. across file systems).
pub async fn move_file(from: &Path, to: &Path) -> KaoriResult<()> {
    if let Some(parent) = to.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    if tokio::fs::rename(from, to).await.is_err() {
        tokio::fs::copy(from, to).await?;
        tokio::fs::remove_file(from).await?;
    }
    Ok(())
}
