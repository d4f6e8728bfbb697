use std::path::{Path, PathBuf};

use tokio::io::AsyncReadExt;

use crate::util::url_file_name;

pub const TS_SYNC_BYTE: u8 = 0x47;
pub const TS_PACKET_SIZE: usize = 188;
/// Packets inspected by [`is_valid_ts`].
const PROBE_PACKETS: usize = 10;
/// Packets among the probed ones that must start with a sync byte.
const MIN_SYNCED_PACKETS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SegmentStatus {
    #[default]
    Pending,
    Downloading,
    Downloaded,
    Failed,
}

/// One media segment of a task.
///
/// `index` is the position in the playlist as resolved. It drives both the merge
/// order and IV derivation and must survive any filtering of the segment list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub url: String,
    pub index: usize,
    pub file_name: String,
    pub status: SegmentStatus,
}

impl Segment {
    pub fn new(url: impl Into<String>, index: usize) -> Self {
        let url = url.into();
        let file_name = segment_file_name(&url, index);
        Self {
            url,
            index,
            file_name,
            status: SegmentStatus::Pending,
        }
    }

    /// Builds segments from an ordered URL list, numbering them by playlist position.
    pub fn from_urls<I, S>(urls: I) -> Vec<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        urls.into_iter()
            .enumerate()
            .map(|(index, url)| Self::new(url, index))
            .collect()
    }

    pub fn path(&self, dir: impl AsRef<Path>) -> PathBuf {
        dir.as_ref().join(&self.file_name)
    }
}

/// `{index:06}_{basename}` keeps names unique inside a task even if URLs share a basename.
fn segment_file_name(url: &str, index: usize) -> String {
    let name = url_file_name(url).replace(['\\', ':', '*', '"', '<', '>', '|'], "_");
    if name.is_empty() {
        format!("{index:06}.ts")
    } else {
        format!("{index:06}_{name}")
    }
}

/// What a stored segment has to look like to count as downloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameCheck {
    /// MPEG-TS sync bytes, see [`is_valid_ts`].
    #[default]
    MpegTs,
    /// Any non-empty data. Used when encrypted segments are kept encrypted.
    NonEmpty,
}

impl FrameCheck {
    pub fn check(&self, data: &[u8]) -> bool {
        match self {
            FrameCheck::MpegTs => is_valid_ts(data),
            FrameCheck::NonEmpty => !data.is_empty(),
        }
    }

    /// Checks the head of a stored file. Missing or unreadable files are invalid.
    pub async fn check_file(&self, path: impl AsRef<Path>) -> bool {
        let Ok(file) = tokio::fs::File::open(path).await else {
            return false;
        };

        let mut head = Vec::with_capacity(TS_PACKET_SIZE * PROBE_PACKETS);
        if file
            .take((TS_PACKET_SIZE * PROBE_PACKETS) as u64)
            .read_to_end(&mut head)
            .await
            .is_err()
        {
            return false;
        }
        self.check(&head)
    }
}

/// The data starts with a sync byte and at least 3 of the first 10 packets are synced.
///
/// Packets beyond the end of the data do not count, so a segment shorter than
/// three packets never validates.
pub fn is_valid_ts(data: &[u8]) -> bool {
    if data.first() != Some(&TS_SYNC_BYTE) {
        return false;
    }

    let synced = data
        .iter()
        .step_by(TS_PACKET_SIZE)
        .take(PROBE_PACKETS)
        .filter(|b| **b == TS_SYNC_BYTE)
        .count();
    synced >= MIN_SYNCED_PACKETS
}
