use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KaoriError {
    #[error("HTTP error: {0}")]
    HttpError(reqwest::StatusCode),

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),

    #[error("Failed to load decryption key for {task}: {reason}")]
    MissingKey { task: String, reason: String },

    #[error("Decryption failed: {0}")]
    DecryptionError(String),

    #[error("Invalid IV: {0}")]
    InvalidIv(String),

    #[error("Unsupported encryption method: {0}")]
    UnsupportedEncryption(String),

    #[error("{file_name} is not a valid MPEG-TS segment")]
    InvalidSegment { file_name: String },

    #[error("Invalid m3u8 file: {0}")]
    M3u8ParseError(String),

    #[error("Playlist contains no segments")]
    EmptyPlaylist,

    #[error("{missing} of {total} segments are missing or invalid")]
    MissingSegments { missing: usize, total: usize },

    #[error("Merge failed: {0}")]
    MergeFailed(String),

    #[error("Muxer exited with {status}: {stderr}")]
    MuxerFailed { status: String, stderr: String },

    #[error("Invalid task name: {0:?}")]
    InvalidTaskName(String),

    #[error("Duplicate task name in batch: {0}")]
    DuplicateTask(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Can not read {path}: {source}")]
    ConfigError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    #[error(transparent)]
    HexDecodeError(#[from] hex::FromHexError),

    #[error(transparent)]
    MissingExecutable(#[from] which::Error),

    #[error(transparent)]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    TomlError(#[from] toml::de::Error),
}

pub type KaoriResult<T> = Result<T, KaoriError>;

/// Coarse classification used for retry decisions and for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Decryption,
    Validation,
    MissingKey,
    Merge,
    Resource,
    Playlist,
    Cancelled,
    Config,
}

impl KaoriError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::HttpError(_) | Self::RequestError(_) => ErrorKind::Network,
            Self::DecryptionError(_) => ErrorKind::Decryption,
            Self::InvalidSegment { .. } => ErrorKind::Validation,
            Self::MissingKey { .. } | Self::InvalidIv(_) => ErrorKind::MissingKey,
            Self::MissingSegments { .. } | Self::MergeFailed(_) | Self::MuxerFailed { .. } => {
                ErrorKind::Merge
            }
            Self::IOError(_) | Self::MissingExecutable(_) => ErrorKind::Resource,
            Self::M3u8ParseError(_)
            | Self::EmptyPlaylist
            | Self::UnsupportedEncryption(_)
            | Self::UrlParseError(_) => ErrorKind::Playlist,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InvalidTaskName(_)
            | Self::DuplicateTask(_)
            | Self::ConfigError { .. }
            | Self::InvalidConfig(_)
            | Self::HexDecodeError(_)
            | Self::JsonError(_)
            | Self::TomlError(_) => ErrorKind::Config,
        }
    }

    /// Whether a segment fetch that failed with this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Network | ErrorKind::Decryption | ErrorKind::Validation
        )
    }
}
