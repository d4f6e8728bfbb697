use std::{collections::HashMap, num::NonZeroUsize, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    decrypt::parse_iv,
    error::{KaoriError, KaoriResult},
    fetch::RetryPolicy,
};

/// Everything the pipeline needs to know about how to download.
///
/// All durations are stored in seconds so the struct reads naturally from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Segment workers per task.
    pub threads: NonZeroUsize,
    /// Tasks processed at the same time in a batch.
    pub max_concurrent_tasks: NonZeroUsize,
    /// Tasks allowed to render live progress. Defaults to `max_concurrent_tasks`.
    pub display_slots: Option<usize>,

    pub connect_timeout: u64,
    pub read_timeout: u64,

    /// Attempts made for a single segment before it is given up.
    pub max_attempts: u32,
    /// Base backoff between segment attempts, doubled after every failure.
    pub retry_delay: f64,
    /// Serial passes over still-missing segments after the parallel pass.
    pub retry_passes: u32,

    /// Buffer used when concatenating segments without the muxer.
    pub buffer_size: usize,

    pub temp_dir: PathBuf,
    pub output_dir: PathBuf,
    pub headers: HashMap<String, String>,
    pub verify_ssl: bool,

    /// Decrypt AES-128 segments while downloading.
    pub decrypt: bool,
    pub key_cache_dir: PathBuf,
    /// Lifetime of a cached key, in seconds.
    pub key_cache_ttl: u64,
    /// Remove every cached key once a batch finishes.
    pub purge_key_cache: bool,
    /// Read the key from this file instead of the playlist key URI.
    pub custom_key_path: Option<PathBuf>,
    /// Hex IV overriding both the playlist IV and sequence derivation.
    pub custom_iv: Option<String>,

    /// Extension of the merged output file.
    pub container_ext: String,
    /// Name or path of the external muxer.
    pub muxer: String,
    pub merge_timeout: u64,
    /// Keep downloaded segments after a successful merge.
    pub keep_segments: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(2),
            max_concurrent_tasks: NonZeroUsize::new(3).unwrap_or(NonZeroUsize::MIN),
            display_slots: None,
            connect_timeout: 10,
            read_timeout: 30,
            max_attempts: 3,
            retry_delay: 1.0,
            retry_passes: 3,
            buffer_size: 1024 * 1024,
            temp_dir: PathBuf::from("temp"),
            output_dir: PathBuf::from("."),
            headers: HashMap::from([
                ("Accept".to_string(), "*/*".to_string()),
                ("Accept-Language".to_string(), "en-US,en;q=0.9".to_string()),
            ]),
            verify_ssl: false,
            decrypt: true,
            key_cache_dir: PathBuf::from(".key_cache"),
            key_cache_ttl: 3600,
            purge_key_cache: false,
            custom_key_path: None,
            custom_iv: None,
            container_ext: "mp4".to_string(),
            muxer: "ffmpeg".to_string(),
            merge_timeout: 600,
            keep_segments: false,
        }
    }
}

fn default_threads(factor: usize) -> NonZeroUsize {
    let cpus = std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(4);
    NonZeroUsize::new(cpus * factor).unwrap_or(NonZeroUsize::MIN)
}

impl DownloadConfig {
    pub fn from_toml(data: &str) -> KaoriResult<Self> {
        let config: Self = toml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values that can not be turned into durations or IVs.
    pub fn validate(&self) -> KaoriResult<()> {
        self.retry_delay()?;
        self.custom_iv()?;
        Ok(())
    }

    pub fn load(path: impl Into<PathBuf>) -> KaoriResult<Self> {
        let path = path.into();
        let data = std::fs::read_to_string(&path)
            .map_err(|source| KaoriError::ConfigError { path, source })?;
        Self::from_toml(&data)
    }

    /// Many threads, few retries and short timeouts.
    pub fn fast() -> Self {
        Self {
            threads: default_threads(4),
            max_attempts: 1,
            retry_delay: 0.5,
            connect_timeout: 5,
            read_timeout: 15,
            ..Default::default()
        }
    }

    /// Fewer threads, more retries and generous timeouts.
    pub fn stable() -> Self {
        Self {
            threads: default_threads(1),
            max_attempts: 5,
            retry_delay: 2.0,
            connect_timeout: 15,
            read_timeout: 60,
            ..Default::default()
        }
    }

    pub fn low_bandwidth() -> Self {
        Self {
            threads: NonZeroUsize::new(2).unwrap_or(NonZeroUsize::MIN),
            max_attempts: 3,
            retry_delay: 3.0,
            ..Default::default()
        }
    }

    pub fn encrypted() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: 1.5,
            decrypt: true,
            key_cache_ttl: 7200,
            ..Default::default()
        }
    }

    /// Store segments exactly as served, without decrypting them.
    pub fn no_decrypt() -> Self {
        Self {
            decrypt: false,
            ..Default::default()
        }
    }

    pub fn preset(name: &str) -> Option<Self> {
        Some(match name {
            "default" => Self::default(),
            "fast" => Self::fast(),
            "stable" => Self::stable(),
            "low-bandwidth" | "low_bandwidth" => Self::low_bandwidth(),
            "encrypted" => Self::encrypted(),
            "no-decrypt" | "no_decrypt" => Self::no_decrypt(),
            _ => return None,
        })
    }

    pub fn retry_delay(&self) -> KaoriResult<Duration> {
        Duration::try_from_secs_f64(self.retry_delay).map_err(|_| {
            KaoriError::InvalidConfig(format!(
                "retry_delay must be a non-negative number of seconds, got {}",
                self.retry_delay
            ))
        })
    }

    pub fn retry_policy(&self) -> KaoriResult<RetryPolicy> {
        Ok(RetryPolicy::new(self.max_attempts, self.retry_delay()?))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }

    pub fn key_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.key_cache_ttl)
    }

    pub fn merge_timeout(&self) -> Duration {
        Duration::from_secs(self.merge_timeout)
    }

    pub fn display_slots(&self) -> usize {
        self.display_slots
            .unwrap_or(self.max_concurrent_tasks.get())
    }

    pub fn custom_iv(&self) -> KaoriResult<Option<[u8; 16]>> {
        self.custom_iv.as_deref().map(parse_iv).transpose()
    }

    /// Reads the configured local key file, if any.
    pub fn custom_key(&self) -> KaoriResult<Option<Vec<u8>>> {
        match &self.custom_key_path {
            Some(path) => std::fs::read(path)
                .map(Some)
                .map_err(|source| KaoriError::ConfigError {
                    path: path.clone(),
                    source,
                }),
            None => Ok(None),
        }
    }
}
