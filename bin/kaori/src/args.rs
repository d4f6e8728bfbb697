use std::{num::NonZeroUsize, path::PathBuf};

use anyhow::{bail, Context};
use clap::Parser;
use fake_user_agent::get_chrome_rua;
use kaori::{util::url_file_name, DownloadConfig, TaskList, TaskRequest};

#[derive(Parser, Debug, Clone)]
#[clap(version, about)]
pub struct KaoriArgs {
    /// m3u8 playlist URL of a single task
    #[clap(required_unless_present = "tasks")]
    pub url: Option<String>,

    /// Task name, used for the output file name
    ///
    /// Defaults to the playlist file name.
    #[clap(short, long)]
    pub name: Option<String>,

    /// JSON task list to download in batch
    #[clap(short, long, conflicts_with = "url")]
    pub tasks: Option<PathBuf>,

    /// TOML configuration file
    #[clap(short, long)]
    pub config: Option<PathBuf>,

    /// Configuration preset: default, fast, stable, low-bandwidth, encrypted or no-decrypt
    #[clap(long)]
    pub preset: Option<String>,

    /// Segment threads per task
    #[clap(long)]
    pub threads: Option<NonZeroUsize>,

    /// Tasks downloaded at the same time
    #[clap(short = 'j', long)]
    pub concurrent_tasks: Option<NonZeroUsize>,

    /// Attempts per segment
    #[clap(long)]
    pub retries: Option<u32>,

    /// Base delay between attempts, in seconds
    #[clap(long)]
    pub retry_delay: Option<f64>,

    /// Serial passes over missing segments
    #[clap(long)]
    pub retry_passes: Option<u32>,

    /// Connect timeout, in seconds
    #[clap(long)]
    pub connect_timeout: Option<u64>,

    /// Read timeout, in seconds
    #[clap(long)]
    pub read_timeout: Option<u64>,

    /// Temporary directory for segments
    #[clap(long, env = "KAORI_TEMP")]
    pub temp_dir: Option<PathBuf>,

    /// Output directory
    #[clap(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Key cache directory
    #[clap(long)]
    pub key_cache_dir: Option<PathBuf>,

    /// HTTP header used to download
    ///
    /// Custom header. eg. "Referer: https://example.com/".
    #[clap(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Cookies used to download, eg. "a=1; b=2"
    #[clap(long)]
    pub cookies: Option<String>,

    /// Verify TLS certificates
    ///
    /// Certificates are not verified unless this is given or `verify_ssl = true` is configured.
    #[clap(long)]
    pub verify_ssl: bool,

    /// Keep encrypted segments encrypted
    #[clap(long)]
    pub no_decrypt: bool,

    /// Read the decryption key from this file
    #[clap(long)]
    pub key_file: Option<PathBuf>,

    /// Hex IV overriding the playlist, eg. 0x000102...
    #[clap(long)]
    pub iv: Option<String>,

    /// Keep segments after merging
    #[clap(long)]
    pub keep: bool,

    /// Remove cached keys when all tasks are finished
    #[clap(long)]
    pub purge_keys: bool,

    /// Muxer executable
    #[clap(long)]
    pub muxer: Option<String>,

    /// Output container extension
    #[clap(long)]
    pub ext: Option<String>,

    /// Debug output
    #[clap(short, long, alias = "debug")]
    pub verbose: bool,
}

impl KaoriArgs {
    /// Preset or file first, then every flag given on the command line.
    pub fn config(&self) -> anyhow::Result<DownloadConfig> {
        let mut config = match (&self.config, &self.preset) {
            (Some(path), _) => DownloadConfig::load(path)?,
            (None, Some(preset)) => match DownloadConfig::preset(preset) {
                Some(config) => config,
                None => bail!("Unknown preset: {preset}"),
            },
            (None, None) => DownloadConfig::default(),
        };

        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if let Some(tasks) = self.concurrent_tasks {
            config.max_concurrent_tasks = tasks;
        }
        if let Some(retries) = self.retries {
            config.max_attempts = retries;
        }
        if let Some(delay) = self.retry_delay {
            config.retry_delay = delay;
        }
        if let Some(passes) = self.retry_passes {
            config.retry_passes = passes;
        }
        if let Some(timeout) = self.connect_timeout {
            config.connect_timeout = timeout;
        }
        if let Some(timeout) = self.read_timeout {
            config.read_timeout = timeout;
        }
        if let Some(dir) = &self.temp_dir {
            config.temp_dir = dir.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(dir) = &self.key_cache_dir {
            config.key_cache_dir = dir.clone();
        }
        for header in &self.headers {
            let Some((key, value)) = header.split_once(':') else {
                bail!("Invalid header: {header}");
            };
            config
                .headers
                .insert(key.trim().to_string(), value.trim().to_string());
        }
        if !config
            .headers
            .keys()
            .any(|key| key.eq_ignore_ascii_case("user-agent"))
        {
            config
                .headers
                .insert("User-Agent".to_string(), get_chrome_rua().to_string());
        }

        if self.verify_ssl {
            config.verify_ssl = true;
        }
        if self.no_decrypt {
            config.decrypt = false;
        }
        if let Some(path) = &self.key_file {
            config.custom_key_path = Some(path.clone());
        }
        if let Some(iv) = &self.iv {
            config.custom_iv = Some(iv.clone());
        }
        if self.keep {
            config.keep_segments = true;
        }
        if self.purge_keys {
            config.purge_key_cache = true;
        }
        if let Some(muxer) = &self.muxer {
            config.muxer = muxer.clone();
        }
        if let Some(ext) = &self.ext {
            config.container_ext = ext.trim_start_matches('.').to_string();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn requests(&self, config: &DownloadConfig) -> anyhow::Result<Vec<TaskRequest>> {
        if let Some(tasks) = &self.tasks {
            return TaskList::load(tasks, &config.output_dir)
                .with_context(|| format!("Failed to load task list {}", tasks.display()));
        }

        let Some(url) = &self.url else {
            bail!("Either a playlist URL or --tasks is required.");
        };
        let name = match &self.name {
            Some(name) => name.clone(),
            None => default_name(url),
        };
        Ok(vec![TaskRequest::new(name, url, &config.output_dir)])
    }

    pub fn cookies(&self) -> Vec<String> {
        self.cookies
            .as_deref()
            .map(|cookies| {
                cookies
                    .split(';')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn default_name(url: &str) -> String {
    let file_name = url_file_name(url);
    let stem = file_name
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(file_name);
    if stem.is_empty() {
        "output".to_string()
    } else {
        stem.to_string()
    }
}
