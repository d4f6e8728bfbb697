use std::future::Future;

use m3u8_rs::{KeyMethod, MediaPlaylist, Playlist};
use reqwest::Url;
use tokio_util::sync::CancellationToken;

use crate::{
    decrypt::{parse_iv, EncryptionContext},
    error::{KaoriError, KaoriResult},
    fetch::RetryPolicy,
    util::http::HttpClient,
};

/// A finite media playlist reduced to what the pipeline consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPlaylist {
    /// Absolute segment URLs in playlist order.
    pub segments: Vec<String>,
    pub encryption: Option<EncryptionContext>,
    pub media_sequence: u64,
    pub resolution: Option<(u64, u64)>,
    pub bandwidth: Option<u64>,
    /// The playlist had no `#EXT-X-ENDLIST`.
    pub is_endless: bool,
}

impl ResolvedPlaylist {
    pub fn new(segments: Vec<String>) -> Self {
        Self {
            segments,
            encryption: None,
            media_sequence: 0,
            resolution: None,
            bandwidth: None,
            is_endless: false,
        }
    }

    pub fn with_encryption(mut self, encryption: Option<EncryptionContext>) -> Self {
        self.encryption = encryption;
        self
    }
}

pub trait PlaylistResolver: Send + Sync {
    fn resolve(&self, url: &str) -> impl Future<Output = KaoriResult<ResolvedPlaylist>> + Send;
}

/// Resolves HLS playlists over HTTP.
///
/// A master playlist is resolved once to its best variant, by bandwidth.
#[derive(Clone)]
pub struct M3u8PlaylistResolver {
    client: HttpClient,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl M3u8PlaylistResolver {
    pub fn new(client: HttpClient) -> Self {
        Self {
            client,
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Stops retries and backoff sleeps once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn load(&self, url: &Url) -> KaoriResult<Playlist> {
        let data = self
            .retry
            .run(&self.cancel, |_| async {
                let response = self.client.get(url.clone()).send().await?;
                if !response.status().is_success() {
                    return Err(KaoriError::HttpError(response.status()));
                }
                Ok(response.bytes().await?)
            })
            .await?;

        m3u8_rs::parse_playlist_res(&data)
            .map_err(|_| KaoriError::M3u8ParseError(format!("{url} is not a valid playlist")))
    }

    async fn resolve_url(&self, url: Url) -> KaoriResult<ResolvedPlaylist> {
        tracing::info!("Start fetching M3U8 file.");

        let (url, playlist, variant) = match self.load(&url).await? {
            Playlist::MediaPlaylist(playlist) => (url, playlist, None),
            Playlist::MasterPlaylist(master) => {
                tracing::info!("Master playlist input detected. Auto selecting best quality stream.");
                let variant = master
                    .variants
                    .into_iter()
                    .filter(|v| !v.is_i_frame)
                    .max_by_key(|v| v.bandwidth)
                    .ok_or_else(|| KaoriError::M3u8ParseError("no variant found".to_string()))?;
                let variant_url = url.join(&variant.uri)?;
                tracing::info!(
                    "Best stream: {variant_url}; Bandwidth: {bandwidth}",
                    bandwidth = variant.bandwidth
                );

                match self.load(&variant_url).await? {
                    Playlist::MediaPlaylist(playlist) => (variant_url, playlist, Some(variant)),
                    Playlist::MasterPlaylist(_) => {
                        return Err(KaoriError::M3u8ParseError(
                            "variant points to another master playlist".to_string(),
                        ))
                    }
                }
            }
        };
        tracing::info!("M3U8 file fetched.");

        let mut resolved = from_media_playlist(&url, &playlist)?;
        if let Some(variant) = variant {
            resolved.bandwidth = Some(variant.bandwidth);
            resolved.resolution = variant.resolution.map(|r| (r.width, r.height));
        }
        Ok(resolved)
    }
}

impl PlaylistResolver for M3u8PlaylistResolver {
    fn resolve(&self, url: &str) -> impl Future<Output = KaoriResult<ResolvedPlaylist>> + Send {
        let url = Url::parse(url);
        async move { self.resolve_url(url?).await }
    }
}

/// Builds a [`ResolvedPlaylist`] from a parsed media playlist served at `base`.
pub fn from_media_playlist(base: &Url, playlist: &MediaPlaylist) -> KaoriResult<ResolvedPlaylist> {
    if playlist.segments.is_empty() {
        return Err(KaoriError::EmptyPlaylist);
    }
    if !playlist.end_list {
        tracing::warn!(
            "Playlist has no end tag. Only the {} segments listed now will be downloaded.",
            playlist.segments.len()
        );
    }

    let segments = playlist
        .segments
        .iter()
        .map(|segment| base.join(&segment.uri).map(String::from))
        .collect::<Result<Vec<_>, _>>()?;

    let encryption = match playlist.segments.iter().find_map(|s| s.key.as_ref()) {
        None => None,
        Some(key) => match &key.method {
            KeyMethod::None => None,
            KeyMethod::AES128 => {
                let uri = key.uri.as_deref().ok_or_else(|| {
                    KaoriError::M3u8ParseError("AES-128 key without URI".to_string())
                })?;
                let iv = key.iv.as_deref().map(parse_iv).transpose()?;
                Some(EncryptionContext::aes128(
                    base.join(uri)?,
                    iv,
                    playlist.media_sequence,
                ))
            }
            KeyMethod::SampleAES => {
                return Err(KaoriError::UnsupportedEncryption("SAMPLE-AES".to_string()))
            }
            KeyMethod::Other(method) => {
                return Err(KaoriError::UnsupportedEncryption(method.clone()))
            }
        },
    };

    Ok(ResolvedPlaylist {
        segments,
        encryption,
        media_sequence: playlist.media_sequence,
        resolution: None,
        bandwidth: None,
        is_endless: !playlist.end_list,
    })
}
