use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant, SystemTime},
};

use aes::cipher::{
    block_padding::{NoPadding, Pkcs7},
    BlockDecryptMut, KeyIvInit,
};

use crate::{
    error::{KaoriError, KaoriResult},
    util::http::HttpClient,
};

pub const KEY_LENGTH: usize = 16;

/// Per-task encryption metadata. Built once from the playlist and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionContext {
    pub method: String,
    pub key_uri: Option<String>,
    /// Explicit IV. `None` means the IV is derived from the media sequence.
    pub iv: Option<[u8; 16]>,
    pub media_sequence_base: u64,
}

impl EncryptionContext {
    pub fn aes128(key_uri: impl Into<String>, iv: Option<[u8; 16]>, media_sequence_base: u64) -> Self {
        Self {
            method: "AES-128".to_string(),
            key_uri: Some(key_uri.into()),
            iv,
            media_sequence_base,
        }
    }

    /// Sequence number of the segment at `index` in the playlist as resolved.
    pub fn sequence_number(&self, index: usize) -> u128 {
        self.media_sequence_base as u128 + index as u128
    }
}

/// The IV used when a key carries no explicit one.
pub fn derive_iv(sequence_number: u128) -> [u8; 16] {
    sequence_number.to_be_bytes()
}

/// Parses an IV attribute such as `0x1A2B...`. Short values are left padded with zeros.
pub fn parse_iv(iv: &str) -> KaoriResult<[u8; 16]> {
    let hex = iv
        .strip_prefix("0x")
        .or_else(|| iv.strip_prefix("0X"))
        .unwrap_or(iv);
    if hex.is_empty() || hex.len() > 32 {
        return Err(KaoriError::InvalidIv(iv.to_string()));
    }

    let bytes = hex::decode(format!("{hex:0>32}"))?;
    bytes
        .try_into()
        .map_err(|_| KaoriError::InvalidIv(iv.to_string()))
}

/// Truncates or zero-pads key material to exactly 16 bytes.
pub fn normalize_key(mut key: Vec<u8>) -> [u8; 16] {
    if key.len() != KEY_LENGTH {
        tracing::warn!(
            "Unexpected key length: {} bytes (expected {KEY_LENGTH}), normalizing.",
            key.len()
        );
    }
    key.resize(KEY_LENGTH, 0);

    let mut normalized = [0u8; KEY_LENGTH];
    normalized.copy_from_slice(&key);
    normalized
}

/// AES-128-CBC decryption.
///
/// PKCS#7 padding is removed when present. Some encoders omit it, in which case the
/// decrypted blocks are returned untouched; deciding whether they are garbage is left
/// to the caller's frame check.
pub fn decrypt(
    data: &[u8],
    key: &[u8; 16],
    iv: Option<&[u8; 16]>,
    sequence_number: u128,
) -> KaoriResult<Vec<u8>> {
    if data.is_empty() {
        return Err(KaoriError::DecryptionError("empty ciphertext".to_string()));
    }

    let iv = iv.copied().unwrap_or_else(|| derive_iv(sequence_number));
    let decryptor = || cbc::Decryptor::<aes::Aes128>::new(key.into(), (&iv).into());

    match decryptor().decrypt_padded_vec_mut::<Pkcs7>(data) {
        Ok(plain) => Ok(plain),
        Err(_) => decryptor()
            .decrypt_padded_vec_mut::<NoPadding>(data)
            .map_err(|_| {
                KaoriError::DecryptionError(format!(
                    "ciphertext length {} is not a multiple of the block size",
                    data.len()
                ))
            }),
    }
}

#[derive(Debug, Clone)]
pub struct KeyCacheEntry {
    pub task_name: String,
    pub key: [u8; 16],
    pub fetched_at: Instant,
}

type KeySlot = Arc<tokio::sync::Mutex<Option<KeyCacheEntry>>>;

/// Key retrieval and caching.
///
/// Keys are cached by task name, never by key URI, so two tasks can not observe each
/// other's key material even when their playlists point at the same URI. Every task
/// owns a slot with its own lock: concurrent lookups for one task fetch the key once,
/// lookups for different tasks never wait on each other.
pub struct CryptoEngine {
    client: HttpClient,
    cache_dir: PathBuf,
    ttl: Duration,
    /// Replaces the network fetch for every task when set.
    custom_key: Option<Vec<u8>>,

    slots: Mutex<HashMap<String, KeySlot>>,
}

impl CryptoEngine {
    pub fn new(client: HttpClient, cache_dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            client,
            cache_dir: cache_dir.into(),
            ttl,
            custom_key: None,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_custom_key(mut self, key: Option<Vec<u8>>) -> Self {
        self.custom_key = key;
        self
    }

    pub fn cache_path(&self, task_name: &str) -> PathBuf {
        self.cache_dir.join(format!("{task_name}.key"))
    }

    fn slot(&self, task_name: &str) -> KeySlot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(task_name.to_string()).or_default().clone()
    }

    /// Returns the key of `task_name`, fetching it from `key_uri` if it is not cached.
    ///
    /// A configured local key always wins and never touches either cache.
    pub async fn get_key(&self, task_name: &str, key_uri: &str) -> KaoriResult<[u8; 16]> {
        if let Some(key) = &self.custom_key {
            return Ok(normalize_key(key.clone()));
        }

        let slot = self.slot(task_name);
        let mut entry = slot.lock().await;

        if let Some(cached) = entry.as_ref() {
            if cached.fetched_at.elapsed() < self.ttl {
                return Ok(cached.key);
            }
            tracing::debug!("Cached key of {task_name} expired.");
        }

        let key = match self.read_disk_cache(task_name).await {
            Some(key) => {
                tracing::debug!("Loaded key of {task_name} from disk cache.");
                key
            }
            None => {
                let key = self.load_key(task_name, key_uri).await?;
                self.write_disk_cache(task_name, &key).await;
                key
            }
        };

        *entry = Some(KeyCacheEntry {
            task_name: task_name.to_string(),
            key,
            fetched_at: Instant::now(),
        });
        Ok(key)
    }

    async fn load_key(&self, task_name: &str, key_uri: &str) -> KaoriResult<[u8; 16]> {
        let missing = |reason: String| KaoriError::MissingKey {
            task: task_name.to_string(),
            reason,
        };

        let response = self
            .client
            .get(key_uri)
            .send()
            .await
            .map_err(|e| missing(e.to_string()))?;
        if !response.status().is_success() {
            return Err(missing(format!("HTTP error: {}", response.status())));
        }
        let bytes = response.bytes().await.map_err(|e| missing(e.to_string()))?;
        if bytes.is_empty() {
            return Err(missing("key endpoint returned no data".to_string()));
        }

        tracing::info!("Downloaded key of {task_name}.");
        Ok(normalize_key(bytes.to_vec()))
    }

    async fn read_disk_cache(&self, task_name: &str) -> Option<[u8; 16]> {
        let path = self.cache_path(task_name);
        let metadata = tokio::fs::metadata(&path).await.ok()?;
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .unwrap_or_default();
        if age >= self.ttl {
            return None;
        }

        let data = tokio::fs::read(&path).await.ok()?;
        (data.len() == KEY_LENGTH).then(|| normalize_key(data))
    }

    async fn write_disk_cache(&self, task_name: &str, key: &[u8; 16]) {
        let result = async {
            tokio::fs::create_dir_all(&self.cache_dir).await?;
            tokio::fs::write(self.cache_path(task_name), key).await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!("Failed to save key cache of {task_name}: {e}");
        }
    }

    /// Drops the cached key of one task, in memory and on disk.
    pub async fn forget(&self, task_name: &str) -> KaoriResult<()> {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(task_name);
        if let Some(slot) = slot {
            slot.lock().await.take();
        }
        remove_if_exists(&self.cache_path(task_name)).await
    }

    /// Drops every cached key.
    pub async fn purge(&self) -> KaoriResult<()> {
        let slots: Vec<_> = self
            .slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        for slot in slots {
            slot.lock().await.take();
        }

        let mut entries = match tokio::fs::read_dir(&self.cache_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "key") {
                remove_if_exists(&path).await?;
            }
        }
        tracing::info!("Key cache purged.");
        Ok(())
    }
}

async fn remove_if_exists(path: &Path) -> KaoriResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
