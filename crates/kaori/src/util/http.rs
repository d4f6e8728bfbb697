use std::{ops::Deref, str::FromStr, sync::Arc};

use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Client, ClientBuilder, IntoUrl,
};
use reqwest_cookie_store::{CookieStore, CookieStoreMutex};

use crate::{config::DownloadConfig, error::KaoriResult};

#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    cookies_store: Arc<CookieStoreMutex>,
}

impl HttpClient {
    pub fn new(builder: ClientBuilder) -> KaoriResult<Self> {
        let cookies_store = Arc::new(CookieStoreMutex::new(CookieStore::default()));
        let client = builder.cookie_provider(cookies_store.clone()).build()?;

        Ok(Self {
            client,
            cookies_store,
        })
    }

    /// Builds a client carrying the configured headers, timeouts and TLS policy.
    pub fn from_config(config: &DownloadConfig) -> KaoriResult<Self> {
        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            match (HeaderName::from_str(key), HeaderValue::from_str(value)) {
                (Ok(key), Ok(value)) => {
                    headers.insert(key, value);
                }
                _ => tracing::warn!("Ignored invalid header: {key}: {value}"),
            }
        }

        let builder = Client::builder()
            .default_headers(headers)
            .connect_timeout(config.connect_timeout())
            .read_timeout(config.read_timeout())
            .danger_accept_invalid_certs(!config.verify_ssl);
        Self::new(builder)
    }

    pub fn add_cookies(&self, cookies: Vec<String>, url: impl IntoUrl) -> KaoriResult<()> {
        let url = url.into_url()?;
        let mut lock = self
            .cookies_store
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for cookie in cookies {
            if let Err(e) = lock.parse(&cookie, &url) {
                tracing::warn!("Ignored invalid cookie {cookie}: {e}");
            }
        }
        Ok(())
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        let cookies_store = Arc::new(CookieStoreMutex::new(CookieStore::default()));
        let client = Client::builder()
            .cookie_provider(cookies_store.clone())
            .build()
            .unwrap_or_default();

        Self {
            client,
            cookies_store,
        }
    }
}

impl Deref for HttpClient {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}
