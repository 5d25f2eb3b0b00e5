//! Scripted in-process fetcher for unit tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::FetchError;
use crate::models::ImageData;
use crate::traits::{FetchProfile, Page, PageFetcher};

#[derive(Default)]
pub(crate) struct FakeFetcher {
    pages: Mutex<HashMap<String, Result<String, FetchError>>>,
    redirects: Mutex<HashMap<String, String>>,
    images: Mutex<HashMap<String, ImageData>>,
    hits: Mutex<HashMap<String, usize>>,
    delay: Option<Duration>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn set_page(&self, url: &str, html: impl Into<String>) {
        self.pages
            .lock()
            .unwrap()
            .insert(url.to_string(), Ok(html.into()));
    }

    pub fn set_product(&self, url: &str, name: &str, price: f64) {
        self.set_page(url, product_page(name, price));
    }

    pub fn fail(&self, url: &str, err: FetchError) {
        self.pages.lock().unwrap().insert(url.to_string(), Err(err));
    }

    pub fn redirect(&self, from: &str, to: &str) {
        self.redirects
            .lock()
            .unwrap()
            .insert(from.to_string(), to.to_string());
    }

    pub fn set_image(&self, url: &str, bytes: &[u8]) {
        self.images.lock().unwrap().insert(
            url.to_string(),
            ImageData {
                bytes: bytes.to_vec(),
                content_type: "image/jpeg".to_string(),
            },
        );
    }

    /// Page requests made for `url`, across all profiles
    pub fn hits(&self, url: &str) -> usize {
        self.hits.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageFetcher for FakeFetcher {
    async fn get(&self, url: &str, _profile: FetchProfile) -> Result<Page, FetchError> {
        *self.hits.lock().unwrap().entry(url.to_string()).or_default() += 1;

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let scripted = self.pages.lock().unwrap().get(url).cloned();
        match scripted {
            Some(Ok(html)) => Ok(Page {
                body: html.into_bytes(),
                content_type: "text/html".to_string(),
                final_url: url.to_string(),
            }),
            Some(Err(err)) => Err(err),
            None => Err(FetchError::Http { status: 404 }),
        }
    }

    async fn follow_redirects(&self, url: &str) -> Result<String, FetchError> {
        self.redirects
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or(FetchError::Http { status: 404 })
    }

    async fn download_image(&self, url: &str) -> Result<ImageData, FetchError> {
        self.images
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or(FetchError::Http { status: 404 })
    }
}

/// Minimal desktop product page
pub(crate) fn product_page(name: &str, price: f64) -> String {
    format!(
        r#"<html><body>
        <span id="productTitle">  {name}  </span>
        <div id="corePrice_feature_div"><span class="a-price"><span class="a-offscreen">SAR {price:.2}</span></span></div>
        </body></html>"#
    )
}
