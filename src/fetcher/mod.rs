//! Outbound HTTP towards the marketplace.

pub mod links;
mod user_agent;

#[cfg(test)]
pub(crate) mod fake;

pub use links::{expand_short_link, resolve_product_url};
pub use user_agent::{random_desktop_agent, random_mobile_agent};

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::header::{
    ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, CONTENT_TYPE, HeaderMap, HeaderValue, REFERER,
};
use reqwest::{Client, redirect};
use tracing::debug;

use crate::error::FetchError;
use crate::models::ImageData;
use crate::traits::{FetchProfile, Page, PageFetcher};

pub const MARKETPLACE_ROOT: &str = "https://www.amazon.sa/";

const MAX_REDIRECTS: usize = 5;

/// Markers of the robot-check page served with a 200 status.
const BLOCK_MARKERS: &[&str] = &[
    "validateCaptcha",
    "Type the characters you see in this image",
    "api-services-support@amazon.com",
    "Sorry, we just need to make sure you're not a robot",
];

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub image_timeout: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            image_timeout: Duration::from_secs(15),
        }
    }
}

/// Randomized inter-request delay used by callers iterating over many items
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Politeness {
    pub min: Duration,
    pub max: Duration,
}

impl Politeness {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        rand::thread_rng().gen_range(self.min..=self.max)
    }

    pub async fn pause(&self) {
        let delay = self.sample();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for Politeness {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(5))
    }
}

/// reqwest-backed fetcher with rotating headers
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    config: FetcherConfig,
}

impl HttpFetcher {
    pub fn new(config: FetcherConfig) -> Self {
        Self { config }
    }

    fn client(&self, user_agent: &str, timeout: Duration) -> Result<Client, FetchError> {
        Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            .cookie_store(true)
            .gzip(true)
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))
    }

    async fn send(
        &self,
        client: &Client,
        url: &str,
        headers: HeaderMap,
    ) -> Result<Page, FetchError> {
        let response = client.get(url).headers(headers).send().await?;
        let status = response.status();

        if !status.is_success() {
            return Err(FetchError::from_status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/html")
            .to_string();
        let final_url = response.url().to_string();
        let body = response.bytes().await?.to_vec();

        let page = Page {
            body,
            content_type,
            final_url,
        };

        if let Some(marker) = block_marker(&page.html()) {
            return Err(FetchError::Blocked(format!("robot check page ({marker})")));
        }

        Ok(page)
    }

    /// Visit the marketplace root so the session carries its cookies.
    async fn warm_up(&self, client: &Client, headers: HeaderMap) -> Result<(), FetchError> {
        debug!("Warming up session on {}", MARKETPLACE_ROOT);
        client.get(MARKETPLACE_ROOT).headers(headers).send().await?;
        Ok(())
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn get(&self, url: &str, profile: FetchProfile) -> Result<Page, FetchError> {
        match profile {
            FetchProfile::Desktop => {
                let client = self.client(random_desktop_agent(), self.config.timeout)?;
                self.send(&client, url, desktop_headers()).await
            }
            FetchProfile::Mobile => {
                let client = self.client(random_mobile_agent(), self.config.timeout)?;
                self.warm_up(&client, mobile_headers()).await?;
                Politeness::new(Duration::from_secs(1), Duration::from_secs(2))
                    .pause()
                    .await;
                self.send(&client, url, mobile_headers()).await
            }
            FetchProfile::DelayedSession => {
                let client = self.client(random_desktop_agent(), self.config.timeout)?;
                self.warm_up(&client, session_headers()).await?;
                Politeness::new(Duration::from_secs(2), Duration::from_secs(3))
                    .pause()
                    .await;

                let mut headers = session_headers();
                headers.insert(REFERER, HeaderValue::from_static(MARKETPLACE_ROOT));
                self.send(&client, url, headers).await
            }
        }
    }

    async fn follow_redirects(&self, url: &str) -> Result<String, FetchError> {
        let client = self.client(random_desktop_agent(), self.config.timeout)?;
        // The landing page may well be throttled; only where we ended up matters.
        let response = client.get(url).headers(desktop_headers()).send().await?;
        Ok(response.url().to_string())
    }

    async fn download_image(&self, url: &str) -> Result<ImageData, FetchError> {
        let client = self.client(random_desktop_agent(), self.config.image_timeout)?;
        let response = client.get(url).headers(desktop_headers()).send().await?;
        let status = response.status();

        if !status.is_success() {
            return Err(FetchError::from_status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();
        let bytes = response.bytes().await?.to_vec();

        Ok(ImageData {
            bytes,
            content_type,
        })
    }
}

/// Returns the first robot-check marker found in a page body.
pub fn block_marker(body: &str) -> Option<&'static str> {
    BLOCK_MARKERS
        .iter()
        .copied()
        .find(|marker| body.contains(marker))
}

fn base_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
        ),
    );
    headers.insert(
        ACCEPT_LANGUAGE,
        HeaderValue::from_static("ar,en-US;q=0.9,en;q=0.8"),
    );
    headers.insert("upgrade-insecure-requests", HeaderValue::from_static("1"));
    headers
}

fn desktop_headers() -> HeaderMap {
    let mut headers = base_headers();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("pragma", HeaderValue::from_static("no-cache"));
    headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
    headers.insert("sec-ch-ua-platform", HeaderValue::from_static("\"macOS\""));
    headers.insert("sec-fetch-dest", HeaderValue::from_static("document"));
    headers.insert("sec-fetch-mode", HeaderValue::from_static("navigate"));
    headers.insert("sec-fetch-site", HeaderValue::from_static("none"));
    headers.insert("sec-fetch-user", HeaderValue::from_static("?1"));
    headers
}

fn mobile_headers() -> HeaderMap {
    let mut headers = base_headers();
    headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?1"));
    headers.insert("sec-ch-ua-platform", HeaderValue::from_static("\"iOS\""));
    headers
}

fn session_headers() -> HeaderMap {
    let mut headers = desktop_headers();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=0"));
    headers.insert("dnt", HeaderValue::from_static("1"));
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_politeness_sample_within_range() {
        let politeness = Politeness::new(Duration::from_millis(200), Duration::from_millis(500));
        for _ in 0..50 {
            let d = politeness.sample();
            assert!(d >= Duration::from_millis(200) && d <= Duration::from_millis(500));
        }
        assert_eq!(Politeness::none().sample(), Duration::ZERO);
    }

    #[test]
    fn test_block_marker_detects_captcha_page() {
        let page = r#"<form method="get" action="/errors/validateCaptcha"></form>"#;
        assert_eq!(block_marker(page), Some("validateCaptcha"));
        assert_eq!(block_marker("<span id=\"productTitle\">Kettle</span>"), None);
    }

    #[test]
    fn test_profiles_send_distinct_platform_hints() {
        assert_eq!(desktop_headers()["sec-ch-ua-mobile"], "?0");
        assert_eq!(mobile_headers()["sec-ch-ua-mobile"], "?1");
        assert_eq!(session_headers()[CACHE_CONTROL], "max-age=0");
    }
}
