//! Seams between the engine and the outside world

use std::borrow::Cow;

use async_trait::async_trait;

use crate::error::{ExtractError, FetchError};
use crate::models::{ImageData, Snapshot};

/// Header set and pre-flight behaviour used for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchProfile {
    /// Rotated desktop browser headers, no warm-up.
    Desktop,
    /// Mobile browser headers after a short warm-up on the marketplace root.
    Mobile,
    /// Warm-up request, randomized 2-3 s wait, then the target with a referrer.
    DelayedSession,
}

/// A fetched page
#[derive(Debug, Clone)]
pub struct Page {
    pub body: Vec<u8>,
    pub content_type: String,
    /// URL after redirects
    pub final_url: String,
}

impl Page {
    pub fn html(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Outbound HTTP as seen by the engine
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch a page with the given header profile
    ///
    /// # Returns
    /// * `Result<Page, FetchError>` - Body, content type and final URL, or a typed failure
    async fn get(&self, url: &str, profile: FetchProfile) -> Result<Page, FetchError>;

    /// Follow redirects from `url` and return where they end
    async fn follow_redirects(&self, url: &str) -> Result<String, FetchError>;

    /// Download an image; content type defaults to `image/jpeg`
    async fn download_image(&self, url: &str) -> Result<ImageData, FetchError>;
}

/// One link of the extraction strategy chain
pub trait ExtractStrategy: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Profile the page must be fetched with for this strategy
    fn profile(&self) -> FetchProfile;

    /// Turn a page body into a valid snapshot
    ///
    /// # Arguments
    /// * `html` - The page body
    /// * `url` - The URL the body was fetched from
    fn extract(&self, html: &str, url: &str) -> Result<Snapshot, ExtractError>;
}
