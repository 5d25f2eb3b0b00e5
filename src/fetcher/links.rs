//! Product URL intake: cleanup, short-link expansion and canonical form.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;
use url::Url;

use crate::error::InputError;
use crate::traits::PageFetcher;

const MARKETPLACE_HOSTS: &[&str] = &["amazon.sa", "www.amazon.sa"];
const SHORT_LINK_HOSTS: &[&str] = &["amzn.eu", "amzn.to", "amzn.asia", "a.co"];

static ASIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/(?:dp|gp/product|gp/aw/d)/([A-Z0-9]{10})(?:[/?#]|$)").expect("valid ASIN pattern")
});

/// Trim a pasted URL, drop a leading `@` and supply a missing scheme.
pub fn clean_input(raw: &str) -> Result<Url, InputError> {
    let trimmed = raw.trim().trim_start_matches('@').trim();
    if trimmed.is_empty() {
        return Err(InputError::Empty);
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    let url = Url::parse(&with_scheme).map_err(|e| InputError::Malformed(format!("{trimmed}: {e}")))?;
    if url.host_str().is_none() {
        return Err(InputError::Malformed(trimmed.to_string()));
    }
    Ok(url)
}

pub fn is_short_link(url: &Url) -> bool {
    url.host_str()
        .map(|host| SHORT_LINK_HOSTS.contains(&host.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

pub fn is_marketplace_host(url: &Url) -> bool {
    url.host_str()
        .map(|host| MARKETPLACE_HOSTS.contains(&host.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Extract the 10-character ASIN from a product path.
pub fn extract_asin(url: &str) -> Option<String> {
    ASIN.captures(url).map(|c| c[1].to_string())
}

pub fn canonical_product_url(asin: &str) -> String {
    format!("https://www.amazon.sa/dp/{asin}")
}

/// Validate the host and reduce a marketplace URL to its canonical form.
///
/// URLs carrying an ASIN become `https://www.amazon.sa/dp/<ASIN>`; anything
/// else on the marketplace keeps its path with query and fragment removed.
pub fn canonicalize(url: &Url) -> Result<String, InputError> {
    if !is_marketplace_host(url) {
        return Err(InputError::ForeignHost(url.to_string()));
    }

    if let Some(asin) = extract_asin(url.path()) {
        return Ok(canonical_product_url(&asin));
    }

    let mut stripped = url.clone();
    stripped.set_query(None);
    stripped.set_fragment(None);
    let _ = stripped.set_scheme("https");
    let _ = stripped.set_host(Some("www.amazon.sa"));
    Ok(stripped.to_string())
}

/// Expand a short link to wherever it redirects; other URLs pass through.
pub async fn expand_short_link(fetcher: &dyn PageFetcher, raw: &str) -> Result<Url, InputError> {
    let url = clean_input(raw)?;
    if !is_short_link(&url) {
        return Ok(url);
    }

    let final_url = fetcher
        .follow_redirects(url.as_str())
        .await
        .map_err(|e| InputError::ShortLink {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
    debug!("Expanded short link {} to {}", url, final_url);

    Url::parse(&final_url).map_err(|e| InputError::Malformed(format!("{final_url}: {e}")))
}

/// Turn whatever a user pasted into the canonical marketplace URL to track.
pub async fn resolve_product_url(
    fetcher: &dyn PageFetcher,
    raw: &str,
) -> Result<String, InputError> {
    let url = expand_short_link(fetcher, raw).await?;
    canonicalize(&url)
}
