//! Product page extraction.
//!
//! [`Extractor`] walks an ordered chain of [`ExtractStrategy`] values. Each
//! strategy names the fetch profile it needs; pages are fetched at most once
//! per profile and the first strategy producing a valid [`Snapshot`] wins.

pub mod selectors;
pub mod strategies;

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{ExtractError, FetchError, ScrapeError};
use crate::models::Snapshot;
use crate::traits::{ExtractStrategy, FetchProfile, Page, PageFetcher};

pub use selectors::ProductSelectors;
pub use strategies::{EmbeddedJsonStrategy, SelectorStrategy, default_chain};

static PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*%").unwrap());

pub struct Extractor {
    fetcher: Arc<dyn PageFetcher>,
    strategies: Vec<Box<dyn ExtractStrategy>>,
}

impl Extractor {
    pub fn new(fetcher: Arc<dyn PageFetcher>) -> Self {
        Self::with_strategies(fetcher, default_chain())
    }

    pub fn with_strategies(
        fetcher: Arc<dyn PageFetcher>,
        strategies: Vec<Box<dyn ExtractStrategy>>,
    ) -> Self {
        Self {
            fetcher,
            strategies,
        }
    }

    pub fn fetcher(&self) -> &Arc<dyn PageFetcher> {
        &self.fetcher
    }

    /// Run every strategy against one body, ignoring fetch profiles.
    pub fn extract(&self, html: &str, url: &str) -> Result<Snapshot, ExtractError> {
        for strategy in &self.strategies {
            match strategy.extract(html, url) {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) => debug!("Strategy {} failed on {}: {}", strategy.name(), url, e),
            }
        }

        Err(ExtractError::Exhausted {
            attempts: self.strategies.len(),
        })
    }

    /// Fetch `url` and walk the strategy chain over the fetched pages.
    ///
    /// When no page could be fetched at all the last fetch error is returned,
    /// so callers can tell a blocked product from a changed layout.
    pub async fn fetch_snapshot(&self, url: &str) -> Result<Snapshot, ScrapeError> {
        let mut pages: HashMap<FetchProfile, Result<Page, FetchError>> = HashMap::new();
        let mut last_fetch_error = None;
        let mut parsed_any = false;
        let mut found = None;

        for strategy in &self.strategies {
            let profile = strategy.profile();
            if !pages.contains_key(&profile) {
                let fetched = self.fetcher.get(url, profile).await;
                pages.insert(profile, fetched);
            }

            let page = match pages.get(&profile) {
                Some(Ok(page)) => page,
                Some(Err(e)) => {
                    debug!("Fetch for {} ({:?}) failed: {}", url, profile, e);
                    last_fetch_error = Some(e.clone());
                    continue;
                }
                None => continue,
            };

            parsed_any = true;
            match strategy.extract(&page.html(), url) {
                Ok(snapshot) => {
                    debug!("Strategy {} succeeded for {}", strategy.name(), url);
                    found = Some(snapshot);
                    break;
                }
                Err(e) => debug!("Strategy {} failed for {}: {}", strategy.name(), url, e),
            }
        }

        let Some(mut snapshot) = found else {
            return match last_fetch_error {
                Some(err) if !parsed_any => Err(err.into()),
                _ => Err(ExtractError::Exhausted {
                    attempts: self.strategies.len(),
                }
                .into()),
            };
        };

        if let Some(image_url) = snapshot.image_url.as_deref() {
            match self.fetcher.download_image(image_url).await {
                Ok(image) => snapshot.image = Some(image),
                Err(e) => debug!("Image download for {} failed: {}", url, e),
            }
        }

        Ok(snapshot)
    }
}

/// Keep ASCII digits and dots, then parse. Only finite positive values pass.
pub fn parse_price(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let value: f64 = cleaned.trim_matches('.').parse().ok()?;
    (value.is_finite() && value > 0.0).then_some(value)
}

/// First number followed by `%` in `text`; signs and parentheses are ignored.
pub fn percent_in(text: &str) -> Option<f64> {
    PERCENT
        .captures(text)
        .and_then(|c| c[1].parse::<f64>().ok())
        .filter(|p| p.is_finite() && *p > 0.0)
}

pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn first_text(document: &Html, selectors: &[Selector]) -> Option<String> {
    selectors.iter().find_map(|selector| {
        document
            .select(selector)
            .map(element_text)
            .find(|text| !text.is_empty())
    })
}

/// Selectors in preference order, elements in document order.
pub(crate) fn first_price(document: &Html, selectors: &[Selector]) -> Option<f64> {
    selectors.iter().find_map(|selector| {
        document
            .select(selector)
            .find_map(|element| parse_price(&element_text(element)))
    })
}

pub(crate) fn image_url(document: &Html, selectors: &[Selector]) -> Option<String> {
    selectors
        .iter()
        .flat_map(|selector| document.select(selector))
        .find_map(|img| {
            let attrs = img.value();
            attrs
                .attr("data-old-hires")
                .filter(|src| !src.trim().is_empty())
                .or_else(|| {
                    attrs
                        .attr("src")
                        .filter(|src| !src.trim().is_empty() && !src.starts_with("data:"))
                })
                .map(str::to_string)
                .or_else(|| attrs.attr("data-a-dynamic-image").and_then(dynamic_image_url))
        })
        .map(|src| {
            if src.starts_with("//") {
                format!("https:{src}")
            } else {
                src
            }
        })
}

/// `data-a-dynamic-image` holds a JSON object keyed by image URL.
fn dynamic_image_url(raw: &str) -> Option<String> {
    let images: Map<String, Value> = serde_json::from_str(raw).ok()?;
    images.keys().next().cloned()
}

/// Discount shown on a product page.
///
/// Strike-through arithmetic is preferred; "Save X%" text is the fallback.
pub fn discount_percent(document: &Html, current: f64) -> Option<f64> {
    let previous = document
        .select(&selectors::STRIKE_PRICE)
        .find_map(|element| parse_price(&element_text(element)));

    if let Some(previous) = previous
        && previous > current
    {
        return Some((previous - current) / previous * 100.0);
    }

    document
        .select(&selectors::SAVINGS)
        .find_map(|element| percent_in(&element_text(element)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::fake::{FakeFetcher, product_page};
    use crate::models::ImageData;

    const URL: &str = "https://www.amazon.sa/dp/B0TEST0001";

    #[test]
    fn test_parse_price_keeps_digits_and_dot() {
        assert_eq!(parse_price("SAR 1,299.50"), Some(1299.5));
        assert_eq!(parse_price("ر.س.‏ 90.00"), Some(90.0));
        assert_eq!(parse_price("0.00"), None);
        assert_eq!(parse_price("Currently unavailable"), None);
        assert_eq!(parse_price("١٢٣"), None);
        assert_eq!(parse_price("1.2.3"), None);
    }

    #[test]
    fn test_percent_in_ignores_sign_and_parentheses() {
        assert_eq!(percent_in("(-25%)"), Some(25.0));
        assert_eq!(percent_in("Save 12.5 %"), Some(12.5));
        assert_eq!(percent_in("Deal of the day"), None);
    }

    #[test]
    fn test_first_parseable_price_wins() {
        let html = r#"
            <span class="a-price"><span class="a-offscreen">See options</span></span>
            <span class="a-price"><span class="a-offscreen">SAR 45.00</span></span>
            <span id="priceblock_ourprice">SAR 10.00</span>"#;
        let document = Html::parse_document(html);
        assert_eq!(first_price(&document, &selectors::DESKTOP.price), Some(45.0));
    }

    #[test]
    fn test_image_prefers_old_hires_then_dynamic_json() {
        let html = r#"<img id="landingImage" src="https://m.media-amazon.com/small.jpg"
                           data-old-hires="https://m.media-amazon.com/large.jpg">"#;
        let document = Html::parse_document(html);
        assert_eq!(
            image_url(&document, &selectors::DESKTOP.image).as_deref(),
            Some("https://m.media-amazon.com/large.jpg")
        );

        let html = r#"<img class="a-dynamic-image" src="data:image/gif;base64,R0lG"
                           data-a-dynamic-image='{"https://m.media-amazon.com/dyn.jpg":[500,500]}'>"#;
        let document = Html::parse_document(html);
        assert_eq!(
            image_url(&document, &selectors::DESKTOP.image).as_deref(),
            Some("https://m.media-amazon.com/dyn.jpg")
        );
    }

    #[test]
    fn test_discount_prefers_strike_through() {
        let html = r#"
            <span class="a-price"><span class="a-offscreen">SAR 75.00</span></span>
            <span class="a-text-price"><span class="a-offscreen">SAR 100.00</span></span>
            <span class="savingsPercentage">-10%</span>"#;
        let document = Html::parse_document(html);
        assert_eq!(discount_percent(&document, 75.0), Some(25.0));

        let html = r#"<span class="savingsPercentage">-30%</span>"#;
        let document = Html::parse_document(html);
        assert_eq!(discount_percent(&document, 70.0), Some(30.0));
    }

    #[test]
    fn test_extract_is_deterministic() {
        let fetcher = Arc::new(FakeFetcher::new());
        let extractor = Extractor::new(fetcher);
        let html = product_page("Philips Kettle", 89.0);

        let first = extractor.extract(&html, URL).unwrap();
        let second = extractor.extract(&html, URL).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.name, "Philips Kettle");
        assert_eq!(first.price, 89.0);
    }

    #[test]
    fn test_extract_falls_back_to_embedded_json() {
        let fetcher = Arc::new(FakeFetcher::new());
        let extractor = Extractor::new(fetcher);
        let html = r#"<html><body>
            <script type="application/json">{"unrelated": true}</script>
            <script type="application/json">{"title": "Desk Lamp", "selected": {"price": "SAR 59.90"}, "imageUrl": "https://m.media-amazon.com/lamp.jpg"}</script>
            </body></html>"#;

        let snapshot = extractor.extract(html, URL).unwrap();
        assert_eq!(snapshot.name, "Desk Lamp");
        assert_eq!(snapshot.price, 59.9);
        assert_eq!(
            snapshot.image_url.as_deref(),
            Some("https://m.media-amazon.com/lamp.jpg")
        );
    }

    #[test]
    fn test_extract_reports_exhaustion() {
        let extractor = Extractor::new(Arc::new(FakeFetcher::new()));
        let html = r#"<span id="productTitle">Kettle</span><span class="a-price"><span class="a-offscreen">N/A</span></span>"#;
        assert_eq!(
            extractor.extract(html, URL),
            Err(ExtractError::Exhausted { attempts: 4 })
        );
    }

    #[tokio::test]
    async fn test_fetch_snapshot_downloads_image() {
        let fetcher = Arc::new(FakeFetcher::new());
        fetcher.set_page(
            URL,
            r#"<span id="productTitle">Kettle</span>
               <span class="a-price"><span class="a-offscreen">SAR 20.00</span></span>
               <img id="landingImage" src="https://m.media-amazon.com/k.jpg">"#,
        );
        fetcher.set_image("https://m.media-amazon.com/k.jpg", b"jpeg");

        let extractor = Extractor::new(fetcher.clone());
        let snapshot = extractor.fetch_snapshot(URL).await.unwrap();
        assert_eq!(
            snapshot.image,
            Some(ImageData {
                bytes: b"jpeg".to_vec(),
                content_type: "image/jpeg".into(),
            })
        );
        assert_eq!(fetcher.hits(URL), 1);
    }

    #[tokio::test]
    async fn test_fetch_snapshot_surfaces_fetch_error() {
        let fetcher = Arc::new(FakeFetcher::new());
        fetcher.fail(URL, FetchError::Blocked("status 503".into()));

        let extractor = Extractor::new(fetcher.clone());
        let err = extractor.fetch_snapshot(URL).await.unwrap_err();
        assert_eq!(err.kind(), "blocked");
        // One request per profile; the two desktop strategies share a page.
        assert_eq!(fetcher.hits(URL), 3);
    }
}
