//! The extraction strategy chain

use scraper::Html;
use serde_json::Value;

use super::selectors::{self, ProductSelectors};
use super::{discount_percent, first_price, first_text, image_url, parse_price};
use crate::error::ExtractError;
use crate::models::Snapshot;
use crate::traits::{ExtractStrategy, FetchProfile};

/// Default order: delayed session, mobile, simple desktop, embedded JSON.
pub fn default_chain() -> Vec<Box<dyn ExtractStrategy>> {
    vec![
        Box::new(SelectorStrategy::delayed_session()),
        Box::new(SelectorStrategy::mobile()),
        Box::new(SelectorStrategy::simple_desktop()),
        Box::new(EmbeddedJsonStrategy),
    ]
}

/// CSS-selector based strategy
pub struct SelectorStrategy {
    name: &'static str,
    profile: FetchProfile,
    selectors: &'static ProductSelectors,
}

impl SelectorStrategy {
    pub fn delayed_session() -> Self {
        Self {
            name: "delayed-session",
            profile: FetchProfile::DelayedSession,
            selectors: &selectors::DESKTOP,
        }
    }

    pub fn mobile() -> Self {
        Self {
            name: "mobile",
            profile: FetchProfile::Mobile,
            selectors: &selectors::MOBILE,
        }
    }

    pub fn simple_desktop() -> Self {
        Self {
            name: "simple-desktop",
            profile: FetchProfile::Desktop,
            selectors: &selectors::BASELINE,
        }
    }
}

impl ExtractStrategy for SelectorStrategy {
    fn name(&self) -> &'static str {
        self.name
    }

    fn profile(&self) -> FetchProfile {
        self.profile
    }

    fn extract(&self, html: &str, _url: &str) -> Result<Snapshot, ExtractError> {
        let document = Html::parse_document(html);

        let name = first_text(&document, &self.selectors.title);
        let price = first_price(&document, &self.selectors.price);
        let image = image_url(&document, &self.selectors.image);

        let mut snapshot = Snapshot::validated(name, price, image)?;
        snapshot.discount_percent = discount_percent(&document, snapshot.price);
        Ok(snapshot)
    }
}

/// Reads `<script type="application/json">` blobs when the visible markup
/// carries no usable price.
pub struct EmbeddedJsonStrategy;

impl ExtractStrategy for EmbeddedJsonStrategy {
    fn name(&self) -> &'static str {
        "embedded-json"
    }

    fn profile(&self) -> FetchProfile {
        FetchProfile::Desktop
    }

    fn extract(&self, html: &str, _url: &str) -> Result<Snapshot, ExtractError> {
        let document = Html::parse_document(html);
        let fallback_name = first_text(&document, &selectors::DESKTOP.title);
        let mut last_error = ExtractError::MissingPrice;

        for script in document.select(&selectors::JSON_SCRIPTS) {
            let raw = script.text().collect::<String>();
            let Ok(Value::Object(blob)) = serde_json::from_str::<Value>(&raw) else {
                continue;
            };

            let price = blob.get("price").and_then(json_price).or_else(|| {
                blob.get("selected")
                    .and_then(|selected| selected.get("price"))
                    .and_then(json_price)
            });
            if price.is_none() {
                continue;
            }

            let name = blob
                .get("title")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| fallback_name.clone());
            let image = ["image", "imageUrl"]
                .iter()
                .find_map(|key| blob.get(*key).and_then(Value::as_str))
                .map(str::to_string);

            match Snapshot::validated(name, price, image) {
                Ok(mut snapshot) => {
                    snapshot.discount_percent = discount_percent(&document, snapshot.price);
                    return Ok(snapshot);
                }
                Err(e) => last_error = e,
            }
        }

        Err(last_error)
    }
}

fn json_price(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|p| p.is_finite() && *p > 0.0),
        Value::String(s) => parse_price(s),
        _ => None,
    }
}
