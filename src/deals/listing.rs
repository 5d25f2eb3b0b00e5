//! Deal listing and category search page parsing

use anyhow::Result;
use scraper::{Html, Selector};

use crate::extractor::{element_text, percent_in};
use crate::fetcher::links::{canonical_product_url, extract_asin};

/// Deal filter applied to category keyword searches.
const DEAL_FILTER: &str = "p_n_deal_type%3A26931847031";

/// CSS selectors for one kind of listing page
#[derive(Debug, Clone)]
pub struct ListingSelectors {
    pub card: String,
    /// `None` when the page carries no per-card discount.
    pub discount: Option<String>,
    pub link: String,
}

impl ListingSelectors {
    /// Deal carousels and "today's deals" grids.
    pub fn deal_cards() -> Self {
        Self {
            card: ".a-carousel-card, .octopus-dlp-asin-card, .dealCard, .dealContainer, \
                   .a-list-item, .s-result-item, div.sg-col-inner"
                .to_string(),
            discount: Some(
                "span.a-color-secondary span.a-text-bold, .dealPriceText .savingsPercentage, \
                 .a-price-savings, .savingsPercentage, span.a-text-bold, .a-badge-text"
                    .to_string(),
            ),
            link: "a.a-link-normal, .a-size-base a, h2 a, a.a-text-normal, h3 a, a".to_string(),
        }
    }

    /// Category keyword search results.
    pub fn search_results() -> Self {
        Self {
            card: ".s-result-item".to_string(),
            discount: None,
            link: "h2 a, .a-link-normal".to_string(),
        }
    }
}

/// A product link found on a listing page
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Canonical `/dp/<ASIN>` URL.
    pub url: String,
    pub discount: Option<f64>,
}

pub struct ListingParser {
    card: Selector,
    discount: Option<Selector>,
    link: Selector,
}

impl ListingParser {
    pub fn new(selectors: &ListingSelectors) -> Result<Self> {
        let card = Selector::parse(&selectors.card)
            .map_err(|e| anyhow::anyhow!("Failed to parse card selector: {:?}", e))?;
        let discount = selectors
            .discount
            .as_ref()
            .map(|s| Selector::parse(s))
            .transpose()
            .map_err(|e| anyhow::anyhow!("Failed to parse discount selector: {:?}", e))?;
        let link = Selector::parse(&selectors.link)
            .map_err(|e| anyhow::anyhow!("Failed to parse link selector: {:?}", e))?;

        Ok(Self {
            card,
            discount,
            link,
        })
    }

    /// Every card on the page that links to a product, deduplicated by URL.
    ///
    /// A card's discount is the first percentage found in its discount nodes.
    pub fn parse(&self, html: &str) -> Vec<Candidate> {
        let document = Html::parse_document(html);
        let mut candidates: Vec<Candidate> = Vec::new();

        for card in document.select(&self.card) {
            let Some(asin) = card
                .select(&self.link)
                .filter_map(|link| link.value().attr("href"))
                .find_map(extract_asin)
            else {
                continue;
            };
            let url = canonical_product_url(&asin);

            let discount = self.discount.as_ref().and_then(|selector| {
                card.select(selector)
                    .find_map(|node| percent_in(&element_text(node)))
            });

            // Nested containers repeat the same product; keep the best reading.
            match candidates.iter_mut().find(|c| c.url == url) {
                Some(existing) => {
                    if existing.discount.is_none() {
                        existing.discount = discount;
                    }
                }
                None => candidates.push(Candidate { url, discount }),
            }
        }

        candidates
    }
}

pub fn category_search_url(keyword: &str) -> String {
    format!(
        "https://www.amazon.sa/s?k={}&rh={DEAL_FILTER}",
        urlencoding::encode(keyword.trim())
    )
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// A deals grid with one card per `(asin, badge)` pair.
    pub fn deals_page(cards: &[(&str, &str)]) -> String {
        let body: String = cards
            .iter()
            .map(|(asin, badge)| {
                format!(
                    r#"<div class="dealCard">
                         <a class="a-link-normal" href="/-/en/Some-Item/dp/{asin}?ref_=deals_1">Item</a>
                         <div class="dealPriceText"><span class="savingsPercentage">{badge}</span></div>
                       </div>"#
                )
            })
            .collect();
        format!("<html><body>{body}</body></html>")
    }

    pub fn search_page(asins: &[&str]) -> String {
        let body: String = asins
            .iter()
            .map(|asin| {
                format!(
                    r#"<div class="s-result-item"><h2><a href="/Thing/dp/{asin}/ref=sr_1_1">Thing</a></h2></div>"#
                )
            })
            .collect();
        format!("<html><body>{body}</body></html>")
    }
}
