//! CSS selectors for marketplace product pages.
//!
//! Lists are ordered by preference; the first selector that yields a usable
//! value wins. Update these when the page markup changes.

use std::sync::LazyLock;

use scraper::Selector;

/// Selector lists for one page shape
pub struct ProductSelectors {
    pub title: Vec<Selector>,
    pub price: Vec<Selector>,
    pub image: Vec<Selector>,
}

fn compile(selectors: &[&str]) -> Vec<Selector> {
    selectors
        .iter()
        .map(|s| Selector::parse(s).unwrap())
        .collect()
}

pub static DESKTOP: LazyLock<ProductSelectors> = LazyLock::new(|| ProductSelectors {
    title: compile(&["#productTitle", "h1#title"]),
    price: compile(&[
        ".a-price .a-offscreen",
        "#priceblock_ourprice",
        "#priceblock_dealprice",
        "#price_inside_buybox",
        "#corePrice_feature_div .a-price .a-offscreen",
        "span[data-a-color='price'] .a-offscreen",
    ]),
    image: compile(&["#landingImage", "#imgBlkFront", "img.a-dynamic-image"]),
});

pub static MOBILE: LazyLock<ProductSelectors> = LazyLock::new(|| ProductSelectors {
    title: compile(&["#productTitle", "#title", "h1#title"]),
    price: compile(&[
        ".a-price .a-offscreen",
        ".a-button-selected .a-color-price",
        "#price_inside_buybox",
        "#corePrice_feature_div .a-offscreen",
    ]),
    image: compile(&[
        "img#main-image",
        "img.a-dynamic-image",
        "#landingImage",
        "#imgBlkFront",
    ]),
});

/// Baseline pass: canonical nodes only.
pub static BASELINE: LazyLock<ProductSelectors> = LazyLock::new(|| ProductSelectors {
    title: compile(&["#productTitle"]),
    price: compile(&[
        ".a-price .a-offscreen",
        "#priceblock_ourprice",
        "#price_inside_buybox",
    ]),
    image: compile(&["#landingImage"]),
});

/// Previous ("was") price shown struck through next to the current one.
pub static STRIKE_PRICE: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(".a-text-price .a-offscreen, .a-text-strike, .basisPrice .a-offscreen").unwrap()
});

/// "Save X%" style badges.
pub static SAVINGS: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(".savingsPercentage, .a-price-savings, #regularprice_savings, .a-color-price")
        .unwrap()
});

pub static JSON_SCRIPTS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("script[type='application/json']").unwrap());
