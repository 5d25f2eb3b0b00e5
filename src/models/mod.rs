//! Data models for users, tracked products, price history and notifications

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ExtractError;
use crate::notifier::same_price;

pub type UserId = i64;
pub type ProductId = i64;

/// Language preference of a user. Only affects notification wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Language {
    #[default]
    Arabic,
    English,
}

impl Language {
    pub fn from_code(code: &str) -> Self {
        match code.trim().to_ascii_lowercase().as_str() {
            "en" => Self::English,
            _ => Self::Arabic,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::Arabic => "ar",
            Self::English => "en",
        }
    }
}

/// An account that owns tracked products
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub handle: String,
    pub email: String,
    pub language: Language,
    pub is_bot: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub handle: String,
    pub email: String,
    pub language: Language,
    pub is_bot: bool,
}

/// Whether a product is refreshed by the scheduled pass and which price
/// movements are reported to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPolicy {
    pub enabled: bool,
    pub notify_on_any_change: bool,
}

impl Default for NotificationPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            notify_on_any_change: false,
        }
    }
}

/// A tracked marketplace product
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub owner_id: UserId,
    pub url: String,
    /// Canonical name as last extracted from the page.
    pub name: String,
    /// User override shown instead of `name`.
    pub display_name: Option<String>,
    /// `None` until the first successful fetch.
    pub current_price: Option<f64>,
    pub target_price: Option<f64>,
    pub policy: NotificationPolicy,
    pub last_checked: Option<DateTime<Utc>>,
    pub image_url: Option<String>,
    #[serde(skip)]
    pub image_bytes: Option<Vec<u8>>,
    pub image_content_type: Option<String>,
    pub image_checksum: Option<String>,
    /// Bumped on every persisted refresh; used to detect concurrent writers.
    pub revision: i64,
    pub created_at: DateTime<Utc>,
}

impl Product {
    /// Name to show to the owner: the override if present, else the canonical name.
    pub fn label(&self) -> &str {
        match self.display_name.as_deref() {
            Some(custom) if !custom.trim().is_empty() => custom,
            _ => &self.name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewProduct {
    pub owner_id: UserId,
    pub url: String,
    pub display_name: Option<String>,
    pub target_price: Option<f64>,
    pub policy: NotificationPolicy,
}

/// One entry of a product's price history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub product_id: ProductId,
    pub price: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    PriceDrop,
    PriceIncrease,
    TargetReached,
    SystemInfo,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PriceDrop => "price_drop",
            Self::PriceIncrease => "price_increase",
            Self::TargetReached => "target_reached",
            Self::SystemInfo => "system_info",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "price_drop" => Some(Self::PriceDrop),
            "price_increase" => Some(Self::PriceIncrease),
            "target_reached" => Some(Self::TargetReached),
            "system_info" => Some(Self::SystemInfo),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub user_id: UserId,
    pub product_id: Option<ProductId>,
    pub kind: NotificationKind,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

/// A notification record waiting to be inserted
#[derive(Debug, Clone, PartialEq)]
pub struct NewNotification {
    pub user_id: UserId,
    pub product_id: Option<ProductId>,
    pub kind: NotificationKind,
    pub message: String,
}

/// Downloaded image bytes with their content type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl ImageData {
    pub fn checksum(&self) -> String {
        format!("{:x}", md5::compute(&self.bytes))
    }
}

/// A structured observation of a product page
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub name: String,
    pub price: f64,
    pub image_url: Option<String>,
    pub image: Option<ImageData>,
    pub discount_percent: Option<f64>,
}

impl Snapshot {
    /// Build a snapshot, enforcing a non-empty name and a finite positive price.
    pub fn validated(
        name: Option<String>,
        price: Option<f64>,
        image_url: Option<String>,
    ) -> Result<Self, ExtractError> {
        let name = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .ok_or(ExtractError::MissingName)?;
        let price = price
            .filter(|p| p.is_finite() && *p > 0.0)
            .ok_or(ExtractError::MissingPrice)?;

        Ok(Self {
            name,
            price,
            image_url,
            image: None,
            discount_percent: None,
        })
    }
}

/// Result of one refresh, shared by the scheduled and interactive paths.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    Updated {
        product_id: ProductId,
        old_price: Option<f64>,
        new_price: f64,
        discount_percent: Option<f64>,
        events: Vec<NotificationKind>,
    },
    Failed {
        product_id: ProductId,
        kind: &'static str,
        reason: String,
    },
}

impl RefreshOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Updated { .. })
    }
}

/// Counters reported at the end of a scheduled refresh pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub checked: u64,
    pub skipped: u64,
    pub dropped: u64,
    pub increased: u64,
    pub target_reached: u64,
    pub errors: u64,
}

impl RunSummary {
    pub fn record(&mut self, outcome: &RefreshOutcome) {
        self.checked += 1;
        match outcome {
            RefreshOutcome::Updated {
                old_price: Some(old),
                new_price,
                events,
                ..
            } => {
                if !same_price(*old, *new_price) {
                    if new_price < old {
                        self.dropped += 1;
                    } else {
                        self.increased += 1;
                    }
                }
                if events.contains(&NotificationKind::TargetReached) {
                    self.target_reached += 1;
                }
            }
            RefreshOutcome::Updated { .. } => {}
            RefreshOutcome::Failed { .. } => self.errors += 1,
        }
    }

    pub fn merge(&mut self, other: &Self) {
        self.checked += other.checked;
        self.skipped += other.skipped;
        self.dropped += other.dropped;
        self.increased += other.increased;
        self.target_reached += other.target_reached;
        self.errors += other.errors;
    }
}
