//! # Price Notifications
//!
//! This module turns a price transition into notification records for the
//! product owner. It performs no I/O: the tracker persists the records in the
//! same transaction as the price update, and delivering them (email, push,
//! web inbox) is left to whichever consumer reads the `notifications` table.
//!
//! ## Event Rules
//!
//! Given the previous price, the new price, the optional target price and the
//! product's [`NotificationPolicy`](crate::models::NotificationPolicy):
//!
//! | Transition                           | Event                          |
//! |--------------------------------------|--------------------------------|
//! | no previous price                    | none (first observation)       |
//! | `new < old`                          | `PriceDrop`                    |
//! | `new > old` and `notify_on_any_change` | `PriceIncrease`              |
//! | `old > target >= new`                | `TargetReached`                |
//! | `new == old`                         | none                           |
//!
//! Prices are compared at cent precision, so float noise never produces an
//! event. `TargetReached` fires on the downward crossing only; a price that
//! keeps falling below the target yields further `PriceDrop` events but no
//! second `TargetReached`.
//!
//! ## Message Format
//!
//! Messages are rendered in the owner's [`Language`]:
//! - **Arabic** (default): amounts in "ريال"
//! - **English**: amounts in "SAR"
//!
//! Every message carries the product label (display name if set, canonical
//! name otherwise) and both prices with two decimals. Drop and increase
//! messages add the absolute difference and the percentage change; target
//! messages add the target price.

use crate::models::{Language, NewNotification, NotificationKind, Product};

/// Derives the events for one price transition.
///
/// ## Parameters
///
/// - `old`: Price stored before the refresh, `None` if never fetched
/// - `new`: Price observed by the refresh
/// - `target`: Optional target price of the product
/// - `notify_on_any_change`: Whether increases are reported too
///
/// ## Return Value
///
/// Events in a stable order: `PriceDrop` or `PriceIncrease` first, then
/// `TargetReached`. An empty vector means nothing is persisted.
///
/// ## Example
///
/// ```rust
/// use price_tracker::models::NotificationKind;
/// use price_tracker::notifier::derive_events;
///
/// let events = derive_events(Some(100.0), 75.0, Some(80.0), false);
/// assert_eq!(
///     events,
///     vec![NotificationKind::PriceDrop, NotificationKind::TargetReached]
/// );
/// ```
pub fn derive_events(
    old: Option<f64>,
    new: f64,
    target: Option<f64>,
    notify_on_any_change: bool,
) -> Vec<NotificationKind> {
    let Some(old) = old else {
        return Vec::new();
    };

    let (old_cents, new_cents) = (cents(old), cents(new));
    let mut events = Vec::new();

    if new_cents < old_cents {
        events.push(NotificationKind::PriceDrop);
    } else if new_cents > old_cents && notify_on_any_change {
        events.push(NotificationKind::PriceIncrease);
    }

    if let Some(target) = target {
        let target_cents = cents(target);
        if old_cents > target_cents && new_cents <= target_cents {
            events.push(NotificationKind::TargetReached);
        }
    }

    events
}

/// Builds one notification record per event, addressed to the product owner.
///
/// ## Parameters
///
/// - `product`: The product as it was before the refresh (for label, owner, target)
/// - `language`: The owner's language preference
/// - `events`: Output of [`derive_events`]
/// - `old` / `new`: The transition being reported
pub fn build_notifications(
    product: &Product,
    language: Language,
    events: &[NotificationKind],
    old: Option<f64>,
    new: f64,
) -> Vec<NewNotification> {
    let old = old.unwrap_or(new);

    events
        .iter()
        .map(|&kind| NewNotification {
            user_id: product.owner_id,
            product_id: Some(product.id),
            kind,
            message: render_message(
                kind,
                language,
                product.label(),
                old,
                new,
                product.target_price,
            ),
        })
        .collect()
}

/// Renders the human-readable text of a single notification.
///
/// `SystemInfo` has no price template; it renders the label and new price.
pub fn render_message(
    kind: NotificationKind,
    language: Language,
    label: &str,
    old: f64,
    new: f64,
    target: Option<f64>,
) -> String {
    let diff = (new - old).abs();
    let pct = if old > 0.0 { diff / old * 100.0 } else { 0.0 };
    let target = target.unwrap_or(new);

    match (language, kind) {
        (Language::Arabic, NotificationKind::PriceDrop) => format!(
            "انخفض سعر {label} من {old:.2} ريال إلى {new:.2} ريال (-{diff:.2} ريال، -{pct:.1}%)"
        ),
        (Language::Arabic, NotificationKind::PriceIncrease) => format!(
            "ارتفع سعر {label} من {old:.2} ريال إلى {new:.2} ريال (+{diff:.2} ريال، +{pct:.1}%)"
        ),
        (Language::Arabic, NotificationKind::TargetReached) => format!(
            "وصل سعر {label} إلى السعر المستهدف {target:.2} ريال: السعر الحالي {new:.2} ريال (كان {old:.2} ريال)"
        ),
        (Language::Arabic, NotificationKind::SystemInfo) => {
            format!("{label}: {new:.2} ريال")
        }
        (Language::English, NotificationKind::PriceDrop) => format!(
            "Price of {label} dropped from {old:.2} SAR to {new:.2} SAR (-{diff:.2} SAR, -{pct:.1}%)"
        ),
        (Language::English, NotificationKind::PriceIncrease) => format!(
            "Price of {label} rose from {old:.2} SAR to {new:.2} SAR (+{diff:.2} SAR, +{pct:.1}%)"
        ),
        (Language::English, NotificationKind::TargetReached) => format!(
            "{label} reached your target price of {target:.2} SAR: now {new:.2} SAR (was {old:.2} SAR)"
        ),
        (Language::English, NotificationKind::SystemInfo) => format!("{label}: {new:.2} SAR"),
    }
}

/// Whether two prices are equal at cent precision.
pub fn same_price(a: f64, b: f64) -> bool {
    cents(a) == cents(b)
}

#[allow(clippy::cast_possible_truncation)]
fn cents(price: f64) -> i64 {
    (price * 100.0).round() as i64
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::models::NotificationPolicy;
    use crate::models::NotificationKind::{PriceDrop, PriceIncrease, TargetReached};

    fn product(display_name: Option<&str>, target: Option<f64>) -> Product {
        Product {
            id: 7,
            owner_id: 3,
            url: "https://www.amazon.sa/dp/B0TEST0001".into(),
            name: "Philips Kettle".into(),
            display_name: display_name.map(str::to_string),
            current_price: Some(100.0),
            target_price: target,
            policy: NotificationPolicy::default(),
            last_checked: None,
            image_url: None,
            image_bytes: None,
            image_content_type: None,
            image_checksum: None,
            revision: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_first_observation_is_silent() {
        assert!(derive_events(None, 90.0, Some(95.0), true).is_empty());
    }

    #[test]
    fn test_drop_and_increase_rules() {
        assert_eq!(derive_events(Some(100.0), 90.0, Some(80.0), false), vec![PriceDrop]);
        assert!(derive_events(Some(50.0), 55.0, None, false).is_empty());
        assert_eq!(derive_events(Some(50.0), 55.0, None, true), vec![PriceIncrease]);
        assert!(derive_events(Some(50.0), 50.0, None, true).is_empty());
        assert!(derive_events(Some(0.1 + 0.2), 0.3, None, true).is_empty());
    }

    #[test]
    fn test_target_fires_on_downward_crossing_only() {
        assert_eq!(
            derive_events(Some(100.0), 75.0, Some(80.0), false),
            vec![PriceDrop, TargetReached]
        );
        // Already below target.
        assert_eq!(derive_events(Some(75.0), 70.0, Some(80.0), false), vec![PriceDrop]);
        // Inclusive boundary.
        assert_eq!(
            derive_events(Some(100.0), 80.0, Some(80.0), false),
            vec![PriceDrop, TargetReached]
        );
        // Rising back above target.
        assert!(derive_events(Some(70.0), 85.0, Some(80.0), false).is_empty());
    }

    #[test]
    fn test_messages_use_label_and_language() {
        let product = product(Some("My kettle"), Some(80.0));
        let notes = build_notifications(
            &product,
            Language::English,
            &[PriceDrop, TargetReached],
            Some(100.0),
            75.0,
        );

        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].user_id, 3);
        assert_eq!(notes[0].product_id, Some(7));
        assert_eq!(
            notes[0].message,
            "Price of My kettle dropped from 100.00 SAR to 75.00 SAR (-25.00 SAR, -25.0%)"
        );
        assert!(notes[1].message.contains("target price of 80.00 SAR"));

        let arabic = render_message(PriceDrop, Language::Arabic, "غلاية", 100.0, 90.0, None);
        assert!(arabic.contains("غلاية"));
        assert!(arabic.contains("100.00 ريال"));
        assert!(arabic.contains("90.00 ريال"));
        assert!(arabic.contains("-10.0%"));
    }
}
