//! Deals discovery bot.
//!
//! Once a day the bot walks the configured deal listings, keeps products
//! whose advertised discount meets the floor, and starts tracking a random
//! handful of them under its own user account.

pub mod listing;

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Local, NaiveDate, NaiveTime, Timelike};
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DealsConfig;
use crate::error::RepositoryError;
use crate::fetcher::Politeness;
use crate::models::{NewProduct, NotificationPolicy, ProductId, RefreshOutcome, User};
use crate::tracker::PriceTracker;
use crate::traits::FetchProfile;
use listing::{Candidate, ListingParser, ListingSelectors, category_search_url};

pub const DISPLAY_NAME_PREFIX: &str = "العروض اليومية: ";
const MAX_DISPLAY_NAME_CHARS: usize = 200;

/// Counters reported at the end of a bot run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DealsSummary {
    pub pages_checked: u64,
    pub candidates: u64,
    pub added: u64,
    pub skipped_existing: u64,
    pub rejected_discount: u64,
    pub errors: u64,
}

pub struct DealsBot {
    tracker: PriceTracker,
    config_path: PathBuf,
    config: RwLock<DealsConfig>,
    last_run: Mutex<Option<NaiveDate>>,
    politeness: Politeness,
    deal_cards: ListingParser,
    search_results: ListingParser,
}

impl DealsBot {
    pub fn new(tracker: PriceTracker, config_path: PathBuf, config: DealsConfig) -> Result<Self> {
        let politeness = tracker.config().politeness;
        Ok(Self {
            tracker,
            config_path,
            config: RwLock::new(config),
            last_run: Mutex::new(None),
            politeness,
            deal_cards: ListingParser::new(&ListingSelectors::deal_cards())?,
            search_results: ListingParser::new(&ListingSelectors::search_results())?,
        })
    }

    #[must_use]
    pub fn with_politeness(mut self, politeness: Politeness) -> Self {
        self.politeness = politeness;
        self
    }

    pub async fn config(&self) -> DealsConfig {
        self.config.read().await.clone()
    }

    /// Re-read the configuration file, keeping the last good one on error.
    pub async fn reload(&self) -> DealsConfig {
        match DealsConfig::load(&self.config_path).await {
            Ok(fresh) => {
                let mut current = self.config.write().await;
                if *current != fresh {
                    info!("Deals configuration reloaded from {}", self.config_path.display());
                    *current = fresh.clone();
                }
                fresh
            }
            Err(e) => {
                warn!("Keeping previous deals configuration: {}", e);
                self.config().await
            }
        }
    }

    /// Called once a minute by the scheduler; runs the bot when it is due.
    pub async fn tick(
        &self,
        now: DateTime<Local>,
        cancel: &CancellationToken,
    ) -> Option<DealsSummary> {
        let config = self.reload().await;
        if !config.enabled {
            return None;
        }
        let scheduled = match config.scheduled_time() {
            Ok(time) => time,
            Err(e) => {
                warn!("Deals bot not scheduled: {}", e);
                return None;
            }
        };

        {
            let mut last_run = self.last_run.lock().await;
            if !is_due(now, scheduled, *last_run) {
                return None;
            }
            *last_run = Some(now.date_naive());
        }

        match self.run(&config, cancel).await {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!("Deals bot run aborted: {}", e);
                None
            }
        }
    }

    /// One full discovery run.
    pub async fn run(
        &self,
        config: &DealsConfig,
        cancel: &CancellationToken,
    ) -> Result<DealsSummary, RepositoryError> {
        let database = self.tracker.database();
        let bot = database
            .ensure_bot_user(&config.bot_username, &config.bot_email)
            .await?;
        let limit = config.max_products;
        let mut summary = DealsSummary::default();

        info!(
            "Deals bot starting: {} listings, up to {} products, min discount {}%",
            config.listing_urls.len(),
            limit,
            config.min_discount
        );

        let mut candidates: Vec<Candidate> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for url in &config.listing_urls {
            if cancel.is_cancelled() {
                break;
            }
            let Some(found) = self
                .scan(url, &self.deal_cards, summary.pages_checked > 0, &mut summary)
                .await
            else {
                continue;
            };

            for candidate in found {
                if candidate.discount.is_none_or(|d| d < config.min_discount) {
                    summary.rejected_discount += 1;
                    continue;
                }
                if seen.insert(candidate.url.clone()) {
                    candidates.push(candidate);
                }
            }
        }

        if candidates.len() < limit.saturating_mul(2) {
            debug!(
                "Only {} deal candidates, supplementing from category search",
                candidates.len()
            );
            for keyword in &config.categories {
                if cancel.is_cancelled() || candidates.len() >= limit.saturating_mul(2) {
                    break;
                }
                let url = category_search_url(keyword);
                let Some(found) = self
                    .scan(&url, &self.search_results, summary.pages_checked > 0, &mut summary)
                    .await
                else {
                    continue;
                };
                for candidate in found {
                    if seen.insert(candidate.url.clone()) {
                        candidates.push(candidate);
                    }
                }
            }
        }

        summary.candidates = candidates.len() as u64;
        candidates.shuffle(&mut rand::thread_rng());

        for candidate in candidates {
            if cancel.is_cancelled() || summary.added as usize >= limit {
                break;
            }
            if database
                .find_product_by_owner_and_url(bot.id, &candidate.url)
                .await?
                .is_some()
            {
                summary.skipped_existing += 1;
                continue;
            }

            self.politeness.pause().await;
            match self.adopt(&bot, &candidate, config.min_discount).await {
                Ok(Adoption::Added(id)) => {
                    summary.added += 1;
                    debug!("Deals bot added product {} ({})", id, candidate.url);
                }
                Ok(Adoption::Existing) => summary.skipped_existing += 1,
                Ok(Adoption::LowDiscount) => summary.rejected_discount += 1,
                Ok(Adoption::Failed) => summary.errors += 1,
                Err(e) => {
                    summary.errors += 1;
                    warn!(error_kind = "repository", "Deals bot could not add {}: {}", candidate.url, e);
                }
            }
        }

        info!(
            pages_checked = summary.pages_checked,
            candidates = summary.candidates,
            added = summary.added,
            skipped_existing = summary.skipped_existing,
            rejected_discount = summary.rejected_discount,
            errors = summary.errors,
            "Deals bot finished"
        );
        Ok(summary)
    }

    async fn scan(
        &self,
        url: &str,
        parser: &ListingParser,
        pause: bool,
        summary: &mut DealsSummary,
    ) -> Option<Vec<Candidate>> {
        if pause {
            self.politeness.pause().await;
        }
        summary.pages_checked += 1;

        match self.tracker.fetch_page(url, FetchProfile::Desktop).await {
            Ok(page) => {
                let found = parser.parse(&page.html());
                debug!("Found {} candidates on {}", found.len(), url);
                Some(found)
            }
            Err(e) => {
                summary.errors += 1;
                warn!(error_kind = e.kind(), "Deals listing {} failed: {}", url, e);
                None
            }
        }
    }

    /// Create the bot-owned product, refresh it, and keep it only if it checks out.
    async fn adopt(
        &self,
        bot: &User,
        candidate: &Candidate,
        min_discount: f64,
    ) -> Result<Adoption, RepositoryError> {
        let database = self.tracker.database();
        let product = match database
            .create_product(&NewProduct {
                owner_id: bot.id,
                url: candidate.url.clone(),
                display_name: None,
                target_price: None,
                policy: NotificationPolicy {
                    enabled: true,
                    notify_on_any_change: true,
                },
            })
            .await
        {
            Ok(product) => product,
            Err(RepositoryError::Conflict(_)) => return Ok(Adoption::Existing),
            Err(e) => return Err(e),
        };

        let outcome = match self.tracker.refresh_one(product.id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                database.delete_product(product.id).await?;
                return Err(e);
            }
        };

        match outcome {
            RefreshOutcome::Failed { reason, .. } => {
                debug!("Dropping {}: first refresh failed: {}", candidate.url, reason);
                database.delete_product(product.id).await?;
                Ok(Adoption::Failed)
            }
            RefreshOutcome::Updated {
                discount_percent, ..
            } => {
                let verified = candidate.discount.is_some()
                    || discount_percent.is_some_and(|d| d >= min_discount);
                if !verified {
                    debug!(
                        "Dropping {}: page discount {:?} below {}%",
                        candidate.url, discount_percent, min_discount
                    );
                    database.delete_product(product.id).await?;
                    return Ok(Adoption::LowDiscount);
                }

                let refreshed = database.get_product(product.id).await?;
                database
                    .set_display_name(product.id, Some(&bot_display_name(&refreshed.name)))
                    .await?;
                Ok(Adoption::Added(product.id))
            }
        }
    }
}

enum Adoption {
    Added(ProductId),
    Existing,
    LowDiscount,
    Failed,
}

/// Whether the daily run should start at `now`.
pub fn is_due(now: DateTime<Local>, scheduled: NaiveTime, last_run: Option<NaiveDate>) -> bool {
    now.hour() == scheduled.hour()
        && now.minute() == scheduled.minute()
        && last_run != Some(now.date_naive())
}

/// Display name given to bot-owned products, at most 200 characters.
pub fn bot_display_name(name: &str) -> String {
    let full = format!("{DISPLAY_NAME_PREFIX}{name}");
    if full.chars().count() <= MAX_DISPLAY_NAME_CHARS {
        return full;
    }
    let mut truncated: String = full.chars().take(MAX_DISPLAY_NAME_CHARS - 3).collect();
    truncated.push_str("...");
    truncated
}
