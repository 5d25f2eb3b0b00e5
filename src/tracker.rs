use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::database::{Database, RefreshPatch};
use crate::error::{FetchError, InputError, RepositoryError, TrackError};
use crate::extractor::Extractor;
use crate::fetcher::{Politeness, resolve_product_url};
use crate::models::{
    NewProduct, NotificationPolicy, PricePoint, Product, ProductId, RefreshOutcome, RunSummary,
    UserId,
};
use crate::notifier::{build_notifications, derive_events, same_price};
use crate::traits::{FetchProfile, Page, PageFetcher};

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Parallel refreshes, and the cap on in-flight marketplace requests.
    pub workers: usize,
    /// Products checked more recently than this are left out of a pass.
    pub skip_threshold: chrono::Duration,
    /// Subtracted from `skip_threshold`, so a product refreshed late in the
    /// previous pass is still due when the next one starts.
    pub skip_slack: chrono::Duration,
    pub politeness: Politeness,
    /// Time in-flight refreshes get after cancellation before being aborted.
    pub shutdown_grace: Duration,
    pub image_backfill_limit: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            skip_threshold: chrono::Duration::hours(6),
            skip_slack: chrono::Duration::minutes(36),
            politeness: Politeness::default(),
            shutdown_grace: Duration::from_secs(30),
            image_backfill_limit: 20,
        }
    }
}

/// What a user supplies alongside the URL when starting to track a product.
#[derive(Debug, Clone, Default)]
pub struct TrackRequest {
    pub display_name: Option<String>,
    pub target_price: Option<f64>,
    pub notify_on_any_change: bool,
}

/// One async mutex per product id, so refreshes of a product never overlap.
#[derive(Clone, Default)]
struct ProductLocks {
    inner: Arc<Mutex<HashMap<ProductId, Arc<Mutex<()>>>>>,
}

impl ProductLocks {
    async fn acquire(&self, id: ProductId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.lock().await;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Refreshes tracked products, on a schedule or on demand.
///
/// The scheduled pass and interactive callers share [`PriceTracker::refresh_one`].
#[derive(Clone)]
pub struct PriceTracker {
    extractor: Arc<Extractor>,
    database: Database,
    config: TrackerConfig,
    locks: ProductLocks,
    in_flight: Arc<Semaphore>,
}

impl PriceTracker {
    pub fn new(fetcher: Arc<dyn PageFetcher>, database: Database, config: TrackerConfig) -> Self {
        Self::with_extractor(Extractor::new(fetcher), database, config)
    }

    pub fn with_extractor(extractor: Extractor, database: Database, config: TrackerConfig) -> Self {
        let permits = config.workers.max(1);
        Self {
            extractor: Arc::new(extractor),
            database,
            config,
            locks: ProductLocks::default(),
            in_flight: Arc::new(Semaphore::new(permits)),
        }
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn fetcher(&self) -> &Arc<dyn PageFetcher> {
        self.extractor.fetcher()
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Fetch an arbitrary marketplace page under the shared in-flight cap.
    pub async fn fetch_page(&self, url: &str, profile: FetchProfile) -> Result<Page, FetchError> {
        let _permit = self.in_flight.acquire().await.ok();
        self.fetcher().get(url, profile).await
    }

    /// Refresh a single product and persist the result.
    ///
    /// Fetch and extraction failures are reported as [`RefreshOutcome::Failed`]
    /// after advancing `last_checked`; only repository failures are errors.
    pub async fn refresh_one(&self, id: ProductId) -> Result<RefreshOutcome, RepositoryError> {
        let _guard = self.locks.acquire(id).await;
        let product = self.database.get_product(id).await?;

        let scraped = {
            let _permit = self.in_flight.acquire().await.ok();
            self.extractor.fetch_snapshot(&product.url).await
        };

        let now = Utc::now();
        let checked_at = match product.last_checked {
            Some(previous) if previous > now => previous,
            _ => now,
        };

        let snapshot = match scraped {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.database
                    .persist_refresh(&RefreshPatch::checked_only(&product, checked_at), None, &[])
                    .await?;
                warn!(
                    product_id = id,
                    error_kind = err.kind(),
                    "Refresh of product {} failed: {}",
                    id,
                    err
                );
                return Ok(RefreshOutcome::Failed {
                    product_id: id,
                    kind: err.kind(),
                    reason: err.to_string(),
                });
            }
        };

        let old_price = product.current_price;
        let new_price = snapshot.price;

        let changed = old_price.is_none_or(|old| !same_price(old, new_price));
        let record_point = changed || self.database.count_history(id).await? == 0;
        let point = record_point.then(|| PricePoint {
            product_id: id,
            price: new_price,
            recorded_at: checked_at,
        });

        let image_moved = snapshot.image_url.is_some() && snapshot.image_url != product.image_url;
        let image = snapshot.image.filter(|image| {
            image_moved || product.image_checksum.as_deref() != Some(image.checksum().as_str())
        });

        let events = derive_events(
            old_price,
            new_price,
            product.target_price,
            product.policy.notify_on_any_change,
        );
        let notifications = if events.is_empty() {
            Vec::new()
        } else {
            let owner = self.database.get_user(product.owner_id).await?;
            build_notifications(&product, owner.language, &events, old_price, new_price)
        };

        let patch = RefreshPatch {
            name: Some(snapshot.name),
            current_price: point.as_ref().map(|p| p.price),
            image_url: snapshot.image_url,
            image,
            ..RefreshPatch::checked_only(&product, checked_at)
        };
        self.database
            .persist_refresh(&patch, point.as_ref(), &notifications)
            .await?;

        info!(
            product_id = id,
            old_price = ?old_price,
            new_price,
            "Refreshed product {}: {:?} -> {:.2}",
            id,
            old_price,
            new_price
        );

        Ok(RefreshOutcome::Updated {
            product_id: id,
            old_price,
            new_price,
            discount_percent: snapshot.discount_percent,
            events,
        })
    }

    /// Refresh every enabled product not checked within the skip threshold.
    ///
    /// Cancelling `cancel` stops dispatch; refreshes already running get the
    /// configured grace period before they are aborted.
    pub async fn refresh_all(&self, cancel: &CancellationToken) -> Result<RunSummary, RepositoryError> {
        let started = Instant::now();
        let window = (self.config.skip_threshold - self.config.skip_slack)
            .max(chrono::Duration::zero());
        let older_than = Utc::now() - window;
        let due = self.database.list_trackable_products(older_than).await?;
        let skipped = self.database.count_recently_checked(older_than).await?;

        info!(
            due = due.len(),
            skipped,
            "Starting refresh pass over {} products ({} skipped)",
            due.len(),
            skipped
        );

        let worker_count = self.config.workers.max(1).min(due.len());
        let queue: Arc<Mutex<VecDeque<ProductId>>> =
            Arc::new(Mutex::new(due.iter().map(|p| p.id).collect()));

        let mut workers = JoinSet::new();
        for worker in 0..worker_count {
            let tracker = self.clone();
            let queue = queue.clone();
            let cancel = cancel.clone();
            workers.spawn(async move { tracker.drain(worker, queue, cancel).await });
        }

        let mut summary = RunSummary {
            skipped,
            ..RunSummary::default()
        };
        let mut deadline: Option<Instant> = None;
        let mut aborted = false;

        loop {
            tokio::select! {
                joined = workers.join_next() => match joined {
                    Some(Ok(partial)) => summary.merge(&partial),
                    Some(Err(e)) if e.is_cancelled() => {}
                    Some(Err(e)) => error!("Refresh worker panicked: {}", e),
                    None => break,
                },
                () = cancel.cancelled(), if deadline.is_none() => {
                    info!(
                        "Refresh pass cancelled, waiting up to {:?} for in-flight products",
                        self.config.shutdown_grace
                    );
                    deadline = Some(Instant::now() + self.config.shutdown_grace);
                }
                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() && !aborted => {
                    warn!("Abandoning {} refresh workers after grace period", workers.len());
                    workers.abort_all();
                    aborted = true;
                }
            }
        }

        info!(
            checked = summary.checked,
            skipped = summary.skipped,
            dropped = summary.dropped,
            increased = summary.increased,
            target_reached = summary.target_reached,
            errors = summary.errors,
            "Refresh pass finished in {:.1}s",
            started.elapsed().as_secs_f64()
        );
        Ok(summary)
    }

    async fn drain(
        self,
        worker: usize,
        queue: Arc<Mutex<VecDeque<ProductId>>>,
        cancel: CancellationToken,
    ) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut first = true;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let Some(id) = queue.lock().await.pop_front() else {
                break;
            };

            if !first {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = self.config.politeness.pause() => {}
                }
            }
            first = false;

            match self.refresh_one(id).await {
                Ok(outcome) => summary.record(&outcome),
                Err(e) => {
                    summary.checked += 1;
                    summary.errors += 1;
                    error!(
                        product_id = id,
                        error_kind = "repository",
                        "Refresh of product {} aborted: {}",
                        id,
                        e
                    );
                }
            }
        }

        debug!("Refresh worker {} done after {} products", worker, summary.checked);
        summary
    }

    /// Start tracking a pasted URL for `owner_id` and run the first refresh.
    pub async fn track_product(
        &self,
        owner_id: UserId,
        raw_url: &str,
        request: TrackRequest,
    ) -> Result<(Product, RefreshOutcome), TrackError> {
        if let Some(target) = request.target_price
            && !(target.is_finite() && target > 0.0)
        {
            return Err(InputError::InvalidTargetPrice(target).into());
        }

        let url = {
            let _permit = self.in_flight.acquire().await.ok();
            resolve_product_url(self.fetcher().as_ref(), raw_url).await
        };
        let url = url.inspect_err(|e| debug!("Rejected product URL {:?}: {}", raw_url, e))?;

        self.database.get_user(owner_id).await?;
        let product = self
            .database
            .create_product(&NewProduct {
                owner_id,
                url,
                display_name: request
                    .display_name
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty()),
                target_price: request.target_price,
                policy: NotificationPolicy {
                    enabled: true,
                    notify_on_any_change: request.notify_on_any_change,
                },
            })
            .await?;
        info!("User {} started tracking {}", owner_id, product.url);

        let outcome = self.refresh_one(product.id).await?;
        let product = self.database.get_product(product.id).await?;
        Ok((product, outcome))
    }

    /// Download and store images for products that have a URL but no bytes.
    ///
    /// # Returns
    /// * `Result<usize, RepositoryError>` - Number of images stored
    pub async fn backfill_images(&self, limit: u32) -> Result<usize, RepositoryError> {
        let products = self.database.list_products_missing_images(limit).await?;
        let mut stored = 0;

        for (i, product) in products.iter().enumerate() {
            let Some(image_url) = product.image_url.as_deref() else {
                continue;
            };
            if i > 0 {
                self.config.politeness.pause().await;
            }

            let _guard = self.locks.acquire(product.id).await;
            let downloaded = {
                let _permit = self.in_flight.acquire().await.ok();
                self.fetcher().download_image(image_url).await
            };

            match downloaded {
                Ok(image) => {
                    self.database.store_image(product.id, &image).await?;
                    stored += 1;
                }
                Err(e) => warn!(
                    product_id = product.id,
                    error_kind = e.kind(),
                    "Image download for product {} failed: {}",
                    product.id,
                    e
                ),
            }
        }

        if !products.is_empty() {
            info!("Stored {} of {} missing product images", stored, products.len());
        }
        Ok(stored)
    }
}
