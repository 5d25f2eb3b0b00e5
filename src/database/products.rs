use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::debug;

use super::{Database, conflict_on_unique, history, notifications};
use crate::error::RepositoryError;
use crate::models::{
    ImageData, NewNotification, NewProduct, NotificationPolicy, PricePoint, Product, ProductId,
    UserId,
};

/// Product fields written by one refresh.
///
/// `None` leaves the stored value alone; a failed refresh carries only
/// `checked_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshPatch {
    pub product_id: ProductId,
    /// Revision read before fetching; the write is rejected if it moved.
    pub expected_revision: i64,
    pub checked_at: DateTime<Utc>,
    pub name: Option<String>,
    pub current_price: Option<f64>,
    pub image_url: Option<String>,
    pub image: Option<ImageData>,
}

impl RefreshPatch {
    pub fn checked_only(product: &Product, checked_at: DateTime<Utc>) -> Self {
        Self {
            product_id: product.id,
            expected_revision: product.revision,
            checked_at,
            name: None,
            current_price: None,
            image_url: None,
            image: None,
        }
    }
}

impl Database {
    pub async fn create_product(&self, product: &NewProduct) -> Result<Product, RepositoryError> {
        let result = sqlx::query(
            r"
            INSERT INTO products (owner_id, url, display_name, target_price,
                                  tracking_enabled, notify_on_any_change, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(product.owner_id)
        .bind(&product.url)
        .bind(&product.display_name)
        .bind(product.target_price)
        .bind(product.policy.enabled)
        .bind(product.policy.notify_on_any_change)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_on_unique(e, || {
                format!("user {} already tracks {}", product.owner_id, product.url)
            })
        })?;

        self.get_product(result.last_insert_rowid()).await
    }

    pub async fn get_product(&self, id: ProductId) -> Result<Product, RepositoryError> {
        let row = sqlx::query("SELECT * FROM products WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("product {id}")))?;

        Ok(product_from_row(&row)?)
    }

    pub async fn find_product_by_owner_and_url(
        &self,
        owner_id: UserId,
        url: &str,
    ) -> Result<Option<Product>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM products WHERE owner_id = ? AND url = ?")
            .bind(owner_id)
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(product_from_row).transpose()?)
    }

    pub async fn list_products_for_owner(
        &self,
        owner_id: UserId,
    ) -> Result<Vec<Product>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM products WHERE owner_id = ? ORDER BY id")
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(product_from_row).collect::<Result<_, _>>()?)
    }

    /// Enabled products not checked since `older_than`, never-checked first.
    pub async fn list_trackable_products(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Product>, RepositoryError> {
        let rows = sqlx::query(
            r"
            SELECT * FROM products
            WHERE tracking_enabled = 1
              AND (last_checked IS NULL OR last_checked <= ?)
            ORDER BY last_checked IS NOT NULL, last_checked, id
            ",
        )
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(product_from_row).collect::<Result<_, _>>()?)
    }

    /// Enabled products skipped because they were checked after `older_than`.
    pub async fn count_recently_checked(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM products WHERE tracking_enabled = 1 AND last_checked > ?",
        )
        .bind(older_than)
        .fetch_one(&self.pool)
        .await?;

        Ok(u64::try_from(count).unwrap_or_default())
    }

    pub async fn delete_product(&self, id: ProductId) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM products WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("product {id}")));
        }
        Ok(())
    }

    pub async fn set_notification_policy(
        &self,
        id: ProductId,
        policy: NotificationPolicy,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE products SET tracking_enabled = ?, notify_on_any_change = ? WHERE id = ?",
        )
        .bind(policy.enabled)
        .bind(policy.notify_on_any_change)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("product {id}")));
        }
        Ok(())
    }

    pub async fn set_display_name(
        &self,
        id: ProductId,
        display_name: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE products SET display_name = ? WHERE id = ?")
            .bind(display_name)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("product {id}")));
        }
        Ok(())
    }

    /// Products with a known image URL whose bytes were never stored.
    pub async fn list_products_missing_images(
        &self,
        limit: u32,
    ) -> Result<Vec<Product>, RepositoryError> {
        let rows = sqlx::query(
            r"
            SELECT * FROM products
            WHERE image_url IS NOT NULL AND image_url != '' AND image_bytes IS NULL
            ORDER BY id
            LIMIT ?
            ",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(product_from_row).collect::<Result<_, _>>()?)
    }

    pub async fn store_image(&self, id: ProductId, image: &ImageData) -> Result<(), RepositoryError> {
        sqlx::query(
            r"
            UPDATE products
            SET image_bytes = ?, image_content_type = ?, image_checksum = ?
            WHERE id = ?
            ",
        )
        .bind(&image.bytes)
        .bind(&image.content_type)
        .bind(image.checksum())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Commit one refresh: product fields, optional price point and
    /// notifications, all or nothing.
    ///
    /// Fails with [`RepositoryError::Conflict`] when another writer persisted
    /// a refresh of the same product since `patch.expected_revision` was read.
    pub async fn persist_refresh(
        &self,
        patch: &RefreshPatch,
        point: Option<&PricePoint>,
        notifications: &[NewNotification],
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        // Bytes stored for another URL are stale; the backfill picks the new one up.
        if let Some(image_url) = &patch.image_url {
            sqlx::query(
                r"
                UPDATE products
                SET image_bytes = NULL, image_content_type = NULL, image_checksum = NULL
                WHERE id = ? AND revision = ? AND image_url IS NOT ?
                ",
            )
            .bind(patch.product_id)
            .bind(patch.expected_revision)
            .bind(image_url)
            .execute(&mut *tx)
            .await?;
        }

        let updated = sqlx::query(
            r"
            UPDATE products
            SET last_checked = ?,
                name = COALESCE(?, name),
                current_price = COALESCE(?, current_price),
                image_url = COALESCE(?, image_url),
                revision = revision + 1
            WHERE id = ? AND revision = ?
            ",
        )
        .bind(patch.checked_at)
        .bind(&patch.name)
        .bind(patch.current_price)
        .bind(&patch.image_url)
        .bind(patch.product_id)
        .bind(patch.expected_revision)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM products WHERE id = ?")
                .bind(patch.product_id)
                .fetch_optional(&mut *tx)
                .await?;
            return Err(match exists {
                Some(_) => RepositoryError::Conflict(format!(
                    "product {} changed since revision {}",
                    patch.product_id, patch.expected_revision
                )),
                None => RepositoryError::NotFound(format!("product {}", patch.product_id)),
            });
        }

        if let Some(image) = &patch.image {
            sqlx::query(
                r"
                UPDATE products
                SET image_bytes = ?, image_content_type = ?, image_checksum = ?
                WHERE id = ?
                ",
            )
            .bind(&image.bytes)
            .bind(&image.content_type)
            .bind(image.checksum())
            .bind(patch.product_id)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(point) = point {
            history::insert_point(&mut *tx, point, self.history_cap).await?;
        }

        for notification in notifications {
            notifications::insert_notification(&mut *tx, notification, patch.checked_at).await?;
        }

        tx.commit().await?;
        debug!(
            "Persisted refresh of product {} ({} notifications)",
            patch.product_id,
            notifications.len()
        );
        Ok(())
    }
}

pub(super) fn product_from_row(row: &SqliteRow) -> Result<Product, sqlx::Error> {
    Ok(Product {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        url: row.try_get("url")?,
        name: row.try_get("name")?,
        display_name: row.try_get("display_name")?,
        current_price: row.try_get("current_price")?,
        target_price: row.try_get("target_price")?,
        policy: NotificationPolicy {
            enabled: row.try_get("tracking_enabled")?,
            notify_on_any_change: row.try_get("notify_on_any_change")?,
        },
        last_checked: row.try_get("last_checked")?,
        image_url: row.try_get("image_url")?,
        image_bytes: row.try_get("image_bytes")?,
        image_content_type: row.try_get("image_content_type")?,
        image_checksum: row.try_get("image_checksum")?,
        revision: row.try_get("revision")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::database::testing::{new_product, new_user, seed_product};
    use crate::models::NotificationKind;

    const URL: &str = "https://www.amazon.sa/dp/B0TEST0001";

    fn priced(product: &Product, price: f64, at: DateTime<Utc>) -> RefreshPatch {
        RefreshPatch {
            name: Some("Kettle".into()),
            current_price: Some(price),
            ..RefreshPatch::checked_only(product, at)
        }
    }

    #[tokio::test]
    async fn test_owner_url_is_unique() {
        let db = Database::in_memory().await.unwrap();
        let (user, _) = seed_product(&db, "u1", URL).await;

        let err = db.create_product(&new_product(user.id, URL)).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        // Another owner may track the same URL.
        let other = db.create_user(&new_user("u2")).await.unwrap();
        db.create_product(&new_product(other.id, URL)).await.unwrap();
    }

    #[tokio::test]
    async fn test_trackable_selection_respects_threshold_and_flag() {
        let db = Database::in_memory().await.unwrap();
        let (user, fresh) = seed_product(&db, "u1", URL).await;
        let stale = db
            .create_product(&new_product(user.id, "https://www.amazon.sa/dp/B0TEST0002"))
            .await
            .unwrap();
        let never = db
            .create_product(&new_product(user.id, "https://www.amazon.sa/dp/B0TEST0003"))
            .await
            .unwrap();
        let mut disabled = new_product(user.id, "https://www.amazon.sa/dp/B0TEST0004");
        disabled.policy.enabled = false;
        db.create_product(&disabled).await.unwrap();

        let now = Utc::now();
        db.persist_refresh(&priced(&fresh, 10.0, now), None, &[])
            .await
            .unwrap();
        db.persist_refresh(&priced(&stale, 10.0, now - Duration::hours(7)), None, &[])
            .await
            .unwrap();

        let threshold = now - Duration::hours(6);
        let due: Vec<_> = db
            .list_trackable_products(threshold)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(due, vec![never.id, stale.id]);
        assert_eq!(db.count_recently_checked(threshold).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_persist_refresh_is_atomic_and_versioned() {
        let db = Database::in_memory().await.unwrap();
        let (user, product) = seed_product(&db, "u1", URL).await;
        let now = Utc::now();
        let point = PricePoint {
            product_id: product.id,
            price: 90.0,
            recorded_at: now,
        };
        let notification = NewNotification {
            user_id: user.id,
            product_id: Some(product.id),
            kind: NotificationKind::PriceDrop,
            message: "drop".into(),
        };

        db.persist_refresh(&priced(&product, 90.0, now), Some(&point), &[notification.clone()])
            .await
            .unwrap();

        let stored = db.get_product(product.id).await.unwrap();
        assert_eq!(stored.current_price, Some(90.0));
        assert_eq!(stored.name, "Kettle");
        assert_eq!(stored.revision, product.revision + 1);
        assert_eq!(db.count_history(product.id).await.unwrap(), 1);

        // A writer holding the old revision loses and leaves nothing behind.
        let err = db
            .persist_refresh(&priced(&product, 50.0, now), Some(&point), &[notification])
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert_eq!(db.get_product(product.id).await.unwrap().current_price, Some(90.0));
        assert_eq!(db.count_history(product.id).await.unwrap(), 1);
        assert_eq!(db.list_notifications(user.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_checked_only_patch_keeps_price() {
        let db = Database::in_memory().await.unwrap();
        let (_, product) = seed_product(&db, "u1", URL).await;
        let now = Utc::now();
        db.persist_refresh(&priced(&product, 42.0, now), None, &[])
            .await
            .unwrap();

        let product = db.get_product(product.id).await.unwrap();
        let later = now + Duration::minutes(5);
        db.persist_refresh(&RefreshPatch::checked_only(&product, later), None, &[])
            .await
            .unwrap();

        let stored = db.get_product(product.id).await.unwrap();
        assert_eq!(stored.current_price, Some(42.0));
        assert_eq!(stored.last_checked, Some(later));
    }

    #[tokio::test]
    async fn test_images_missing_and_stored() {
        let db = Database::in_memory().await.unwrap();
        let (_, product) = seed_product(&db, "u1", URL).await;
        let patch = RefreshPatch {
            image_url: Some("https://m.media-amazon.com/k.jpg".into()),
            ..priced(&product, 10.0, Utc::now())
        };
        db.persist_refresh(&patch, None, &[]).await.unwrap();

        let missing = db.list_products_missing_images(10).await.unwrap();
        assert_eq!(missing.len(), 1);

        let image = ImageData {
            bytes: b"jpeg".to_vec(),
            content_type: "image/jpeg".into(),
        };
        db.store_image(product.id, &image).await.unwrap();
        assert!(db.list_products_missing_images(10).await.unwrap().is_empty());

        let stored = db.get_product(product.id).await.unwrap();
        assert_eq!(stored.image_checksum, Some(image.checksum()));
    }

    #[tokio::test]
    async fn test_new_image_url_drops_stale_bytes() {
        let db = Database::in_memory().await.unwrap();
        let (_, product) = seed_product(&db, "u1", URL).await;
        let patch = RefreshPatch {
            image_url: Some("https://m.media-amazon.com/old.jpg".into()),
            ..priced(&product, 10.0, Utc::now() - Duration::hours(2))
        };
        db.persist_refresh(&patch, None, &[]).await.unwrap();
        let image = ImageData {
            bytes: b"old".to_vec(),
            content_type: "image/jpeg".into(),
        };
        db.store_image(product.id, &image).await.unwrap();

        // Same URL again keeps the bytes.
        let product = db.get_product(product.id).await.unwrap();
        let patch = RefreshPatch {
            image_url: Some("https://m.media-amazon.com/old.jpg".into()),
            ..priced(&product, 10.0, Utc::now() - Duration::hours(1))
        };
        db.persist_refresh(&patch, None, &[]).await.unwrap();
        let stored = db.get_product(product.id).await.unwrap();
        assert_eq!(stored.image_checksum, Some(image.checksum()));
        assert!(db.list_products_missing_images(10).await.unwrap().is_empty());

        let patch = RefreshPatch {
            image_url: Some("https://m.media-amazon.com/new.jpg".into()),
            ..priced(&stored, 10.0, Utc::now())
        };
        db.persist_refresh(&patch, None, &[]).await.unwrap();
        let stored = db.get_product(product.id).await.unwrap();
        assert_eq!(stored.image_url.as_deref(), Some("https://m.media-amazon.com/new.jpg"));
        assert_eq!(stored.image_bytes, None);
        assert_eq!(stored.image_content_type, None);
        assert_eq!(stored.image_checksum, None);

        let missing = db.list_products_missing_images(10).await.unwrap();
        assert_eq!(missing.iter().map(|p| p.id).collect::<Vec<_>>(), vec![product.id]);
    }

    #[tokio::test]
    async fn test_new_image_url_with_bytes_replaces_them() {
        let db = Database::in_memory().await.unwrap();
        let (_, product) = seed_product(&db, "u1", URL).await;
        let old = ImageData {
            bytes: b"old".to_vec(),
            content_type: "image/jpeg".into(),
        };
        let patch = RefreshPatch {
            image_url: Some("https://m.media-amazon.com/old.jpg".into()),
            image: Some(old),
            ..priced(&product, 10.0, Utc::now() - Duration::hours(1))
        };
        db.persist_refresh(&patch, None, &[]).await.unwrap();

        let product = db.get_product(product.id).await.unwrap();
        let new = ImageData {
            bytes: b"new".to_vec(),
            content_type: "image/png".into(),
        };
        let patch = RefreshPatch {
            image_url: Some("https://m.media-amazon.com/new.png".into()),
            image: Some(new.clone()),
            ..priced(&product, 10.0, Utc::now())
        };
        db.persist_refresh(&patch, None, &[]).await.unwrap();

        let stored = db.get_product(product.id).await.unwrap();
        assert_eq!(stored.image_bytes.as_deref(), Some(&b"new"[..]));
        assert_eq!(stored.image_content_type.as_deref(), Some("image/png"));
        assert_eq!(stored.image_checksum, Some(new.checksum()));
    }

    #[tokio::test]
    async fn test_notification_policy_controls_tracking() {
        let db = Database::in_memory().await.unwrap();
        let (_, product) = seed_product(&db, "u1", URL).await;
        let policy = NotificationPolicy {
            enabled: false,
            notify_on_any_change: true,
        };
        db.set_notification_policy(product.id, policy).await.unwrap();

        let stored = db.get_product(product.id).await.unwrap();
        assert_eq!(stored.policy, policy);
        assert!(db.list_trackable_products(Utc::now()).await.unwrap().is_empty());

        db.set_notification_policy(product.id, NotificationPolicy::default())
            .await
            .unwrap();
        assert_eq!(db.list_trackable_products(Utc::now()).await.unwrap().len(), 1);

        assert!(matches!(
            db.set_notification_policy(9999, policy).await,
            Err(RepositoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_deleting_user_cascades() {
        let db = Database::in_memory().await.unwrap();
        let (user, product) = seed_product(&db, "u1", URL).await;
        db.delete_user(user.id).await.unwrap();

        assert!(matches!(
            db.get_product(product.id).await,
            Err(RepositoryError::NotFound(_))
        ));
    }
}
