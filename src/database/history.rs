//! Per-product price history, capped to the most recent points.

use sqlx::{Row, SqliteConnection};

use super::Database;
use crate::error::RepositoryError;
use crate::models::{PricePoint, ProductId};

impl Database {
    /// Append one point and drop anything beyond the history cap.
    pub async fn append_price_point(&self, point: &PricePoint) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        insert_point(&mut *tx, point, self.history_cap).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Retained points for a product, oldest first.
    pub async fn recent_history(
        &self,
        product_id: ProductId,
    ) -> Result<Vec<PricePoint>, RepositoryError> {
        let rows = sqlx::query(
            r"
            SELECT product_id, price, recorded_at FROM price_history
            WHERE product_id = ?
            ORDER BY recorded_at, id
            ",
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await?;

        let mut points = Vec::with_capacity(rows.len());
        for row in rows {
            points.push(PricePoint {
                product_id: row.try_get("product_id")?,
                price: row.try_get("price")?,
                recorded_at: row.try_get("recorded_at")?,
            });
        }
        Ok(points)
    }

    pub async fn count_history(&self, product_id: ProductId) -> Result<u64, RepositoryError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM price_history WHERE product_id = ?")
            .bind(product_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(u64::try_from(count).unwrap_or_default())
    }
}

pub(super) async fn insert_point(
    conn: &mut SqliteConnection,
    point: &PricePoint,
    cap: u32,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO price_history (product_id, price, recorded_at) VALUES (?, ?, ?)")
        .bind(point.product_id)
        .bind(point.price)
        .bind(point.recorded_at)
        .execute(&mut *conn)
        .await?;

    sqlx::query(
        r"
        DELETE FROM price_history
        WHERE product_id = ?
          AND id NOT IN (
              SELECT id FROM price_history
              WHERE product_id = ?
              ORDER BY recorded_at DESC, id DESC
              LIMIT ?
          )
        ",
    )
    .bind(point.product_id)
    .bind(point.product_id)
    .bind(cap)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::database::testing::seed_product;

    #[tokio::test]
    async fn test_history_is_capped_to_newest_points() {
        let db = Database::in_memory().await.unwrap().with_history_cap(3);
        let (_, product) = seed_product(&db, "u1", "https://www.amazon.sa/dp/B0TEST0001").await;
        let start = Utc::now();

        for i in 0..5 {
            db.append_price_point(&PricePoint {
                product_id: product.id,
                price: 100.0 + f64::from(i),
                recorded_at: start + Duration::minutes(i64::from(i)),
            })
            .await
            .unwrap();
        }

        let prices: Vec<f64> = db
            .recent_history(product.id)
            .await
            .unwrap()
            .iter()
            .map(|p| p.price)
            .collect();
        assert_eq!(prices, vec![102.0, 103.0, 104.0]);
        assert_eq!(db.count_history(product.id).await.unwrap(), 3);
    }
}
