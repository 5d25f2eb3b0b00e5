use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use super::Database;
use crate::error::RepositoryError;
use crate::models::{NewNotification, Notification, NotificationKind, UserId};

impl Database {
    /// A user's notifications, newest first.
    pub async fn list_notifications(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Notification>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM notifications WHERE user_id = ? ORDER BY created_at DESC, id DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(notification_from_row).collect::<Result<_, _>>()?)
    }

    pub async fn mark_notification_read(&self, id: i64) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE notifications SET read = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("notification {id}")));
        }
        Ok(())
    }
}

pub(super) async fn insert_notification(
    conn: &mut SqliteConnection,
    notification: &NewNotification,
    created_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO notifications (user_id, product_id, kind, message, created_at)
        VALUES (?, ?, ?, ?, ?)
        ",
    )
    .bind(notification.user_id)
    .bind(notification.product_id)
    .bind(notification.kind.as_str())
    .bind(&notification.message)
    .bind(created_at)
    .execute(conn)
    .await?;

    Ok(())
}

fn notification_from_row(row: &SqliteRow) -> Result<Notification, sqlx::Error> {
    let kind: String = row.try_get("kind")?;
    Ok(Notification {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        product_id: row.try_get("product_id")?,
        kind: NotificationKind::parse(&kind).unwrap_or(NotificationKind::SystemInfo),
        message: row.try_get("message")?,
        created_at: row.try_get("created_at")?,
        read: row.try_get("read")?,
    })
}
