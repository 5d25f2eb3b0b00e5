mod history;
mod notifications;
mod products;

pub use products::RefreshPatch;

use std::path::Path;

use chrono::Utc;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, migrate::MigrateDatabase};
use tracing::info;

use crate::error::RepositoryError;
use crate::models::{Language, NewUser, User, UserId};

pub const DEFAULT_HISTORY_CAP: u32 = 100;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    history_cap: u32,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self, RepositoryError> {
        // Create database file if it doesn't exist
        if !Sqlite::database_exists(db_url).await.unwrap_or(false) {
            info!("Creating database file for {}", db_url);
            if let Some(dir) = sqlite_file_path(db_url).and_then(|p| p.parent().map(Path::to_path_buf))
                && !dir.as_os_str().is_empty()
            {
                tokio::fs::create_dir_all(&dir)
                    .await
                    .map_err(|e| RepositoryError::Database(sqlx::Error::Io(e)))?;
            }
            Sqlite::create_database(db_url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?;

        Self::migrated(pool).await
    }

    /// Private in-memory database, used by tests and dry runs.
    pub async fn in_memory() -> Result<Self, RepositoryError> {
        // Every connection to :memory: is a separate database, so keep exactly one alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Self::migrated(pool).await
    }

    async fn migrated(pool: SqlitePool) -> Result<Self, RepositoryError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("Database initialized successfully");
        Ok(Self {
            pool,
            history_cap: DEFAULT_HISTORY_CAP,
        })
    }

    /// Number of price points retained per product, at least 1.
    #[must_use]
    pub fn with_history_cap(mut self, cap: u32) -> Self {
        self.history_cap = cap.max(1);
        self
    }

    pub async fn create_user(&self, user: &NewUser) -> Result<User, RepositoryError> {
        let created_at = Utc::now();
        let result = sqlx::query(
            r"
            INSERT INTO users (handle, email, language, is_bot, created_at)
            VALUES (?, ?, ?, ?, ?)
            ",
        )
        .bind(&user.handle)
        .bind(&user.email)
        .bind(user.language.code())
        .bind(user.is_bot)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, || format!("user {} already exists", user.handle)))?;

        Ok(User {
            id: result.last_insert_rowid(),
            handle: user.handle.clone(),
            email: user.email.clone(),
            language: user.language,
            is_bot: user.is_bot,
            created_at,
        })
    }

    pub async fn get_user(&self, id: UserId) -> Result<User, RepositoryError> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("user {id}")))?;

        Ok(user_from_row(&row)?)
    }

    pub async fn find_user_by_handle(&self, handle: &str) -> Result<Option<User>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM users WHERE handle = ?")
            .bind(handle)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(user_from_row).transpose()?)
    }

    /// Returns the bot account, creating it on first use.
    pub async fn ensure_bot_user(&self, handle: &str, email: &str) -> Result<User, RepositoryError> {
        if let Some(user) = self.find_user_by_handle(handle).await? {
            return Ok(user);
        }

        info!("Creating bot user {}", handle);
        self.create_user(&NewUser {
            handle: handle.to_string(),
            email: email.to_string(),
            language: Language::Arabic,
            is_bot: true,
        })
        .await
    }

    /// Removes a user together with their products, history and notifications.
    pub async fn delete_user(&self, id: UserId) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("user {id}")));
        }
        Ok(())
    }
}

fn user_from_row(row: &SqliteRow) -> Result<User, sqlx::Error> {
    Ok(User {
        id: row.try_get("id")?,
        handle: row.try_get("handle")?,
        email: row.try_get("email")?,
        language: Language::from_code(&row.try_get::<String, _>("language")?),
        is_bot: row.try_get("is_bot")?,
        created_at: row.try_get("created_at")?,
    })
}

pub(crate) fn conflict_on_unique(err: sqlx::Error, describe: impl FnOnce() -> String) -> RepositoryError {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => RepositoryError::Conflict(describe()),
        other => RepositoryError::Database(other),
    }
}

/// Filesystem path behind a `sqlite:` URL, if it names a file.
fn sqlite_file_path(db_url: &str) -> Option<&Path> {
    let rest = db_url
        .strip_prefix("sqlite://")
        .or_else(|| db_url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next()?;
    (!path.is_empty() && !path.contains(":memory:")).then(|| Path::new(path))
}


#[cfg(test)]
mod tests {
    use super::testing::new_user;
    use super::*;

    #[test]
    fn test_sqlite_file_path() {
        assert_eq!(
            sqlite_file_path("sqlite:data/price_tracker.db"),
            Some(Path::new("data/price_tracker.db"))
        );
        assert_eq!(
            sqlite_file_path("sqlite://db/x.db?mode=rwc"),
            Some(Path::new("db/x.db"))
        );
        assert_eq!(sqlite_file_path("sqlite::memory:"), None);
    }

    #[tokio::test]
    async fn test_duplicate_handle_is_conflict() {
        let db = Database::in_memory().await.unwrap();
        db.create_user(&new_user("u1")).await.unwrap();

        let err = db.create_user(&new_user("u1")).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_ensure_bot_user_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        let first = db.ensure_bot_user("deals-bot", "bot@example.com").await.unwrap();
        let second = db.ensure_bot_user("deals-bot", "bot@example.com").await.unwrap();

        assert!(first.is_bot);
        assert_eq!(first.id, second.id);
        assert_eq!(db.get_user(first.id).await.unwrap().handle, "deals-bot");
    }

    #[tokio::test]
    async fn test_get_missing_user() {
        let db = Database::in_memory().await.unwrap();
        assert!(matches!(
            db.get_user(42).await,
            Err(RepositoryError::NotFound(_))
        ));
    }
}
