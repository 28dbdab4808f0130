use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use shared::domain::{RequestId, RideRequest, UserId};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub user_id: UserId,
    pub email: String,
    pub password_hash: String,
    pub password_salt: String,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Returns `None` when the email is already registered.
    pub async fn create_user(
        &self,
        email: &str,
        password_hash: &str,
        password_salt: &str,
    ) -> Result<Option<UserId>> {
        let row = sqlx::query(
            "INSERT INTO users (email, password_hash, password_salt) VALUES (?, ?, ?)
             ON CONFLICT(email) DO NOTHING
             RETURNING id",
        )
        .bind(email)
        .bind(password_hash)
        .bind(password_salt)
        .fetch_optional(&self.pool)
        .await
        .context("failed to insert user")?;
        Ok(row.map(|r| UserId(r.get::<i64, _>(0))))
    }

    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<StoredUser>> {
        let row = sqlx::query(
            "SELECT id, email, password_hash, password_salt FROM users WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load user by email")?;
        Ok(row.map(|r| StoredUser {
            user_id: UserId(r.get::<i64, _>(0)),
            email: r.get::<String, _>(1),
            password_hash: r.get::<String, _>(2),
            password_salt: r.get::<String, _>(3),
        }))
    }

    /// Appends a ride request to the log. The key and timestamp are minted here,
    /// never taken from the caller.
    pub async fn append_ride_request(
        &self,
        author: UserId,
        author_label: &str,
        pickup_location: &str,
        dropoff_location: &str,
    ) -> Result<RideRequest> {
        let id = RequestId::generate();
        let created_at = Utc::now();
        sqlx::query(
            "INSERT INTO ride_requests (id, author_user_id, author_label, pickup_location, dropoff_location, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id.as_str())
        .bind(author.0)
        .bind(author_label)
        .bind(pickup_location)
        .bind(dropoff_location)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .context("failed to append ride request")?;

        debug!(request_id = %id, author = author.0, "storage: ride request appended");
        Ok(RideRequest {
            id,
            author,
            author_label: author_label.to_string(),
            pickup_location: pickup_location.to_string(),
            dropoff_location: dropoff_location.to_string(),
            created_at,
        })
    }

    /// Whole log in insertion order.
    pub async fn list_ride_requests(&self) -> Result<Vec<RideRequest>> {
        let rows = sqlx::query(
            "SELECT id, author_user_id, author_label, pickup_location, dropoff_location, created_at
             FROM ride_requests
             ORDER BY seq ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list ride requests")?;

        Ok(rows
            .into_iter()
            .map(|r| RideRequest {
                id: RequestId(r.get::<String, _>(0)),
                author: UserId(r.get::<i64, _>(1)),
                author_label: r.get::<String, _>(2),
                pickup_location: r.get::<String, _>(3),
                dropoff_location: r.get::<String, _>(4),
                created_at: r.get::<DateTime<Utc>, _>(5),
            })
            .collect())
    }

    pub async fn count_ride_requests(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ride_requests")
            .fetch_one(&self.pool)
            .await
            .context("failed to count ride requests")?;
        Ok(count)
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
