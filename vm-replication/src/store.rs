//! Local replica tables.
//!
//! Upserts merge: a column absent from the message keeps its stored value
//! (`COALESCE(excluded.col, col)`), so a `create` followed by an `update`
//! yields one row holding the union of both, with the update winning.

use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use tracing::{info, instrument, warn};

use crate::envelope::{Action, Envelope, ImageData, OfferData, ReplicaEvent, UserData};
use crate::error::{ReplicationError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct OfferRecord {
    pub id: i64,
    pub name: Option<String>,
    pub description: Option<String>,
    pub cpu_count: Option<i64>,
    pub memory_size_mib: Option<i64>,
    pub disk_size_gb: Option<i64>,
    pub price_per_hour: Option<f64>,
    pub is_active: Option<bool>,
    pub last_applied_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct ImageRecord {
    pub id: i64,
    pub name: Option<String>,
    pub os_type: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub image_path: Option<String>,
    pub last_applied_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct UserRecord {
    pub id: i64,
    pub name: Option<String>,
    pub email: Option<String>,
    pub role: Option<String>,
    pub last_applied_at: i64,
}

/// Outcome of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Upserted,
    Deleted,
    /// Delete for an id with no local row.
    Missing,
}

#[derive(Clone)]
pub struct ReplicaStore {
    pool: SqlitePool,
}

impl ReplicaStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Apply one decoded event.
    #[instrument(skip(self, event), fields(feed = %event.feed(), action = %event.action(), id = event.id()))]
    pub async fn apply(&self, event: &ReplicaEvent) -> Result<Applied> {
        let feed = event.feed();
        let result = match event {
            ReplicaEvent::Offer(e) => self.apply_offer(e).await,
            ReplicaEvent::Image(e) => self.apply_image(e).await,
            ReplicaEvent::User(e) => self.apply_user(e).await,
        };

        let applied = result.map_err(|source| ReplicationError::Apply {
            feed: feed.as_str(),
            source,
        })?;

        match applied {
            Applied::Missing => warn!(
                "{} {} not found for deletion, ignoring",
                feed,
                event.id()
            ),
            _ => info!("Applied {} {} for id {}", feed, event.action(), event.id()),
        }
        Ok(applied)
    }

    async fn apply_offer(&self, e: &Envelope<OfferData>) -> sqlx::Result<Applied> {
        if e.action == Action::Delete {
            return self.delete("vm_offers", e.data.id).await;
        }

        let d = &e.data;
        sqlx::query(
            r#"
            INSERT INTO vm_offers (id, name, description, cpu_count, memory_size_mib,
                                   disk_size_gb, price_per_hour, is_active, last_applied_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = COALESCE(excluded.name, vm_offers.name),
                description = COALESCE(excluded.description, vm_offers.description),
                cpu_count = COALESCE(excluded.cpu_count, vm_offers.cpu_count),
                memory_size_mib = COALESCE(excluded.memory_size_mib, vm_offers.memory_size_mib),
                disk_size_gb = COALESCE(excluded.disk_size_gb, vm_offers.disk_size_gb),
                price_per_hour = COALESCE(excluded.price_per_hour, vm_offers.price_per_hour),
                is_active = COALESCE(excluded.is_active, vm_offers.is_active),
                last_applied_at = excluded.last_applied_at
            "#,
        )
        .bind(d.id)
        .bind(&d.name)
        .bind(&d.description)
        .bind(d.cpu_count)
        .bind(d.memory_size_mib)
        .bind(d.disk_size_gb)
        .bind(d.price_per_hour)
        .bind(d.is_active)
        .bind(now())
        .execute(&self.pool)
        .await?;

        Ok(Applied::Upserted)
    }

    async fn apply_image(&self, e: &Envelope<ImageData>) -> sqlx::Result<Applied> {
        if e.action == Action::Delete {
            return self.delete("system_images", e.data.id).await;
        }

        let d = &e.data;
        sqlx::query(
            r#"
            INSERT INTO system_images (id, name, os_type, version, description, image_path,
                                       last_applied_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = COALESCE(excluded.name, system_images.name),
                os_type = COALESCE(excluded.os_type, system_images.os_type),
                version = COALESCE(excluded.version, system_images.version),
                description = COALESCE(excluded.description, system_images.description),
                image_path = COALESCE(excluded.image_path, system_images.image_path),
                last_applied_at = excluded.last_applied_at
            "#,
        )
        .bind(d.id)
        .bind(&d.name)
        .bind(&d.os_type)
        .bind(&d.version)
        .bind(&d.description)
        .bind(&d.image_path)
        .bind(now())
        .execute(&self.pool)
        .await?;

        Ok(Applied::Upserted)
    }

    async fn apply_user(&self, e: &Envelope<UserData>) -> sqlx::Result<Applied> {
        if e.action == Action::Delete {
            return self.delete("users", e.data.id).await;
        }

        let d = &e.data;
        sqlx::query(
            r#"
            INSERT INTO users (id, name, email, role, last_applied_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = COALESCE(excluded.name, users.name),
                email = COALESCE(excluded.email, users.email),
                role = COALESCE(excluded.role, users.role),
                last_applied_at = excluded.last_applied_at
            "#,
        )
        .bind(d.id)
        .bind(&d.name)
        .bind(&d.email)
        .bind(&d.role)
        .bind(now())
        .execute(&self.pool)
        .await?;

        Ok(Applied::Upserted)
    }

    async fn delete(&self, table: &'static str, id: i64) -> sqlx::Result<Applied> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = ?", table))
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(if result.rows_affected() == 0 {
            Applied::Missing
        } else {
            Applied::Deleted
        })
    }

    pub async fn list_offers(&self) -> Result<Vec<OfferRecord>> {
        let rows = sqlx::query_as::<_, OfferRecord>("SELECT * FROM vm_offers ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn get_offer(&self, id: i64) -> Result<Option<OfferRecord>> {
        let row = sqlx::query_as::<_, OfferRecord>("SELECT * FROM vm_offers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_images(&self) -> Result<Vec<ImageRecord>> {
        let rows = sqlx::query_as::<_, ImageRecord>("SELECT * FROM system_images ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn get_image(&self, id: i64) -> Result<Option<ImageRecord>> {
        let row = sqlx::query_as::<_, ImageRecord>("SELECT * FROM system_images WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<UserRecord>> {
        let row = sqlx::query_as::<_, UserRecord>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
