//! SQLite actor store
//!
//! Durable [`ActorStore`] backed by SQLx. Remote actor creation relies on the
//! `UNIQUE` constraint on `ap_id`, so concurrent resolvers racing on the same
//! actor converge on one row.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite, SqlitePool};

use super::models::*;
use super::store::ActorStore;
use crate::error::AppError;

const ACTOR_COLUMNS: &str = "id, kind, name, domain, ap_id, inbox, shared_inbox, \
     public_key_id, public_key_pem, private, created_at";

#[derive(Debug, sqlx::FromRow)]
struct ActorRow {
    id: String,
    kind: String,
    name: String,
    domain: Option<String>,
    ap_id: Option<String>,
    inbox: Option<String>,
    shared_inbox: Option<String>,
    public_key_id: Option<String>,
    public_key_pem: Option<String>,
    private: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<ActorRow> for ActorRecord {
    type Error = AppError;

    fn try_from(row: ActorRow) -> Result<Self, Self::Error> {
        let kind = ActorKind::from_str(&row.kind).ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!("unknown actor kind in database: {}", row.kind))
        })?;
        let public_key = match (row.public_key_id, row.public_key_pem) {
            (Some(key_id), Some(pem)) => Some(PublicKeyMaterial { key_id, pem }),
            _ => None,
        };

        Ok(ActorRecord {
            id: ActorId::from_string(row.id),
            kind,
            name: row.name,
            home: match row.domain {
                Some(domain) => ActorHome::Remote(domain),
                None => ActorHome::Local,
            },
            ap_id: row.ap_id,
            inbox: row.inbox,
            shared_inbox: row.shared_inbox,
            public_key,
            private: row.private,
            created_at: row.created_at,
        })
    }
}

/// SQLite-backed actor store
pub struct SqliteActorStore {
    pool: Pool<Sqlite>,
}

impl SqliteActorStore {
    /// Connect to database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    /// Register a local actor (normally done by account registration).
    pub async fn insert_local_actor(
        &self,
        kind: ActorKind,
        name: &str,
        public_key: Option<&PublicKeyMaterial>,
    ) -> Result<ActorRecord, AppError> {
        let id = ActorId::new();
        sqlx::query(
            r#"
            INSERT INTO actor (
                id, kind, name, domain, ap_id, inbox, shared_inbox,
                public_key_id, public_key_pem, private, created_at
            ) VALUES (?, ?, ?, NULL, NULL, NULL, NULL, ?, ?, 0, ?)
            "#,
        )
        .bind(id.as_str())
        .bind(kind.as_str())
        .bind(name)
        .bind(public_key.map(|k| k.key_id.as_str()))
        .bind(public_key.map(|k| k.pem.as_str()))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.find_by_id(&id).await?.ok_or(AppError::NotFound)
    }

    /// Delete an actor row; returns whether a row was removed.
    pub async fn delete_actor(&self, id: &ActorId) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM actor WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Number of actor rows
    pub async fn count_actors(&self) -> Result<i64, AppError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM actor")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }

    async fn fetch_one_where(
        &self,
        clause: &str,
        binds: &[&str],
    ) -> Result<Option<ActorRecord>, AppError> {
        let sql = format!("SELECT {} FROM actor WHERE {} LIMIT 1", ACTOR_COLUMNS, clause);
        let mut query = sqlx::query_as::<_, ActorRow>(&sql);
        for value in binds {
            query = query.bind(*value);
        }
        query
            .fetch_optional(&self.pool)
            .await?
            .map(ActorRecord::try_from)
            .transpose()
    }
}

#[async_trait]
impl ActorStore for SqliteActorStore {
    async fn find_local_actor(
        &self,
        kind: ActorKind,
        name: &str,
    ) -> Result<Option<ActorRecord>, AppError> {
        self.fetch_one_where(
            "domain IS NULL AND kind = ? AND name = ? COLLATE NOCASE",
            &[kind.as_str(), name],
        )
        .await
    }

    async fn find_remote_actor(&self, ap_id: &str) -> Result<Option<ActorRecord>, AppError> {
        self.fetch_one_where("ap_id = ?", &[ap_id]).await
    }

    async fn find_remote_actor_by_handle(
        &self,
        name: &str,
        host: &str,
        kind: Option<ActorKind>,
    ) -> Result<Option<ActorRecord>, AppError> {
        let host = host.to_ascii_lowercase();
        match kind {
            Some(kind) => {
                self.fetch_one_where(
                    "domain = ? AND name = ? COLLATE NOCASE AND kind = ?",
                    &[host.as_str(), name, kind.as_str()],
                )
                .await
            }
            None => {
                self.fetch_one_where(
                    "domain = ? AND name = ? COLLATE NOCASE ORDER BY created_at",
                    &[host.as_str(), name],
                )
                .await
            }
        }
    }

    async fn create_remote_actor(&self, actor: &NewRemoteActor) -> Result<ActorRecord, AppError> {
        let id = ActorId::new();
        let result = sqlx::query(
            r#"
            INSERT INTO actor (
                id, kind, name, domain, ap_id, inbox, shared_inbox,
                public_key_id, public_key_pem, private, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(ap_id) DO NOTHING
            "#,
        )
        .bind(id.as_str())
        .bind(actor.kind.as_str())
        .bind(&actor.name)
        .bind(actor.domain.to_ascii_lowercase())
        .bind(&actor.ap_id)
        .bind(&actor.inbox)
        .bind(&actor.shared_inbox)
        .bind(&actor.public_key.key_id)
        .bind(&actor.public_key.pem)
        .bind(actor.private)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::debug!(ap_id = %actor.ap_id, "Remote actor already stored");
        }

        // Whoever won the insert, the row for this ap_id is the answer.
        self.find_remote_actor(&actor.ap_id)
            .await?
            .ok_or_else(|| {
                AppError::Internal(anyhow::anyhow!(
                    "remote actor {} missing after insert",
                    actor.ap_id
                ))
            })
    }

    async fn find_by_id(&self, id: &ActorId) -> Result<Option<ActorRecord>, AppError> {
        self.fetch_one_where("id = ?", &[id.as_str()]).await
    }
}
