//! Connector registry: the single authority for connector instances.
//!
//! The registry owns three things:
//!
//! - the persisted type catalog (`connector_types`), filled from
//!   [`ConnectorCatalog::discover`] on first use;
//! - the persisted instances (`connector_instances`);
//! - an in-memory cache holding exactly one entry per persisted row: a
//!   live [`ConnectorInstance`], or an [`UnloadableInstance`] when the row
//!   could not be built at load time.
//!
//! ```text
//! get / create / delete
//!        │
//!        ▼
//! ensure_initialized ──(once)──▶ sync types ─▶ load instances
//!        │
//!        ▼
//! RwLock<HashMap<id, Arc<ConnectorInstance>>>  ⇄  SQLite
//! ```
//!
//! `create` and `delete` hold the cache write lock across their database
//! transaction, so no reader can observe a row without its cache entry or
//! the reverse.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::{OnceCell, RwLock};
use tracing::{info, warn};

use crate::config::{Config, HarvestSettings};
use crate::db;
use crate::discovery::ConnectorCatalog;
use crate::error::{HarvestError, Result};
use crate::harvest::PassReport;
use crate::migrate;
use crate::models::{from_millis, ConfigField, ConnectorType, Watermark};
use crate::queue::{IndexingQueue, SqliteIndexQueue};
use crate::traits::{check_required_fields, Connector, ConnectorContext, ConnectorKind};

/// A configured, live connector.
pub struct ConnectorInstance {
    id: i64,
    type_name: String,
    config: Value,
    created_at: DateTime<Utc>,
    watermark: Arc<Watermark>,
    connector: Box<dyn Connector>,
}

impl ConnectorInstance {
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The configuration exactly as it was validated and persisted.
    pub fn config(&self) -> &Value {
        &self.config
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn watermark(&self) -> &Watermark {
        &self.watermark
    }

    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.watermark.last_synced()
    }

    /// Run one harvesting pass. Does not advance the watermark; see
    /// [`ingest::sync_instance`](crate::ingest::sync_instance).
    pub async fn feed_new_documents(&self) -> Result<PassReport> {
        self.connector.feed_new_documents().await
    }
}

impl std::fmt::Debug for ConnectorInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorInstance")
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .field("created_at", &self.created_at)
            .field("watermark", &self.watermark.get())
            .finish_non_exhaustive()
    }
}

/// A persisted instance that failed to load. Kept so `list` and `delete`
/// still see every row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnloadableInstance {
    pub id: i64,
    pub type_name: String,
    pub reason: String,
}

/// Process-wide cache of connector instances backed by SQLite.
pub struct ConnectorRegistry {
    pool: SqlitePool,
    catalog: ConnectorCatalog,
    queue: Arc<dyn IndexingQueue>,
    settings: HarvestSettings,
    instances: RwLock<Instances>,
    initialized: OnceCell<()>,
}

#[derive(Default)]
struct Instances {
    live: HashMap<i64, Arc<ConnectorInstance>>,
    unloadable: HashMap<i64, UnloadableInstance>,
}

impl ConnectorRegistry {
    /// Build a registry over an existing pool. Nothing is read until the
    /// first operation.
    pub fn new(
        pool: SqlitePool,
        catalog: ConnectorCatalog,
        queue: Arc<dyn IndexingQueue>,
        settings: HarvestSettings,
    ) -> Self {
        Self {
            pool,
            catalog,
            queue,
            settings,
            instances: RwLock::new(Instances::default()),
            initialized: OnceCell::new(),
        }
    }

    /// Connect to the configured database, ensure the schema exists, and
    /// build a registry with the built-in connector kinds feeding the
    /// SQLite document queue.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::create_schema(&pool).await?;
        let queue = Arc::new(SqliteIndexQueue::new(pool.clone()));
        Ok(Self::new(
            pool,
            ConnectorCatalog::with_builtins(),
            queue,
            config.harvest.clone(),
        ))
    }

    pub fn settings(&self) -> &HarvestSettings {
        &self.settings
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// The cached instance for `id`.
    pub async fn get(&self, id: i64) -> Result<Arc<ConnectorInstance>> {
        self.ensure_initialized().await?;
        let cache = self.instances.read().await;
        if let Some(instance) = cache.live.get(&id) {
            return Ok(instance.clone());
        }
        match cache.unloadable.get(&id) {
            Some(u) => Err(HarvestError::Unloadable {
                id,
                reason: u.reason.clone(),
            }),
            None => Err(HarvestError::NotFound(id)),
        }
    }

    /// All live instances, ordered by id.
    pub async fn list(&self) -> Result<Vec<Arc<ConnectorInstance>>> {
        self.ensure_initialized().await?;
        let mut all: Vec<_> = self.instances.read().await.live.values().cloned().collect();
        all.sort_by_key(|i| i.id);
        Ok(all)
    }

    /// Persisted instances that failed to load, ordered by id.
    pub async fn list_unloadable(&self) -> Result<Vec<UnloadableInstance>> {
        self.ensure_initialized().await?;
        let mut all: Vec<_> = self
            .instances
            .read()
            .await
            .unloadable
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|u| u.id);
        Ok(all)
    }

    /// The persisted type catalog, ordered by name.
    pub async fn types(&self) -> Result<Vec<ConnectorType>> {
        self.ensure_initialized().await?;
        let rows: Vec<(i64, String, String, String)> = sqlx::query_as(
            "SELECT id, name, display_name, config_fields FROM connector_types ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, name, display_name, fields)| -> Result<ConnectorType> {
                Ok(ConnectorType {
                    id,
                    name,
                    display_name,
                    config_fields: serde_json::from_str(&fields)?,
                })
            })
            .collect()
    }

    /// Validate `config`, persist a new instance of `type_name`, and cache it.
    pub async fn create(&self, type_name: &str, config: Value) -> Result<Arc<ConnectorInstance>> {
        self.ensure_initialized().await?;

        let type_id: Option<i64> =
            sqlx::query_scalar("SELECT id FROM connector_types WHERE name = ?")
                .bind(type_name)
                .fetch_optional(&self.pool)
                .await?;
        let type_id = type_id.ok_or_else(|| HarvestError::UnknownType(type_name.to_string()))?;

        let kind = self.catalog.resolve(type_name)?;
        check_required_fields(type_name, &kind.config_fields(), &config)?;
        kind.validate_config(&config).await?;

        let config_json = serde_json::to_string(&config)?;
        let created_at = from_millis(Utc::now().timestamp_millis());

        let mut cache = self.instances.write().await;
        let mut tx = self.pool.begin().await?;
        let id = sqlx::query(
            "INSERT INTO connector_instances (type_id, config, created_at) VALUES (?, ?, ?)",
        )
        .bind(type_id)
        .bind(&config_json)
        .bind(created_at.timestamp_millis())
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        // A build failure drops `tx`, rolling the insert back.
        let instance = Arc::new(self.instantiate(
            kind.as_ref(),
            id,
            type_name,
            config,
            created_at,
            None,
        )?);
        tx.commit().await?;
        cache.live.insert(id, instance.clone());

        info!(instance_id = id, type_name, "connector instance created");
        Ok(instance)
    }

    /// Remove instance `id` from storage and from the cache.
    ///
    /// Deleting an id that does not exist, including one deleted a moment
    /// ago, fails with [`HarvestError::NotFound`].
    pub async fn delete(&self, id: i64) -> Result<()> {
        self.ensure_initialized().await?;

        let mut cache = self.instances.write().await;
        let mut tx = self.pool.begin().await?;
        let affected = sqlx::query("DELETE FROM connector_instances WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if affected == 0 {
            cache.live.remove(&id);
            cache.unloadable.remove(&id);
            return Err(HarvestError::NotFound(id));
        }

        tx.commit().await?;
        cache.live.remove(&id);
        cache.unloadable.remove(&id);

        info!(instance_id = id, "connector instance deleted");
        Ok(())
    }

    /// Persist a successful pass that started at `started_at` and advance
    /// the instance watermark. Never moves the watermark backwards.
    pub async fn record_sync(&self, id: i64, started_at: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let instance = self.get(id).await?;
        let affected = sqlx::query(
            "UPDATE connector_instances SET last_synced_at = MAX(COALESCE(last_synced_at, 0), ?) WHERE id = ?",
        )
        .bind(started_at.timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(HarvestError::NotFound(id));
        }
        Ok(instance.watermark.advance(started_at))
    }

    async fn ensure_initialized(&self) -> Result<()> {
        self.initialized
            .get_or_try_init(|| async {
                self.sync_types().await?;
                self.load_instances().await
            })
            .await?;
        Ok(())
    }

    /// Write a `connector_types` row for every discovered kind that does
    /// not have one yet.
    async fn sync_types(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let mut added = 0;

        for name in self.catalog.discover().into_keys() {
            let exists: Option<i64> =
                sqlx::query_scalar("SELECT id FROM connector_types WHERE name = ?")
                    .bind(&name)
                    .fetch_optional(&mut *tx)
                    .await?;
            if exists.is_some() {
                continue;
            }

            let kind = self.catalog.resolve(&name)?;
            let fields: Vec<ConfigField> = kind.config_fields();
            sqlx::query(
                "INSERT INTO connector_types (name, display_name, config_fields) VALUES (?, ?, ?) ON CONFLICT(name) DO NOTHING",
            )
            .bind(&name)
            .bind(kind.display_name())
            .bind(serde_json::to_string(&fields)?)
            .execute(&mut *tx)
            .await?;
            added += 1;
        }

        tx.commit().await?;
        if added > 0 {
            info!(added, "registered new connector types");
        }
        Ok(())
    }

    /// Build and cache a live instance for every persisted row. Rows that
    /// fail to build are cached as unloadable.
    async fn load_instances(&self) -> Result<()> {
        let rows: Vec<(i64, String, String, i64, Option<i64>)> = sqlx::query_as(
            r#"
            SELECT i.id, t.name, i.config, i.created_at, i.last_synced_at
            FROM connector_instances i
            JOIN connector_types t ON t.id = i.type_id
            ORDER BY i.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut cache = self.instances.write().await;
        for (id, type_name, config_json, created_at, last_synced_at) in rows {
            let loaded = self.catalog.resolve(&type_name).and_then(|kind| {
                let config = serde_json::from_str::<Value>(&config_json)?;
                self.instantiate(
                    kind.as_ref(),
                    id,
                    &type_name,
                    config,
                    from_millis(created_at),
                    last_synced_at.map(from_millis),
                )
            });
            match loaded {
                Ok(instance) => {
                    cache.live.insert(id, Arc::new(instance));
                }
                Err(e) => {
                    warn!(instance_id = id, type_name = %type_name, error = %e, "failed to load connector instance");
                    cache.unloadable.insert(
                        id,
                        UnloadableInstance {
                            id,
                            type_name,
                            reason: e.to_string(),
                        },
                    );
                }
            }
        }

        info!(
            instances = cache.live.len(),
            unloadable = cache.unloadable.len(),
            "connector instances loaded"
        );
        Ok(())
    }

    fn instantiate(
        &self,
        kind: &dyn ConnectorKind,
        id: i64,
        type_name: &str,
        config: Value,
        created_at: DateTime<Utc>,
        last_synced_at: Option<DateTime<Utc>>,
    ) -> Result<ConnectorInstance> {
        let watermark = Arc::new(Watermark::new(last_synced_at));
        let connector = kind.build(ConnectorContext {
            instance_id: id,
            config: config.clone(),
            watermark: watermark.clone(),
            queue: self.queue.clone(),
            settings: self.settings.clone(),
        })?;
        Ok(ConnectorInstance {
            id,
            type_name: type_name.to_string(),
            config,
            created_at,
            watermark,
            connector,
        })
    }
}
