//! Connector contract.
//!
//! Every source kind implements two traits:
//!
//! - [`ConnectorKind`]: static metadata (display name, config fields),
//!   configuration validation, and construction of live instances. One
//!   value per kind, registered in the
//!   [`ConnectorCatalog`](crate::discovery::ConnectorCatalog).
//! - [`Connector`]: a live instance bound to one persisted connector id.
//!   Its only job is to run incremental harvesting passes.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │            ConnectorCatalog              │
//! │   name → KindInfo + factory (lazy)       │
//! └──────────────┬───────────────────────────┘
//!                ▼ resolve(name)
//!        ConnectorKind::validate_config
//!        ConnectorKind::build ──▶ Box<dyn Connector>
//!                                      │
//!                                      ▼
//!                       feed_new_documents() → IndexingQueue
//! ```
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use doc_harvester::error::Result;
//! use doc_harvester::harvest::PassReport;
//! use doc_harvester::models::{ConfigField, FieldType};
//! use doc_harvester::traits::{Connector, ConnectorContext, ConnectorKind};
//! use serde_json::Value;
//!
//! #[derive(Default)]
//! pub struct NullKind;
//!
//! struct NullConnector;
//!
//! #[async_trait]
//! impl Connector for NullConnector {
//!     async fn feed_new_documents(&self) -> Result<PassReport> {
//!         Ok(PassReport::default())
//!     }
//! }
//!
//! #[async_trait]
//! impl ConnectorKind for NullKind {
//!     fn display_name(&self) -> &str { "Null" }
//!     fn config_fields(&self) -> Vec<ConfigField> {
//!         vec![ConfigField::optional("note", "Note", FieldType::Text)]
//!     }
//!     async fn validate_config(&self, _config: &Value) -> Result<()> { Ok(()) }
//!     fn build(&self, _ctx: ConnectorContext) -> Result<Box<dyn Connector>> {
//!         Ok(Box::new(NullConnector))
//!     }
//! }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::HarvestSettings;
use crate::error::{HarvestError, Result};
use crate::harvest::PassReport;
use crate::models::{ConfigField, Watermark};
use crate::queue::IndexingQueue;

/// A live connector instance.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Run one incremental harvesting pass.
    ///
    /// Reads the instance watermark once at the start and pushes every item
    /// modified at or after it to the indexing queue in batches. Must be
    /// safe to call repeatedly. Never advances the watermark itself; that
    /// is the caller's job once the pass is known to be clean.
    async fn feed_new_documents(&self) -> Result<PassReport>;
}

/// Everything a kind needs to build a live instance.
#[derive(Clone)]
pub struct ConnectorContext {
    pub instance_id: i64,
    pub config: Value,
    pub watermark: Arc<Watermark>,
    pub queue: Arc<dyn IndexingQueue>,
    pub settings: HarvestSettings,
}

/// A connector kind: metadata, validation, and construction.
#[async_trait]
pub trait ConnectorKind: Send + Sync {
    /// Human-readable label (e.g. `"Confluence"`).
    fn display_name(&self) -> &str;

    /// Ordered configuration keys this kind expects.
    fn config_fields(&self) -> Vec<ConfigField>;

    /// Parse `config` into the kind's typed shape and probe the remote
    /// source with it.
    ///
    /// Fails with [`HarvestError::ConfigInvalid`]. Must not touch the
    /// registry or the database.
    async fn validate_config(&self, config: &Value) -> Result<()>;

    /// Build a live instance. No I/O beyond creating a client handle.
    fn build(&self, ctx: ConnectorContext) -> Result<Box<dyn Connector>>;
}

/// Check `config` against a kind's field descriptors: it must be a JSON
/// object and every required key must be present and non-null.
pub fn check_required_fields(type_name: &str, fields: &[ConfigField], config: &Value) -> Result<()> {
    let obj = config.as_object().ok_or_else(|| {
        HarvestError::config_invalid(
            type_name,
            anyhow::anyhow!("configuration must be a JSON object"),
        )
    })?;

    let missing: Vec<&str> = fields
        .iter()
        .filter(|f| f.required)
        .filter(|f| obj.get(&f.name).map_or(true, Value::is_null))
        .map(|f| f.name.as_str())
        .collect();

    if !missing.is_empty() {
        return Err(HarvestError::config_invalid(
            type_name,
            anyhow::anyhow!("missing required field(s): {}", missing.join(", ")),
        ));
    }
    Ok(())
}

/// Deserialize an untyped configuration payload into a kind's typed config.
pub fn parse_config<T: DeserializeOwned>(type_name: &str, config: &Value) -> Result<T> {
    serde_json::from_value(config.clone()).map_err(|e| HarvestError::config_invalid(type_name, e))
}
