//! Error taxonomy for registry and harvesting operations.
//!
//! Lookup and validation errors are returned synchronously to the caller of
//! the registry operation that raised them. Remote and worker errors are
//! raised by a harvesting pass and gate watermark advancement.

use thiserror::Error;

/// Errors surfaced by the registry, the connector contract, and harvesting passes.
#[derive(Error, Debug)]
pub enum HarvestError {
    /// The configuration payload failed shape validation or the live
    /// connectivity probe.
    #[error("invalid configuration for connector type '{type_name}': {source:#}")]
    ConfigInvalid {
        type_name: String,
        #[source]
        source: anyhow::Error,
    },

    /// No connector type with this name is stored in the type catalog.
    #[error("connector type '{0}' does not exist")]
    UnknownType(String),

    /// No registered implementation resolves this type name.
    #[error("no connector implementation registered for type '{0}'")]
    TypeNotFound(String),

    /// The connector instance id has no persisted or cached instance.
    #[error("connector instance {0} does not exist")]
    NotFound(i64),

    /// The instance is persisted but could not be built at load time
    /// (its type is no longer registered, or its stored config no longer
    /// parses). It can still be listed and deleted.
    #[error("connector instance {id} could not be loaded: {reason}")]
    Unloadable { id: i64, reason: String },

    /// A remote call kept failing after the bounded retry was exhausted.
    #[error("remote call '{operation}' failed after {attempts} attempts: {source:#}")]
    RemoteTransient {
        operation: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    /// One or more parallel workers stopped on an unrecovered error.
    #[error("{failed} of {workers} harvest workers failed (first: {first})")]
    WorkerFailure {
        failed: usize,
        workers: usize,
        first: String,
    },

    /// The pass did not finish within the configured timeout.
    #[error("harvesting pass for instance {instance_id} timed out after {secs}s")]
    Timeout { instance_id: i64, secs: u64 },

    /// The indexing queue rejected a batch.
    #[error("indexing queue rejected a batch: {0:#}")]
    Queue(anyhow::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HarvestError {
    /// Wrap any error as a [`HarvestError::ConfigInvalid`] for `type_name`.
    pub fn config_invalid(type_name: &str, source: impl Into<anyhow::Error>) -> Self {
        HarvestError::ConfigInvalid {
            type_name: type_name.to_string(),
            source: source.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HarvestError>;
