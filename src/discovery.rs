//! Connector type discovery.
//!
//! Each connector module exposes a `register(&mut ConnectorCatalog)`
//! function that adds its kind under a stable name. The catalog only keeps
//! metadata and a factory; a kind is constructed the first time it is
//! [resolved](ConnectorCatalog::resolve). Discovery does no I/O; persisting
//! the discovered types is the registry's job.
//!
//! ```rust
//! use doc_harvester::discovery::ConnectorCatalog;
//!
//! let catalog = ConnectorCatalog::with_builtins();
//! let names: Vec<_> = catalog.discover().into_keys().collect();
//! assert_eq!(names, vec!["confluence", "filesystem"]);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{HarvestError, Result};
use crate::traits::ConnectorKind;

/// Loadable metadata for one connector kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindInfo {
    /// Logical type name (e.g. `"confluence"`).
    pub name: String,
    /// Module defining the kind (e.g. `"doc_harvester::connector_confluence"`).
    pub module_path: String,
    /// Unqualified type name of the kind (e.g. `"ConfluenceKind"`).
    pub type_name: String,
}

type KindFactory = fn() -> Arc<dyn ConnectorKind>;

struct CatalogEntry {
    info: KindInfo,
    factory: KindFactory,
}

fn construct<K: ConnectorKind + Default + 'static>() -> Arc<dyn ConnectorKind> {
    Arc::new(K::default())
}

/// Registration table mapping type names to connector kinds.
#[derive(Default)]
pub struct ConnectorCatalog {
    entries: BTreeMap<String, CatalogEntry>,
}

impl ConnectorCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// A catalog with every connector kind shipped in this crate.
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        crate::connector_confluence::register(&mut catalog);
        crate::connector_fs::register(&mut catalog);
        catalog
    }

    /// Register kind `K` under `name`. A later registration of the same
    /// name replaces the earlier one.
    pub fn register<K: ConnectorKind + Default + 'static>(&mut self, name: &str) {
        let full = std::any::type_name::<K>();
        let (module_path, type_name) = full.rsplit_once("::").unwrap_or(("", full));
        debug!(name, kind = full, "registering connector kind");
        self.entries.insert(
            name.to_string(),
            CatalogEntry {
                info: KindInfo {
                    name: name.to_string(),
                    module_path: module_path.to_string(),
                    type_name: type_name.to_string(),
                },
                factory: construct::<K>,
            },
        );
    }

    /// All registered kinds, ordered by name.
    pub fn discover(&self) -> BTreeMap<String, KindInfo> {
        self.entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.info.clone()))
            .collect()
    }

    /// Construct the kind registered under `name`.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ConnectorKind>> {
        self.entries
            .get(name)
            .map(|entry| (entry.factory)())
            .ok_or_else(|| HarvestError::TypeNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::models::ConfigField;
    use crate::traits::{Connector, ConnectorContext};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static CONSTRUCTED: AtomicUsize = AtomicUsize::new(0);

    struct CountingKind;

    impl Default for CountingKind {
        fn default() -> Self {
            CONSTRUCTED.fetch_add(1, Ordering::SeqCst);
            CountingKind
        }
    }

    #[async_trait]
    impl ConnectorKind for CountingKind {
        fn display_name(&self) -> &str {
            "Counting"
        }
        fn config_fields(&self) -> Vec<ConfigField> {
            Vec::new()
        }
        async fn validate_config(&self, _config: &Value) -> Result<()> {
            Ok(())
        }
        fn build(&self, _ctx: ConnectorContext) -> Result<Box<dyn Connector>> {
            unimplemented!("not needed for discovery tests")
        }
    }

    #[test]
    fn test_builtins_discovered_in_name_order() {
        let catalog = ConnectorCatalog::with_builtins();
        let found = catalog.discover();
        let names: Vec<_> = found.keys().cloned().collect();
        assert_eq!(names, vec!["confluence", "filesystem"]);

        let info = &found["confluence"];
        assert_eq!(info.module_path, "doc_harvester::connector_confluence");
        assert_eq!(info.type_name, "ConfluenceKind");
    }

    #[test]
    fn test_discover_is_deterministic() {
        let catalog = ConnectorCatalog::with_builtins();
        assert_eq!(catalog.discover(), catalog.discover());
    }

    #[test]
    fn test_resolve_unknown_name() {
        let catalog = ConnectorCatalog::with_builtins();
        let err = catalog.resolve("sharepoint").err().unwrap();
        assert!(matches!(err, HarvestError::TypeNotFound(ref n) if n == "sharepoint"));
    }

    #[test]
    fn test_kinds_constructed_only_on_resolve() {
        let mut catalog = ConnectorCatalog::new();
        catalog.register::<CountingKind>("counting");
        let before = CONSTRUCTED.load(Ordering::SeqCst);

        catalog.discover();
        assert_eq!(CONSTRUCTED.load(Ordering::SeqCst), before);

        let kind = catalog.resolve("counting").unwrap();
        assert_eq!(kind.display_name(), "Counting");
        assert_eq!(CONSTRUCTED.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn test_reregistering_replaces_entry() {
        let mut catalog = ConnectorCatalog::with_builtins();
        catalog.register::<CountingKind>("confluence");
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.discover()["confluence"].type_name, "CountingKind");
    }
}
