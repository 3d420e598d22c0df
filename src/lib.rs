//! # Doc Harvester
//!
//! A pluggable document-harvesting framework. Connector kinds for external
//! content systems are registered in a catalog, configured instances are
//! persisted in SQLite, and each instance incrementally pulls new and
//! changed documents into an indexing queue.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌─────────────┐   ┌──────────────┐
//! │  Catalog     │──▶│  Registry    │──▶│  Harvester  │──▶│ IndexingQueue│
//! │ (discovery)  │   │ cache+SQLite │   │ N workers   │   │  (batches)   │
//! └──────────────┘   └──────────────┘   └─────────────┘   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! harvest init
//! harvest types
//! harvest create confluence --set url=https://wiki.example.com --set token=$TOKEN
//! harvest sync all
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`traits`] | Connector contract |
//! | [`discovery`] | Connector kind registration and lookup |
//! | [`registry`] | Persisted, cached connector instances |
//! | [`harvest`] | Incremental parallel harvesting engine |
//! | [`normalize`] | Markup to plain text |
//! | [`queue`] | Indexing queue sink |
//! | [`ingest`] | Sync orchestration and watermark advancement |
//! | [`connector_confluence`] | Confluence connector |
//! | [`connector_fs`] | Local directory connector |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod config;
pub mod connector_confluence;
pub mod connector_fs;
pub mod db;
pub mod discovery;
pub mod error;
pub mod harvest;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod queue;
pub mod registry;
pub mod traits;
