//! Confluence connector.
//!
//! Harvests pages from every space visible to the configured token using
//! the Confluence REST API:
//!
//! | Step | Call |
//! |------|------|
//! | List containers | `GET /rest/api/space?start=&limit=&expand=status` |
//! | List items | `GET /rest/api/content?spaceKey=&type=page&start=&limit=&expand=version` |
//! | Fetch item | `GET /rest/api/content/{id}?expand=body.storage,history` |
//!
//! The listing call only expands `version`, which carries the
//! last-modified timestamp used for incremental sync; bodies are fetched
//! per page for the items that survive the watermark filter.
//!
//! # Configuration
//!
//! ```json
//! { "url": "https://wiki.example.com", "token": "<personal access token>" }
//! ```
//!
//! Requests authenticate with `Authorization: Bearer <token>`.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::discovery::ConnectorCatalog;
use crate::error::HarvestError;
use crate::harvest::{with_retries, Container, Harvester, ItemRef, RemoteSource};
use crate::models::{ConfigField, Document, DocumentType, FieldType};
use crate::normalize::normalize_markup;
use crate::traits::{parse_config, Connector, ConnectorContext, ConnectorKind};

pub const TYPE_NAME: &str = "confluence";

const SPACE_PAGE_LIMIT: usize = 500;
const PROBE_ATTEMPTS: u32 = 3;
const PROBE_TIMEOUT_SECS: u64 = 30;

pub fn register(catalog: &mut ConnectorCatalog) {
    catalog.register::<ConfluenceKind>(TYPE_NAME);
}

/// Typed configuration of a Confluence instance.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfluenceConfig {
    pub url: String,
    pub token: String,
}

// ═══════════════════════════════════════════════════════════════════════
// REST client
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct Paged<T> {
    results: Vec<T>,
}

/// A Confluence space.
#[derive(Debug, Clone, Deserialize)]
pub struct Space {
    pub key: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct PageSummary {
    id: String,
    version: Version,
}

#[derive(Debug, Deserialize)]
struct Version {
    when: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct Page {
    id: String,
    title: String,
    body: Body,
    history: History,
    #[serde(rename = "_links")]
    links: Links,
}

#[derive(Debug, Deserialize)]
struct Body {
    storage: Storage,
}

#[derive(Debug, Deserialize)]
struct Storage {
    value: String,
}

#[derive(Debug, Deserialize)]
struct History {
    #[serde(rename = "createdBy")]
    created_by: User,
}

#[derive(Debug, Deserialize)]
struct User {
    #[serde(rename = "displayName")]
    display_name: String,
    #[serde(rename = "profilePicture")]
    profile_picture: Option<Picture>,
}

#[derive(Debug, Deserialize)]
struct Picture {
    path: String,
}

#[derive(Debug, Deserialize)]
struct Links {
    base: Option<String>,
    webui: String,
}

/// Thin read-only client over the Confluence REST API.
///
/// Holds no per-call state, so one client is shared by all workers of an
/// instance.
pub struct ConfluenceClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ConfluenceClient {
    pub fn new(config: &ConfluenceConfig, timeout: Duration) -> Result<Self> {
        let base_url = config.url.trim_end_matches('/').to_string();
        reqwest::Url::parse(&base_url)
            .with_context(|| format!("invalid Confluence URL: {}", config.url))?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url,
            token: config.token.clone(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("GET {} returned {}: {}", url, status, body.trim());
        }

        response
            .json::<T>()
            .await
            .with_context(|| format!("unexpected response shape from {}", url))
    }

    /// All spaces, following pagination.
    pub async fn get_all_spaces(&self) -> Result<Vec<Space>> {
        let mut spaces = Vec::new();
        let mut start = 0;
        loop {
            let page: Paged<Space> = self
                .get_json(
                    "/rest/api/space",
                    &[
                        ("start", start.to_string()),
                        ("limit", SPACE_PAGE_LIMIT.to_string()),
                        ("expand", "status".to_string()),
                    ],
                )
                .await?;
            let short = page.results.len() < SPACE_PAGE_LIMIT;
            spaces.extend(page.results);
            if short {
                return Ok(spaces);
            }
            start += SPACE_PAGE_LIMIT;
        }
    }

    async fn get_pages_from_space(
        &self,
        space_key: &str,
        start: usize,
        limit: usize,
    ) -> Result<Vec<PageSummary>> {
        let page: Paged<PageSummary> = self
            .get_json(
                "/rest/api/content",
                &[
                    ("spaceKey", space_key.to_string()),
                    ("type", "page".to_string()),
                    ("start", start.to_string()),
                    ("limit", limit.to_string()),
                    ("expand", "version".to_string()),
                ],
            )
            .await?;
        Ok(page.results)
    }

    async fn get_page_by_id(&self, id: &str) -> Result<Page> {
        self.get_json(
            &format!("/rest/api/content/{}", id),
            &[("expand", "body.storage,history".to_string())],
        )
        .await
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Harvesting
// ═══════════════════════════════════════════════════════════════════════

/// [`RemoteSource`] over one Confluence site.
pub struct ConfluenceSource {
    client: ConfluenceClient,
}

impl ConfluenceSource {
    pub fn new(client: ConfluenceClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemoteSource for ConfluenceSource {
    async fn list_containers(&self) -> Result<Vec<Container>> {
        let spaces = self.client.get_all_spaces().await?;
        Ok(spaces
            .into_iter()
            .map(|s| Container {
                key: s.key,
                label: s.name,
            })
            .collect())
    }

    async fn list_items(
        &self,
        container: &Container,
        start: usize,
        limit: usize,
    ) -> Result<Vec<ItemRef>> {
        let pages = self
            .client
            .get_pages_from_space(&container.key, start, limit)
            .await?;
        Ok(pages
            .into_iter()
            .map(|p| ItemRef {
                id: p.id,
                container_label: container.label.clone(),
                last_modified: p.version.when,
            })
            .collect())
    }

    async fn fetch_document(&self, item: &ItemRef, data_source_id: i64) -> Result<Document> {
        let page = self.client.get_page_by_id(&item.id).await?;
        let base = page
            .links
            .base
            .clone()
            .unwrap_or_else(|| self.client.base_url.clone());
        let author = page.history.created_by;

        Ok(Document {
            title: page.title,
            content: normalize_markup(&page.body.storage.value),
            author: Some(author.display_name),
            author_image_url: author
                .profile_picture
                .map(|p| format!("{}{}", base, p.path)),
            timestamp: item.last_modified,
            source_id: page.id,
            data_source_id,
            location: item.container_label.clone(),
            url: format!("{}{}", base, page.links.webui),
            doc_type: DocumentType::Document,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Connector kind
// ═══════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct ConfluenceKind;

#[async_trait]
impl ConnectorKind for ConfluenceKind {
    fn display_name(&self) -> &str {
        "Confluence"
    }

    fn config_fields(&self) -> Vec<ConfigField> {
        vec![
            ConfigField::required("url", "Confluence URL", FieldType::Url)
                .with_help("Base URL of the site, e.g. https://wiki.example.com"),
            ConfigField::required("token", "Personal Access Token", FieldType::Password),
        ]
    }

    async fn validate_config(&self, config: &Value) -> crate::error::Result<()> {
        let parsed: ConfluenceConfig = parse_config(TYPE_NAME, config)?;
        let client = ConfluenceClient::new(&parsed, Duration::from_secs(PROBE_TIMEOUT_SECS))
            .map_err(|e| HarvestError::config_invalid(TYPE_NAME, e))?;
        with_retries(PROBE_ATTEMPTS, "list spaces", || client.get_all_spaces())
            .await
            .map_err(|e| HarvestError::config_invalid(TYPE_NAME, e))?;
        Ok(())
    }

    fn build(&self, ctx: ConnectorContext) -> crate::error::Result<Box<dyn Connector>> {
        let parsed: ConfluenceConfig = parse_config(TYPE_NAME, &ctx.config)?;
        let client = ConfluenceClient::new(
            &parsed,
            Duration::from_secs(ctx.settings.request_timeout_secs),
        )
        .map_err(|e| HarvestError::config_invalid(TYPE_NAME, e))?;
        Ok(Box::new(Harvester::new(ConfluenceSource::new(client), &ctx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_page_response_parses() {
        let raw = json!({
            "id": "123",
            "title": "Runbook",
            "body": { "storage": { "value": "<h2>Steps</h2><p>Restart</p>" } },
            "history": { "createdBy": {
                "displayName": "Dana",
                "profilePicture": { "path": "/images/dana.png" }
            }},
            "_links": { "base": "https://wiki.example.com", "webui": "/display/OPS/Runbook" }
        });
        let page: Page = serde_json::from_value(raw).unwrap();
        assert_eq!(page.history.created_by.display_name, "Dana");
        assert_eq!(page.links.webui, "/display/OPS/Runbook");
    }

    #[test]
    fn test_version_timestamp_parses_with_millis() {
        let v: Version = serde_json::from_value(json!({"when": "2024-03-01T10:15:30.123Z"})).unwrap();
        assert_eq!(v.when.timestamp_subsec_millis(), 123);
    }

    #[test]
    fn test_client_rejects_bad_url() {
        let cfg = ConfluenceConfig {
            url: "not a url".to_string(),
            token: "t".to_string(),
        };
        assert!(ConfluenceClient::new(&cfg, Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_missing_token_is_config_invalid_without_network() {
        let err = ConfluenceKind
            .validate_config(&json!({"url": "https://wiki.example.com"}))
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::ConfigInvalid { .. }));
    }
}
