//! Indexing queue: the sink harvesters feed normalized documents into.
//!
//! Harvesters are the only producers. A queue must accept documents in any
//! order and treat each one as independently upsertable, keyed by
//! `(data_source_id, source_id)`.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::Document;

/// Destination for batches of harvested documents.
#[async_trait]
pub trait IndexingQueue: Send + Sync {
    /// Accept one batch. Called concurrently by harvest workers.
    async fn feed(&self, docs: Vec<Document>) -> Result<()>;
}

/// Queue that upserts documents into the SQLite `documents` table.
pub struct SqliteIndexQueue {
    pool: SqlitePool,
}

impl SqliteIndexQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IndexingQueue for SqliteIndexQueue {
    async fn feed(&self, docs: Vec<Document>) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        for doc in &docs {
            sqlx::query(
                r#"
                INSERT INTO documents (id, data_source_id, source_id, title, content, author, author_image_url, timestamp, location, url, doc_type, dedup_hash, indexed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(data_source_id, source_id) DO UPDATE SET
                    title = excluded.title,
                    content = excluded.content,
                    author = excluded.author,
                    author_image_url = excluded.author_image_url,
                    timestamp = excluded.timestamp,
                    location = excluded.location,
                    url = excluded.url,
                    doc_type = excluded.doc_type,
                    dedup_hash = excluded.dedup_hash,
                    indexed_at = excluded.indexed_at
                WHERE documents.dedup_hash != excluded.dedup_hash
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(doc.data_source_id)
            .bind(&doc.source_id)
            .bind(&doc.title)
            .bind(&doc.content)
            .bind(&doc.author)
            .bind(&doc.author_image_url)
            .bind(doc.timestamp.timestamp_millis())
            .bind(&doc.location)
            .bind(&doc.url)
            .bind(doc.doc_type.as_str())
            .bind(dedup_hash(doc))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

fn dedup_hash(doc: &Document) -> String {
    let mut hasher = Sha256::new();
    hasher.update(doc.source_id.as_bytes());
    hasher.update(doc.timestamp.timestamp_millis().to_le_bytes());
    hasher.update(doc.title.as_bytes());
    hasher.update(doc.content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// In-memory queue that records every batch it receives.
#[derive(Default)]
pub struct MemoryQueue {
    batches: Mutex<Vec<Vec<Document>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sizes of the batches received so far, in arrival order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.lock().iter().map(Vec::len).collect()
    }

    /// Every document received so far, flattened.
    pub fn documents(&self) -> Vec<Document> {
        self.lock().iter().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Vec<Document>>> {
        self.batches.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl IndexingQueue for MemoryQueue {
    async fn feed(&self, docs: Vec<Document>) -> Result<()> {
        self.lock().push(docs);
        Ok(())
    }
}
