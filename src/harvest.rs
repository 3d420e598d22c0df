//! Incremental, parallel harvesting engine.
//!
//! A pass walks the same pipeline for every source kind:
//!
//! ```text
//! ListContainers ─▶ ListItemsPerContainer ─▶ FilterByWatermark
//!                                                   │
//!        ┌──────────── round-robin partition ◀──────┘
//!        ▼
//!   worker 0..N:  FetchFullItem ─▶ Normalize ─▶ BatchAndEnqueue
//! ```
//!
//! Sources only implement [`RemoteSource`]; the listing, filtering,
//! retrying, fan-out and batching live here in [`Harvester`].
//!
//! # Failure handling
//!
//! - Container and page listings are retried a fixed number of times
//!   (`harvest.list_retries`) with no delay; exhaustion fails the pass
//!   with [`HarvestError::RemoteTransient`].
//! - A worker that hits an error on one item stops its own share and
//!   reports the item. Sibling workers keep running. Once every worker has
//!   returned, `harvest.on_worker_failure` decides whether the pass fails
//!   or returns a partial [`PassReport`].
//! - Dropping the pass future aborts all outstanding workers.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{HarvestSettings, WorkerFailurePolicy};
use crate::error::{HarvestError, Result};
use crate::models::{Document, Watermark};
use crate::queue::IndexingQueue;
use crate::traits::{Connector, ConnectorContext};

/// A top-level grouping in a remote source (space, channel, project, directory).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    /// Identifier used to list the container's items.
    pub key: String,
    /// Human-readable label copied onto every item as its location.
    pub label: String,
}

/// Lightweight listing entry for one item. Carries no body content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRef {
    pub id: String,
    pub container_label: String,
    pub last_modified: DateTime<Utc>,
}

/// The remote calls a source must provide to be harvested.
#[async_trait]
pub trait RemoteSource: Send + Sync + 'static {
    /// Enumerate top-level containers.
    async fn list_containers(&self) -> anyhow::Result<Vec<Container>>;

    /// One page of a container's items, starting at offset `start`.
    ///
    /// Returning fewer than `limit` items marks the last page. Items must
    /// be tagged with `container.label`.
    async fn list_items(
        &self,
        container: &Container,
        start: usize,
        limit: usize,
    ) -> anyhow::Result<Vec<ItemRef>>;

    /// Fetch an item's full content and normalize it into a [`Document`].
    async fn fetch_document(&self, item: &ItemRef, data_source_id: i64)
        -> anyhow::Result<Document>;
}

/// A worker that stopped early.
#[derive(Debug, Clone)]
pub struct WorkerFailure {
    pub worker: usize,
    /// The item being processed, or `None` when the queue rejected a batch
    /// or the task panicked.
    pub item_id: Option<String>,
    pub error: String,
}

/// Outcome of one harvesting pass.
#[derive(Debug, Clone, Default)]
pub struct PassReport {
    /// Watermark the pass filtered against.
    pub since: Option<DateTime<Utc>>,
    pub containers: usize,
    /// Items returned by the listings, before filtering.
    pub listed: usize,
    /// Items modified at or after the watermark.
    pub candidates: usize,
    /// Documents accepted by the indexing queue.
    pub fed: usize,
    pub workers: usize,
    pub failures: Vec<WorkerFailure>,
}

impl PassReport {
    /// True when every worker finished its share.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Call `op` up to `attempts` times, returning the first success.
///
/// Retries are immediate. Exhaustion yields [`HarvestError::RemoteTransient`]
/// carrying the last error.
pub async fn with_retries<T, F, Fut>(attempts: u32, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!(operation, attempt, error = %e, "remote call failed, retrying");
                attempt += 1;
            }
            Err(e) => {
                error!(operation, attempts, error = %e, "remote call failed");
                return Err(HarvestError::RemoteTransient {
                    operation: operation.to_string(),
                    attempts,
                    source: e,
                });
            }
        }
    }
}

/// Keep the items modified at or after `since`.
pub fn filter_by_watermark(items: Vec<ItemRef>, since: DateTime<Utc>) -> Vec<ItemRef> {
    items
        .into_iter()
        .filter(|item| item.last_modified >= since)
        .collect()
}

/// Split `items` into `workers` shares: share `k` holds indices
/// `k, k + workers, k + 2 * workers, …`.
pub fn partition_round_robin<T>(items: Vec<T>, workers: usize) -> Vec<Vec<T>> {
    let workers = workers.max(1);
    let mut shares: Vec<Vec<T>> = (0..workers)
        .map(|_| Vec::with_capacity(items.len() / workers + 1))
        .collect();
    for (i, item) in items.into_iter().enumerate() {
        shares[i % workers].push(item);
    }
    shares
}

/// Runs harvesting passes of one connector instance against a [`RemoteSource`].
pub struct Harvester<S> {
    source: Arc<S>,
    instance_id: i64,
    watermark: Arc<Watermark>,
    queue: Arc<dyn IndexingQueue>,
    settings: HarvestSettings,
}

impl<S: RemoteSource> Harvester<S> {
    pub fn new(source: S, ctx: &ConnectorContext) -> Self {
        Self {
            source: Arc::new(source),
            instance_id: ctx.instance_id,
            watermark: ctx.watermark.clone(),
            queue: ctx.queue.clone(),
            settings: ctx.settings.clone(),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Run one pass. The watermark is read once, here, and never written.
    pub async fn run_pass(&self) -> Result<PassReport> {
        let since = self.watermark.get();
        info!(
            instance_id = self.instance_id,
            since = %since,
            "harvesting pass started"
        );

        let containers = with_retries(self.settings.list_retries, "list containers", || {
            self.source.list_containers()
        })
        .await?;

        let mut listed = Vec::new();
        for container in &containers {
            listed.extend(self.list_container_items(container).await?);
        }

        let mut report = PassReport {
            since: self.watermark.last_synced(),
            containers: containers.len(),
            listed: listed.len(),
            workers: self.settings.workers.max(1),
            ..Default::default()
        };

        let candidates = filter_by_watermark(listed, since);
        report.candidates = candidates.len();
        info!(
            instance_id = self.instance_id,
            listed = report.listed,
            candidates = report.candidates,
            workers = report.workers,
            "fetching modified items"
        );

        let (fed, failures) = self.fetch_in_parallel(candidates).await;
        report.fed = fed;
        report.failures = failures;

        if !report.is_clean() {
            let first = &report.failures[0];
            let first = match &first.item_id {
                Some(id) => format!("worker {} on item {}: {}", first.worker, id, first.error),
                None => format!("worker {}: {}", first.worker, first.error),
            };
            match self.settings.on_worker_failure {
                WorkerFailurePolicy::FailPass => {
                    return Err(HarvestError::WorkerFailure {
                        failed: report.failures.len(),
                        workers: report.workers,
                        first,
                    });
                }
                WorkerFailurePolicy::LogAndContinue => {
                    warn!(
                        instance_id = self.instance_id,
                        failed = report.failures.len(),
                        first = %first,
                        "pass finished with failed workers"
                    );
                }
            }
        }

        info!(
            instance_id = self.instance_id,
            fed = report.fed,
            "harvesting pass finished"
        );
        Ok(report)
    }

    /// Page through one container until a short page comes back.
    pub async fn list_container_items(&self, container: &Container) -> Result<Vec<ItemRef>> {
        debug!(container = %container.label, key = %container.key, "listing container");
        let limit = self.settings.page_size.max(1);
        let operation = format!("list items in '{}'", container.key);
        let mut start = 0;
        let mut items = Vec::new();

        loop {
            let page = with_retries(self.settings.list_retries, &operation, || {
                self.source.list_items(container, start, limit)
            })
            .await?;

            let short = page.len() < limit;
            items.extend(page);
            if short {
                break;
            }
            start += limit;
        }

        Ok(items)
    }

    async fn fetch_in_parallel(&self, items: Vec<ItemRef>) -> (usize, Vec<WorkerFailure>) {
        let shares = partition_round_robin(items, self.settings.workers);
        let mut set = JoinSet::new();

        for (worker, share) in shares.into_iter().enumerate() {
            let source = self.source.clone();
            let queue = self.queue.clone();
            let batch_size = self.settings.batch_size.max(1);
            let instance_id = self.instance_id;
            set.spawn(async move {
                let outcome =
                    run_worker(worker, share, source, queue, batch_size, instance_id).await;
                (worker, outcome)
            });
        }

        let mut fed = 0;
        let mut failures = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, WorkerOutcome { fed: n, failure })) => {
                    fed += n;
                    if let Some(failure) = failure {
                        error!(
                            instance_id = self.instance_id,
                            worker = failure.worker,
                            item = failure.item_id.as_deref().unwrap_or("-"),
                            error = %failure.error,
                            "harvest worker failed"
                        );
                        failures.push(failure);
                    }
                }
                Err(e) => {
                    error!(instance_id = self.instance_id, error = %e, "harvest worker panicked");
                    failures.push(WorkerFailure {
                        worker: usize::MAX,
                        item_id: None,
                        error: e.to_string(),
                    });
                }
            }
        }
        failures.sort_by_key(|f| f.worker);
        (fed, failures)
    }
}

struct WorkerOutcome {
    fed: usize,
    failure: Option<WorkerFailure>,
}

async fn run_worker<S: RemoteSource>(
    worker: usize,
    share: Vec<ItemRef>,
    source: Arc<S>,
    queue: Arc<dyn IndexingQueue>,
    batch_size: usize,
    instance_id: i64,
) -> WorkerOutcome {
    debug!(worker, items = share.len(), "worker parsing documents");
    let mut pending = Vec::with_capacity(batch_size);
    let mut fed = 0;

    for item in &share {
        let doc = match source
            .fetch_document(item, instance_id)
            .await
            .with_context(|| format!("fetching item {}", item.id))
        {
            Ok(doc) => doc,
            Err(e) => {
                return WorkerOutcome {
                    fed,
                    failure: Some(WorkerFailure {
                        worker,
                        item_id: Some(item.id.clone()),
                        error: format!("{:#}", e),
                    }),
                }
            }
        };
        pending.push(doc);

        if pending.len() >= batch_size {
            match flush(queue.as_ref(), &mut pending).await {
                Ok(n) => fed += n,
                Err(e) => return queue_failure(worker, fed, e),
            }
        }
    }

    match flush(queue.as_ref(), &mut pending).await {
        Ok(n) => fed += n,
        Err(e) => return queue_failure(worker, fed, e),
    }

    if fed > 0 {
        info!(worker, fed, "worker fed documents");
    }
    WorkerOutcome { fed, failure: None }
}

async fn flush(queue: &dyn IndexingQueue, pending: &mut Vec<Document>) -> anyhow::Result<usize> {
    if pending.is_empty() {
        return Ok(0);
    }
    let batch = std::mem::take(pending);
    let n = batch.len();
    queue.feed(batch).await?;
    Ok(n)
}

fn queue_failure(worker: usize, fed: usize, e: anyhow::Error) -> WorkerOutcome {
    WorkerOutcome {
        fed,
        failure: Some(WorkerFailure {
            worker,
            item_id: None,
            error: format!("{}", HarvestError::Queue(e)),
        }),
    }
}

#[async_trait]
impl<S: RemoteSource> Connector for Harvester<S> {
    async fn feed_new_documents(&self) -> Result<PassReport> {
        self.run_pass().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentType;
    use crate::queue::MemoryQueue;
    use chrono::{Duration, TimeZone};
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn item(id: &str, secs: i64) -> ItemRef {
        ItemRef {
            id: id.to_string(),
            container_label: "Space".to_string(),
            last_modified: ts(secs),
        }
    }

    #[derive(Default)]
    struct FakeSource {
        containers: Vec<Container>,
        items: HashMap<String, Vec<ItemRef>>,
        fail_container_calls: AtomicU32,
        list_item_calls: Mutex<Vec<(String, usize)>>,
        fetches: AtomicUsize,
        broken_items: HashSet<String>,
    }

    impl FakeSource {
        fn with_container(mut self, key: &str, label: &str, count: usize, secs: i64) -> Self {
            self.containers.push(Container {
                key: key.to_string(),
                label: label.to_string(),
            });
            let items = (0..count)
                .map(|i| ItemRef {
                    id: format!("{}-{}", key, i),
                    container_label: label.to_string(),
                    last_modified: ts(secs),
                })
                .collect();
            self.items.insert(key.to_string(), items);
            self
        }
    }

    #[async_trait]
    impl RemoteSource for FakeSource {
        async fn list_containers(&self) -> anyhow::Result<Vec<Container>> {
            let remaining = self.fail_container_calls.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_container_calls.store(remaining - 1, Ordering::SeqCst);
                anyhow::bail!("connection reset");
            }
            Ok(self.containers.clone())
        }

        async fn list_items(
            &self,
            container: &Container,
            start: usize,
            limit: usize,
        ) -> anyhow::Result<Vec<ItemRef>> {
            self.list_item_calls
                .lock()
                .unwrap()
                .push((container.key.clone(), start));
            let all = self.items.get(&container.key).cloned().unwrap_or_default();
            Ok(all.into_iter().skip(start).take(limit).collect())
        }

        async fn fetch_document(
            &self,
            item: &ItemRef,
            data_source_id: i64,
        ) -> anyhow::Result<Document> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.broken_items.contains(&item.id) {
                anyhow::bail!("500 Internal Server Error");
            }
            Ok(Document {
                title: item.id.clone(),
                content: "body".to_string(),
                author: None,
                author_image_url: None,
                timestamp: item.last_modified,
                source_id: item.id.clone(),
                data_source_id,
                location: item.container_label.clone(),
                url: format!("https://example.com/{}", item.id),
                doc_type: DocumentType::Document,
            })
        }
    }

    fn harvester(
        source: FakeSource,
        settings: HarvestSettings,
        since: Option<DateTime<Utc>>,
    ) -> (Harvester<FakeSource>, Arc<MemoryQueue>) {
        let queue = Arc::new(MemoryQueue::new());
        let ctx = ConnectorContext {
            instance_id: 7,
            config: serde_json::json!({}),
            watermark: Arc::new(Watermark::new(since)),
            queue: queue.clone(),
            settings,
        };
        (Harvester::new(source, &ctx), queue)
    }

    #[test]
    fn test_filter_is_inclusive_at_watermark() {
        let items = vec![item("old", -10), item("equal", 0), item("new", 10)];
        let kept = filter_by_watermark(items, ts(0));
        let ids: Vec<_> = kept.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["equal", "new"]);
    }

    #[test]
    fn test_partition_covers_every_item_once() {
        for n in 0..40 {
            for k in 1..12 {
                let shares = partition_round_robin((0..n).collect::<Vec<usize>>(), k);
                assert_eq!(shares.len(), k);
                let mut seen: Vec<usize> = shares.iter().flatten().copied().collect();
                seen.sort_unstable();
                assert_eq!(seen, (0..n).collect::<Vec<_>>(), "n={} k={}", n, k);
                for (w, share) in shares.iter().enumerate() {
                    assert!(share.iter().all(|i| i % k == w));
                }
            }
        }
    }

    #[test]
    fn test_partition_zero_workers_treated_as_one() {
        let shares = partition_round_robin(vec![1, 2, 3], 0);
        assert_eq!(shares, vec![vec![1, 2, 3]]);
    }

    #[tokio::test]
    async fn test_retry_recovers_within_budget() {
        let calls = AtomicU32::new(0);
        let out = with_retries(3, "probe", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                anyhow::bail!("flaky");
            }
            Ok(42)
        })
        .await
        .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_is_remote_transient() {
        let calls = AtomicU32::new(0);
        let err = with_retries(3, "probe", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(anyhow::anyhow!("down"))
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(
            err,
            HarvestError::RemoteTransient { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_pagination_stops_on_short_page() {
        let source = FakeSource::default().with_container("ENG", "Engineering", 210, 0);
        let (h, _) = harvester(source, HarvestSettings::default(), None);

        let container = h.source().containers[0].clone();
        let items = h.list_container_items(&container).await.unwrap();
        assert_eq!(items.len(), 210);
        assert!(items.iter().all(|i| i.container_label == "Engineering"));

        let calls = h.source().list_item_calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![("ENG".to_string(), 0), ("ENG".to_string(), 200)]
        );
    }

    #[tokio::test]
    async fn test_pass_feeds_every_candidate_across_batches() {
        let source = FakeSource::default()
            .with_container("A", "Alpha", 70, 10)
            .with_container("B", "Beta", 50, 10);
        let (h, queue) = harvester(source, HarvestSettings::default(), None);

        let report = h.run_pass().await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.containers, 2);
        assert_eq!(report.candidates, 120);
        assert_eq!(report.fed, 120);
        assert_eq!(queue.len(), 120);
        assert!(queue.batch_sizes().iter().all(|&n| n > 0 && n <= 50));

        let mut ids: Vec<_> = queue.documents().into_iter().map(|d| d.source_id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 120);
    }

    #[tokio::test]
    async fn test_small_batches_flush_at_threshold() {
        let source = FakeSource::default().with_container("A", "Alpha", 12, 10);
        let settings = HarvestSettings {
            workers: 2,
            batch_size: 5,
            ..Default::default()
        };
        let (h, queue) = harvester(source, settings, None);
        h.run_pass().await.unwrap();

        let mut sizes = queue.batch_sizes();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![1, 1, 5, 5]);
    }

    #[tokio::test]
    async fn test_pass_skips_items_older_than_watermark() {
        let source = FakeSource::default()
            .with_container("OLD", "Old", 30, -100)
            .with_container("NEW", "New", 4, 100);
        let (h, queue) = harvester(source, HarvestSettings::default(), Some(ts(0)));

        let report = h.run_pass().await.unwrap();
        assert_eq!(report.listed, 34);
        assert_eq!(report.candidates, 4);
        assert_eq!(queue.len(), 4);
        assert_eq!(h.source().fetches.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_container_listing_retried_then_fails_pass() {
        let source = FakeSource::default().with_container("A", "Alpha", 3, 0);
        source.fail_container_calls.store(5, Ordering::SeqCst);
        let (h, queue) = harvester(source, HarvestSettings::default(), None);

        let err = h.run_pass().await.unwrap_err();
        assert!(matches!(err, HarvestError::RemoteTransient { .. }));
        assert!(queue.is_empty());
        assert_eq!(h.source().fail_container_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_worker_failure_fails_pass_by_default() {
        let mut source = FakeSource::default().with_container("A", "Alpha", 20, 0);
        source.broken_items.insert("A-3".to_string());
        let (h, queue) = harvester(source, HarvestSettings::default(), None);

        let err = h.run_pass().await.unwrap_err();
        match err {
            HarvestError::WorkerFailure { failed, first, .. } => {
                assert_eq!(failed, 1);
                assert!(first.contains("A-3"));
            }
            other => panic!("unexpected error: {other}"),
        }
        // Siblings were not interrupted: worker 3 owned A-3 and A-13 only.
        assert_eq!(queue.len(), 18);
    }

    #[tokio::test]
    async fn test_worker_failure_can_be_logged_and_reported() {
        let mut source = FakeSource::default().with_container("A", "Alpha", 20, 0);
        source.broken_items.insert("A-3".to_string());
        let settings = HarvestSettings {
            on_worker_failure: WorkerFailurePolicy::LogAndContinue,
            ..Default::default()
        };
        let (h, _) = harvester(source, settings, None);

        let report = h.run_pass().await.unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].worker, 3);
        assert_eq!(report.failures[0].item_id.as_deref(), Some("A-3"));
        assert_eq!(report.fed, 18);
    }

    #[tokio::test]
    async fn test_pass_never_moves_watermark() {
        let source = FakeSource::default().with_container("A", "Alpha", 3, 0);
        let since = ts(-3600) - Duration::days(1);
        let (h, _) = harvester(source, HarvestSettings::default(), Some(since));
        h.run_pass().await.unwrap();
        assert_eq!(h.watermark.get(), since);
    }
}
