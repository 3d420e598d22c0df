//! Sync orchestration.
//!
//! Runs harvesting passes for registry instances and owns the one rule the
//! passes themselves never apply: the watermark only advances, to the time
//! the pass *started*, after a pass in which every worker finished. A failed,
//! partial, or timed-out pass leaves it where it was, so the next pass
//! re-scans the same window.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::error::{HarvestError, Result};
use crate::harvest::PassReport;
use crate::registry::ConnectorRegistry;

/// Result of syncing one instance.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub instance_id: i64,
    pub started_at: DateTime<Utc>,
    pub report: PassReport,
    /// The new watermark, or `None` when the pass was partial.
    pub advanced_to: Option<DateTime<Utc>>,
}

/// Run one pass for instance `id` and advance its watermark on success.
pub async fn sync_instance(registry: &ConnectorRegistry, id: i64) -> Result<SyncOutcome> {
    let instance = registry.get(id).await?;
    let started_at = Utc::now();

    let pass = instance.feed_new_documents();
    let report = match registry.settings().pass_timeout_secs {
        Some(secs) => tokio::time::timeout(Duration::from_secs(secs), pass)
            .await
            .map_err(|_| HarvestError::Timeout {
                instance_id: id,
                secs,
            })??,
        None => pass.await?,
    };

    let advanced_to = if report.is_clean() {
        Some(registry.record_sync(id, started_at).await?)
    } else {
        warn!(
            instance_id = id,
            failed_workers = report.failures.len(),
            "partial pass, watermark not advanced"
        );
        None
    };

    info!(
        instance_id = id,
        type_name = instance.type_name(),
        candidates = report.candidates,
        fed = report.fed,
        "sync finished"
    );

    Ok(SyncOutcome {
        instance_id: id,
        started_at,
        report,
        advanced_to,
    })
}

/// Sync every persisted instance in id order. One instance failing does
/// not stop the others; instances that could not be loaded are reported
/// as [`HarvestError::Unloadable`].
pub async fn sync_all(registry: &ConnectorRegistry) -> Result<Vec<(i64, Result<SyncOutcome>)>> {
    let mut ids: Vec<i64> = registry.list().await?.iter().map(|i| i.id()).collect();
    ids.extend(registry.list_unloadable().await?.iter().map(|u| u.id));
    ids.sort_unstable();
    let mut results = Vec::with_capacity(ids.len());

    for id in ids {
        let outcome = sync_instance(registry, id).await;
        if let Err(e) = &outcome {
            error!(instance_id = id, error = %e, "sync failed");
        }
        results.push((id, outcome));
    }

    Ok(results)
}
