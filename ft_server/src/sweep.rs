//! Startup orphan sweep.
//!
//! The link database is the source of truth: no operation creates a link
//! without a committed refcount bump, so any blob file whose digest has no
//! live refcount is garbage left by a crash between promote and commit.
//! Sweeping is safe to skip and safe to repeat.

use anyhow::Context;
use ft_db::LinkDb;
use ft_store::BlobStore;
use tracing::{info, warn};

use crate::locks::{LockKey, LockManager};

#[derive(Debug, Default)]
pub struct SweepReport {
    pub scanned: usize,
    pub kept: usize,
    pub removed: usize,
}

pub async fn sweep_orphans(
    db: &LinkDb,
    store: &BlobStore,
    locks: &LockManager,
) -> anyhow::Result<SweepReport> {
    let scanner = store.clone();
    let digests = tokio::task::spawn_blocking(move || scanner.scan_blobs())
        .await
        .context("blob scan task failed")?;

    let mut report = SweepReport {
        scanned: digests.len(),
        ..SweepReport::default()
    };

    for digest in digests {
        // Same discipline as the request path: decide under the digest
        // lock, re-reading the refcount after taking it.
        let _guard = locks.acquire(LockKey::Digest(digest)).await;
        if db.refcount(&digest).await? > 0 {
            report.kept += 1;
            continue;
        }
        match store.unlink(&digest).await {
            Ok(()) => report.removed += 1,
            Err(err) => warn!("sweep failed to unlink {}: {err}", digest.fmt_short()),
        }
    }

    info!(
        "blob sweep: {} scanned, {} kept, {} removed",
        report.scanned, report.kept, report.removed
    );
    Ok(report)
}
