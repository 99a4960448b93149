//! Startup sweep: orphan blob files go, referenced ones stay.

use ft_core::{FilePath, LinkRecord, Version};
use ft_server::{AppState, sweep_orphans};

#[tokio::test]
async fn sweep_removes_unreferenced_blobs_only() {
    let dir = tempfile::tempdir().unwrap();
    let state = AppState::open(dir.path(), None).unwrap();

    // A live blob: staged, promoted, linked.
    let staged = state.store.stage(&b"linked payload"[..]).await.unwrap();
    let live = staged.digest();
    let record = LinkRecord {
        digest: live,
        version: Version::from_timestamp(100),
        logical_size: staged.logical_size(),
        compressed: true,
    };
    state.store.promote(staged).await.unwrap();
    state
        .db
        .put_if_newer(&FilePath::parse("kept").unwrap(), record)
        .await
        .unwrap();

    // An orphan: promoted but never linked, as a crash between promote
    // and commit leaves it.
    let staged = state.store.stage(&b"orphan payload"[..]).await.unwrap();
    let orphan = staged.digest();
    state.store.promote(staged).await.unwrap();

    let report = sweep_orphans(&state.db, &state.store, &state.locks)
        .await
        .unwrap();
    assert_eq!(report.scanned, 2);
    assert_eq!(report.kept, 1);
    assert_eq!(report.removed, 1);

    assert!(state.store.exists(&live).await.unwrap());
    assert!(!state.store.exists(&orphan).await.unwrap());

    // Sweeping again is a no-op.
    let report = sweep_orphans(&state.db, &state.store, &state.locks)
        .await
        .unwrap();
    assert_eq!((report.scanned, report.kept, report.removed), (1, 1, 0));
}
