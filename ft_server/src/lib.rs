//! The filetracker server engine.
//!
//! This crate wires the storage components into an HTTP service:
//!
//! - **Blob store** ([`ft_store::BlobStore`]): content-addressed gzip
//!   files, staged writes, atomic promotion.
//! - **Link database** ([`ft_db::LinkDb`]): transactional path → blob
//!   index with per-digest reference counts.
//! - **Lock manager** ([`locks::LockManager`]): per-path and per-digest
//!   exclusion for modifying operations; readers go lock-free through
//!   the database's transactional snapshots.
//! - **Fallback proxy** ([`fallback::FallbackProxy`]): optional
//!   read-through to a legacy origin during migration.
//!
//! The HTTP surface:
//!
//! | Verb | Path | Notes |
//! |---|---|---|
//! | GET/HEAD | `/files/{path}` | gzip negotiation, `Logical-Size`, `Last-Modified`, `ETag` |
//! | PUT | `/files/{path}?last_modified=` | gzip body, checksum/size verification |
//! | DELETE | `/files/{path}?last_modified=` | version-guarded |
//! | GET | `/list[/{path}]?last_modified=` | newline-separated relative paths |
//! | GET | `/version`, `/status` | introspection |
//!
//! This crate is primarily used by the `ft_cli` binary but can be
//! embedded: build an [`AppState`] and hand [`router`] to any hyper
//! server, or call [`serve`].

use std::{net::SocketAddr, path::Path};

use anyhow::Context;
use axum::{
    Router,
    routing::{MethodFilter, get, on},
};
use tracing::info;

pub mod error;
pub mod fallback;
pub mod handlers;
pub mod locks;
pub mod sweep;

pub use fallback::{FallbackMode, FallbackProxy};
pub use sweep::sweep_orphans;

/// Process-wide state shared by all handlers. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub db: ft_db::LinkDb,
    pub store: ft_store::BlobStore,
    pub locks: locks::LockManager,
    pub fallback: Option<FallbackProxy>,
}

impl AppState {
    /// Open (or create) a data directory: `<root>/blobs`, `<root>/staging`
    /// and `<root>/db`. Leftover staging files from a previous process are
    /// removed.
    pub fn open(root: impl AsRef<Path>, fallback: Option<FallbackProxy>) -> anyhow::Result<Self> {
        let root = root.as_ref();
        let store = ft_store::BlobStore::open(root)
            .with_context(|| format!("open blob store under {root:?}"))?;
        let removed = store.clear_staging().context("clear staging directory")?;
        if removed > 0 {
            info!("removed {removed} stale staging files");
        }
        let db = ft_db::LinkDb::open(root.join("db"))
            .with_context(|| format!("open link database under {root:?}"))?;

        Ok(AppState {
            db,
            store,
            locks: locks::LockManager::new(),
            fallback,
        })
    }
}

pub fn router(state: AppState) -> Router {
    // GET and HEAD are registered separately: HEAD answers from the link
    // database alone and must not open the blob file.
    let files = on(MethodFilter::GET, handlers::get_file)
        .on(MethodFilter::HEAD, handlers::head_file)
        .put(handlers::put_file)
        .delete(handlers::delete_file);

    Router::new()
        .route("/files/{*path}", files)
        .route("/list", get(handlers::list_root))
        .route("/list/{*path}", get(handlers::list_files))
        .route("/version", get(handlers::version))
        .route("/status", get(handlers::status))
        .with_state(state)
}

/// Bind and serve until ctrl-c.
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
        .context("http server failed")
}
