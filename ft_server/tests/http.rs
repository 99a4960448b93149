//! End-to-end HTTP behavior: round-trips, version races, dedup
//! accounting, fallback modes.

use std::io::Write;

use axum_test::TestServer;
use flate2::{Compression, write::GzEncoder};
use ft_server::{AppState, FallbackMode, FallbackProxy, router};

const V1: &str = "Mon, 01 Jan 2024 00:00:00 +0000";
const V0: &str = "Sun, 31 Dec 2023 23:59:59 +0000";
const V2: &str = "Tue, 02 Jan 2024 00:00:00 +0000";

const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

fn gzip(payload: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload).unwrap();
    encoder.finish().unwrap()
}

fn fixture() -> (tempfile::TempDir, AppState, TestServer) {
    let dir = tempfile::tempdir().unwrap();
    let state = AppState::open(dir.path(), None).unwrap();
    let server = TestServer::new(router(state.clone())).unwrap();
    (dir, state, server)
}

fn header<'r>(response: &'r axum_test::TestResponse, name: &str) -> &'r str {
    response
        .headers()
        .get(name)
        .unwrap_or_else(|| panic!("missing {name} header"))
        .to_str()
        .unwrap()
}

#[tokio::test]
async fn put_then_get_round_trip() {
    let (_dir, _state, server) = fixture();

    let response = server
        .put("/files/x/y")
        .add_query_param("last_modified", V1)
        .add_header("content-encoding", "gzip")
        .add_header("sha256-checksum", HELLO_SHA256)
        .add_header("logical-size", "5")
        .bytes(gzip(b"hello").into())
        .await;
    response.assert_status_ok();
    assert_eq!(header(&response, "last-modified"), V1);

    let response = server.get("/files/x/y").await;
    response.assert_status_ok();
    assert_eq!(response.as_bytes().as_ref(), b"hello");
    assert_eq!(header(&response, "last-modified"), V1);
    assert_eq!(header(&response, "logical-size"), "5");
    assert_eq!(header(&response, "etag"), format!("\"{HELLO_SHA256}\""));
}

#[tokio::test]
async fn stale_put_is_a_noop_with_the_stored_version() {
    let (_dir, state, server) = fixture();

    server
        .put("/files/x/y")
        .add_query_param("last_modified", V1)
        .add_header("content-encoding", "gzip")
        .bytes(gzip(b"hello").into())
        .await
        .assert_status_ok();

    // An older client replays with different content; nothing changes.
    let response = server
        .put("/files/x/y")
        .add_query_param("last_modified", V0)
        .add_header("content-encoding", "gzip")
        .bytes(gzip(b"outdated").into())
        .await;
    response.assert_status_ok();
    assert_eq!(header(&response, "last-modified"), V1);

    let response = server.get("/files/x/y").await;
    assert_eq!(response.as_bytes().as_ref(), b"hello");

    // The losing upload's blob did not stick around.
    assert_eq!(state.store.scan_blobs().len(), 1);
}

#[tokio::test]
async fn repeated_identical_put_changes_nothing() {
    let (_dir, state, server) = fixture();

    for _ in 0..2 {
        server
            .put("/files/p")
            .add_query_param("last_modified", V1)
            .add_header("content-encoding", "gzip")
            .bytes(gzip(b"idempotent").into())
            .await
            .assert_status_ok();
    }

    assert_eq!(state.store.scan_blobs().len(), 1);
    let stats = state.db.stats().await.unwrap();
    assert_eq!((stats.links, stats.blobs), (1, 1));
}

#[tokio::test]
async fn checksum_mismatch_rejects_and_leaves_no_trace() {
    let (_dir, state, server) = fixture();

    let response = server
        .put("/files/a")
        .add_query_param("last_modified", V1)
        .add_header("content-encoding", "gzip")
        .add_header("sha256-checksum", HELLO_SHA256)
        .bytes(gzip(b"world").into())
        .await;
    response.assert_status_bad_request();

    server.get("/files/a").await.assert_status_not_found();
    assert!(state.store.scan_blobs().is_empty());
    assert_eq!(state.db.stats().await.unwrap().links, 0);
    assert_eq!(state.store.clear_staging().unwrap(), 0);
}

#[tokio::test]
async fn size_mismatch_rejects() {
    let (_dir, _state, server) = fixture();

    server
        .put("/files/a")
        .add_query_param("last_modified", V1)
        .add_header("content-encoding", "gzip")
        .add_header("logical-size", "99")
        .bytes(gzip(b"five!").into())
        .await
        .assert_status_bad_request();
}

#[tokio::test]
async fn put_requires_a_parseable_version() {
    let (_dir, _state, server) = fixture();

    server
        .put("/files/a")
        .bytes(gzip(b"x").into())
        .await
        .assert_status_bad_request();

    server
        .put("/files/a")
        .add_query_param("last_modified", "not-a-date")
        .bytes(gzip(b"x").into())
        .await
        .assert_status_bad_request();
}

#[tokio::test]
async fn illegal_path_segments_are_rejected() {
    let (_dir, _state, server) = fixture();

    // Encoded so the HTTP client does not normalize the dot segment away
    // before the server sees it.
    server
        .get("/files/a/%2E%2E/b")
        .await
        .assert_status_bad_request();

    server
        .get("/files/a%20b/c")
        .await
        .assert_status_bad_request();
}

#[tokio::test]
async fn uncompressed_put_and_gzip_negotiation() {
    let (_dir, _state, server) = fixture();

    // Raw body, no Content-Encoding.
    server
        .put("/files/raw")
        .add_query_param("last_modified", V1)
        .bytes(b"plain payload".to_vec().into())
        .await
        .assert_status_ok();

    // Client without gzip support gets identity bytes.
    let response = server.get("/files/raw").await;
    assert_eq!(response.as_bytes().as_ref(), b"plain payload");
    assert!(response.headers().get("content-encoding").is_none());
}

#[tokio::test]
async fn gzip_capable_client_gets_stored_bytes_verbatim() {
    use std::io::Read;

    let (_dir, _state, server) = fixture();

    server
        .put("/files/z")
        .add_query_param("last_modified", V1)
        .add_header("content-encoding", "gzip")
        .bytes(gzip(b"negotiated").into())
        .await
        .assert_status_ok();

    let response = server
        .get("/files/z")
        .add_header("accept-encoding", "gzip")
        .await;
    response.assert_status_ok();
    assert_eq!(header(&response, "content-encoding"), "gzip");

    let mut decoder = flate2::read::GzDecoder::new(response.as_bytes().as_ref());
    let mut payload = Vec::new();
    decoder.read_to_end(&mut payload).unwrap();
    assert_eq!(payload, b"negotiated");
}

#[tokio::test]
async fn invalid_gzip_body_is_a_bad_request() {
    let (_dir, state, server) = fixture();

    server
        .put("/files/broken")
        .add_query_param("last_modified", V1)
        .add_header("content-encoding", "gzip")
        .bytes(b"definitely not gzip".to_vec().into())
        .await
        .assert_status_bad_request();

    assert_eq!(state.store.clear_staging().unwrap(), 0);
}

#[tokio::test]
async fn head_reports_metadata_without_a_body() {
    let (_dir, _state, server) = fixture();

    server
        .put("/files/h")
        .add_query_param("last_modified", V1)
        .add_header("content-encoding", "gzip")
        .bytes(gzip(b"head me").into())
        .await
        .assert_status_ok();

    let response = server.method(axum::http::Method::HEAD, "/files/h").await;
    response.assert_status_ok();
    assert_eq!(header(&response, "logical-size"), "7");
    assert_eq!(header(&response, "last-modified"), V1);
    assert!(response.as_bytes().is_empty());

    server
        .method(axum::http::Method::HEAD, "/files/absent")
        .await
        .assert_status_not_found();
}

#[tokio::test]
async fn dedup_shares_one_blob_across_paths() {
    let (_dir, state, server) = fixture();

    for path in ["/files/a/b", "/files/a/c"] {
        server
            .put(path)
            .add_query_param("last_modified", V1)
            .add_header("content-encoding", "gzip")
            .bytes(gzip(b"shared payload").into())
            .await
            .assert_status_ok();
    }
    assert_eq!(state.store.scan_blobs().len(), 1);

    let response = server
        .get("/list/a")
        .add_query_param("last_modified", V2)
        .await;
    response.assert_status_ok();
    let mut lines: Vec<&str> = response.text().lines().collect();
    lines.sort_unstable();
    assert_eq!(lines, vec!["b", "c"]);

    // Deleting one path keeps the shared blob alive.
    server
        .delete("/files/a/b")
        .add_query_param("last_modified", V1)
        .await
        .assert_status_ok();
    server.get("/files/a/c").await.assert_status_ok();
    assert_eq!(state.store.scan_blobs().len(), 1);

    // Deleting the last reference removes it.
    server
        .delete("/files/a/c")
        .add_query_param("last_modified", V1)
        .await
        .assert_status_ok();
    assert!(state.store.scan_blobs().is_empty());
}

#[tokio::test]
async fn delete_is_version_guarded() {
    let (_dir, _state, server) = fixture();

    server
        .delete("/files/nothing")
        .add_query_param("last_modified", V1)
        .await
        .assert_status_not_found();

    server
        .put("/files/f")
        .add_query_param("last_modified", V1)
        .add_header("content-encoding", "gzip")
        .bytes(gzip(b"keep me").into())
        .await
        .assert_status_ok();

    // Older delete retains the link and reports the stored version.
    let response = server
        .delete("/files/f")
        .add_query_param("last_modified", V0)
        .await;
    response.assert_status_ok();
    assert_eq!(header(&response, "last-modified"), V1);
    server.get("/files/f").await.assert_status_ok();

    // Equal-version delete wins.
    server
        .delete("/files/f")
        .add_query_param("last_modified", V1)
        .await
        .assert_status_ok();
    server.get("/files/f").await.assert_status_not_found();
}

#[tokio::test]
async fn list_requires_cutoff_and_filters_by_it() {
    let (_dir, _state, server) = fixture();

    server.get("/list/a").await.assert_status_bad_request();

    server
        .put("/files/a/old")
        .add_query_param("last_modified", V0)
        .add_header("content-encoding", "gzip")
        .bytes(gzip(b"old").into())
        .await
        .assert_status_ok();
    server
        .put("/files/a/new")
        .add_query_param("last_modified", V2)
        .add_header("content-encoding", "gzip")
        .bytes(gzip(b"new").into())
        .await
        .assert_status_ok();

    // Only entries strictly older than the cutoff appear.
    let response = server
        .get("/list/a")
        .add_query_param("last_modified", V1)
        .await;
    assert_eq!(response.text(), "old\n");

    // Root listing sees everything under the cutoff.
    let response = server
        .get("/list")
        .add_query_param("last_modified", V2)
        .await;
    assert_eq!(response.text(), "a/old\n");
}

#[tokio::test]
async fn concurrent_same_path_puts_serialize() {
    let (_dir, state, server) = fixture();
    let server = std::sync::Arc::new(server);

    let mut tasks = Vec::new();
    for secs in [100, 200, 300, 400] {
        let server = server.clone();
        let version = ft_core::Version::from_timestamp(secs).to_rfc2822();
        let body = gzip(format!("payload at {secs}").as_bytes());
        tasks.push(tokio::spawn(async move {
            server
                .put("/files/contended")
                .add_query_param("last_modified", &version)
                .add_header("content-encoding", "gzip")
                .bytes(body.into())
                .await
                .assert_status_ok();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // Whatever the arrival order, the newest version wins and only its
    // blob survives.
    let response = server.get("/files/contended").await;
    assert_eq!(response.as_bytes().as_ref(), b"payload at 400");
    assert_eq!(state.store.scan_blobs().len(), 1);
    let stats = state.db.stats().await.unwrap();
    assert_eq!((stats.links, stats.blobs), (1, 1));
}

#[tokio::test]
async fn version_and_status_endpoints() {
    let (_dir, _state, server) = fixture();

    let response = server.get("/version").await;
    response.assert_status_ok();
    assert!(response.text().starts_with("filetracker-server "));

    let response = server.get("/status").await;
    response.assert_status_ok();
    assert_eq!(response.text(), "links: 0\nblobs: 0\n");
}

// --- fallback ---

async fn spawn_origin() -> std::net::SocketAddr {
    use axum::{Router, http::header, routing::get};

    let origin = Router::new().route(
        "/old/file",
        get(|| async {
            (
                [
                    (header::LAST_MODIFIED, V0),
                    (header::CONTENT_TYPE, "application/octet-stream"),
                ],
                "legacy bytes",
            )
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, origin).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn fallback_redirect_points_at_the_origin() {
    let dir = tempfile::tempdir().unwrap();
    let fallback = FallbackProxy::new(
        url::Url::parse("http://legacy.internal:9000/").unwrap(),
        FallbackMode::Redirect,
    );
    let state = AppState::open(dir.path(), Some(fallback)).unwrap();
    let server = TestServer::new(router(state)).unwrap();

    let response = server.get("/files/old/file").await;
    response.assert_status(axum::http::StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        header(&response, "location"),
        "http://legacy.internal:9000/old/file"
    );
}

#[tokio::test]
async fn fallback_proxy_streams_the_origin_and_local_wins_after_migration() {
    let origin = spawn_origin().await;
    let dir = tempfile::tempdir().unwrap();
    let fallback = FallbackProxy::new(
        url::Url::parse(&format!("http://{origin}/")).unwrap(),
        FallbackMode::Proxy,
    );
    let state = AppState::open(dir.path(), Some(fallback)).unwrap();
    let server = TestServer::new(router(state)).unwrap();

    // Local miss streams through from the origin.
    let response = server.get("/files/old/file").await;
    response.assert_status_ok();
    assert_eq!(response.text(), "legacy bytes");
    assert_eq!(header(&response, "last-modified"), V0);

    // Origin misses stay a plain 404.
    server.get("/files/old/other").await.assert_status_not_found();

    // After the migration replays the PUT, the local copy is served.
    server
        .put("/files/old/file")
        .add_query_param("last_modified", V1)
        .add_header("content-encoding", "gzip")
        .bytes(gzip(b"migrated bytes").into())
        .await
        .assert_status_ok();
    let response = server.get("/files/old/file").await;
    assert_eq!(response.as_bytes().as_ref(), b"migrated bytes");
    assert_eq!(header(&response, "last-modified"), V1);
}
