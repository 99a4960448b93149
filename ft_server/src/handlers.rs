//! HTTP request handlers.
//!
//! The write path follows a strict order so a crash at any point leaves
//! orphan blobs (harmless, swept at startup) rather than dangling links:
//! the body is fully staged and verified before any lock is taken, the
//! blob file is promoted before the link commit, and refcount-zero blob
//! files are unlinked only after the commit, under the digest lock, with
//! the refcount re-checked.

use axum::{
    body::Body,
    extract::{Path as UrlPath, Query, State},
    http::{HeaderMap, HeaderName, StatusCode, header},
    response::Response,
};
use ft_core::{Digest, FilePath, LinkRecord, Version};
use ft_db::{DeleteOutcome, PutOutcome};
use serde::Deserialize;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, info};

use crate::{
    AppState,
    error::{ApiError, ApiResult},
    locks::LockKey,
};

const LOGICAL_SIZE: HeaderName = HeaderName::from_static("logical-size");
const SHA256_CHECKSUM: HeaderName = HeaderName::from_static("sha256-checksum");

#[derive(Debug, Deserialize)]
pub struct VersionQuery {
    last_modified: Option<String>,
}

impl VersionQuery {
    /// The mandatory `last_modified` parameter of modifying and listing
    /// requests.
    fn required(&self) -> ApiResult<Version> {
        let raw = self
            .last_modified
            .as_deref()
            .ok_or_else(|| ApiError::BadRequest("missing last_modified parameter".into()))?;
        Ok(Version::parse_rfc2822(raw)?)
    }
}

// --- GET / HEAD ---

pub async fn get_file(
    State(state): State<AppState>,
    UrlPath(raw): UrlPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let path = FilePath::parse(&raw)?;
    match state.db.get(&path).await? {
        Some(record) => stream_blob(&state, &record, &headers).await,
        None => match &state.fallback {
            Some(fallback) => fallback.fetch(&raw, false).await,
            None => Err(ApiError::NotFound),
        },
    }
}

pub async fn head_file(
    State(state): State<AppState>,
    UrlPath(raw): UrlPath<String>,
) -> ApiResult<Response> {
    let path = FilePath::parse(&raw)?;
    match state.db.get(&path).await? {
        // Headers only; the blob file is never opened.
        Some(record) => link_response(&record)
            .header(header::CONTENT_LENGTH, record.logical_size)
            .body(Body::empty())
            .map_err(|err| ApiError::Internal(err.into())),
        None => match &state.fallback {
            Some(fallback) => fallback.fetch(&raw, true).await,
            None => Err(ApiError::NotFound),
        },
    }
}

fn link_response(record: &LinkRecord) -> axum::http::response::Builder {
    Response::builder()
        .status(StatusCode::OK)
        .header(LOGICAL_SIZE, record.logical_size)
        .header(header::LAST_MODIFIED, record.version.to_rfc2822())
        .header(header::ETAG, format!("\"{}\"", record.digest))
}

fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("gzip"))
}

async fn stream_blob(
    state: &AppState,
    record: &LinkRecord,
    headers: &HeaderMap,
) -> ApiResult<Response> {
    let (reader, stored_len) = state.store.open(&record.digest).await?;

    if record.compressed && accepts_gzip(headers) {
        // Stored bytes go out verbatim; the client inflates.
        return link_response(record)
            .header(header::CONTENT_ENCODING, "gzip")
            .header(header::CONTENT_LENGTH, stored_len)
            .body(Body::from_stream(ReaderStream::with_capacity(
                reader,
                ft_store::BUF_SIZE,
            )))
            .map_err(|err| ApiError::Internal(err.into()));
    }

    let builder = link_response(record);
    let body = if record.compressed {
        // Inflate on the fly for clients that did not ask for gzip.
        let decoder = async_compression::tokio::bufread::GzipDecoder::new(reader);
        Body::from_stream(ReaderStream::with_capacity(decoder, ft_store::BUF_SIZE))
    } else {
        Body::from_stream(ReaderStream::with_capacity(reader, ft_store::BUF_SIZE))
    };
    builder
        .header(header::CONTENT_LENGTH, record.logical_size)
        .body(body)
        .map_err(|err| ApiError::Internal(err.into()))
}

// --- PUT ---

pub async fn put_file(
    State(state): State<AppState>,
    UrlPath(raw): UrlPath<String>,
    Query(query): Query<VersionQuery>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<Response> {
    let path = FilePath::parse(&raw)?;
    let version = query.required()?;
    let body_gzipped = content_encoding_is_gzip(&headers)?;
    let expected_digest: Option<Digest> = match optional_header(&headers, &SHA256_CHECKSUM)? {
        Some(value) => Some(value.parse()?),
        None => None,
    };
    let expected_size: Option<u64> = match optional_header(&headers, &LOGICAL_SIZE)? {
        Some(value) => Some(
            value
                .parse()
                .map_err(|_| ApiError::BadRequest("invalid Logical-Size header".into()))?,
        ),
        None => None,
    };

    // Stage the whole body (decompress, hash, count, recompress in one
    // bounded-memory pass) before taking any lock: a slow client must not
    // stall writers on other paths.
    let reader = StreamReader::new(body.into_data_stream().map(|chunk| {
        chunk.map_err(std::io::Error::other)
    }));
    let staged = if body_gzipped {
        let decoder = async_compression::tokio::bufread::GzipDecoder::new(reader);
        stage_upload(&state, decoder).await?
    } else {
        stage_upload(&state, reader).await?
    };

    if let Some(expected) = expected_digest {
        if expected != staged.digest() {
            return Err(ApiError::BadRequest(format!(
                "checksum mismatch: body hashes to {}",
                staged.digest()
            )));
        }
    }
    if let Some(expected) = expected_size {
        if expected != staged.logical_size() {
            return Err(ApiError::BadRequest(format!(
                "size mismatch: body is {} bytes",
                staged.logical_size()
            )));
        }
    }

    let digest = staged.digest();
    let record = LinkRecord {
        digest,
        version,
        logical_size: staged.logical_size(),
        compressed: true,
    };

    // The digest lock spans promote through commit so no concurrent
    // refcount-zero unlink can remove the freshly promoted file before
    // the link referencing it is durable.
    let digest_guard = state.locks.acquire(LockKey::Digest(digest)).await;
    let created = state.store.promote(staged).await?;
    let outcome = {
        let _path_guard = state.locks.acquire(LockKey::Path(path.clone())).await;
        state.db.put_if_newer(&path, record).await?
    };

    let effective = match outcome {
        PutOutcome::Created => {
            info!("put {} ({} bytes, blob created: {created})", path, record.logical_size);
            version
        }
        PutOutcome::Replaced { orphaned } => {
            info!("put {} ({} bytes, replaced)", path, record.logical_size);
            drop(digest_guard);
            if let Some(old) = orphaned {
                unlink_if_unreferenced(&state, old).await?;
            }
            return version_response(version);
        }
        PutOutcome::Stale { current } => {
            debug!("put {} ignored, stored version is newer", path);
            // The upload lost the version race; if it also created the
            // blob file and nothing else took a reference meanwhile,
            // take the file back out.
            if created && state.db.refcount(&digest).await? == 0 {
                state.store.unlink(&digest).await?;
            }
            current
        }
    };

    version_response(effective)
}

async fn stage_upload(
    state: &AppState,
    reader: impl tokio::io::AsyncRead + Unpin,
) -> ApiResult<ft_store::StagedBlob> {
    state.store.stage(reader).await.map_err(|err| match err {
        // Undecodable request bodies are the client's fault.
        ft_store::StoreError::Io(io)
            if io.kind() == std::io::ErrorKind::InvalidData =>
        {
            ApiError::BadRequest("request body is not valid gzip".into())
        }
        other => other.into(),
    })
}

fn version_response(version: Version) -> ApiResult<Response> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::LAST_MODIFIED, version.to_rfc2822())
        .body(Body::empty())
        .map_err(|err| ApiError::Internal(err.into()))
}

fn content_encoding_is_gzip(headers: &HeaderMap) -> ApiResult<bool> {
    match optional_header(headers, &header::CONTENT_ENCODING)? {
        None => Ok(false),
        Some("gzip") => Ok(true),
        Some(other) => Err(ApiError::BadRequest(format!(
            "unsupported Content-Encoding: {other}"
        ))),
    }
}

fn optional_header<'h>(headers: &'h HeaderMap, name: &HeaderName) -> ApiResult<Option<&'h str>> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| ApiError::BadRequest(format!("malformed {name} header")))
        })
        .transpose()
}

// --- DELETE ---

pub async fn delete_file(
    State(state): State<AppState>,
    UrlPath(raw): UrlPath<String>,
    Query(query): Query<VersionQuery>,
) -> ApiResult<Response> {
    let path = FilePath::parse(&raw)?;
    let version = query.required()?;

    let outcome = {
        let _path_guard = state.locks.acquire(LockKey::Path(path.clone())).await;
        state.db.delete_if_newer(&path, version).await?
    };

    match outcome {
        DeleteOutcome::Missing => Err(ApiError::NotFound),
        DeleteOutcome::Stale { current } => {
            debug!("delete {} ignored, stored version is newer", path);
            version_response(current)
        }
        DeleteOutcome::Deleted { orphaned, version } => {
            info!("deleted {}", path);
            if let Some(digest) = orphaned {
                unlink_if_unreferenced(&state, digest).await?;
            }
            version_response(version)
        }
    }
}

/// Unlink a blob file whose refcount dropped to zero, unless another
/// request re-referenced the digest since the commit that orphaned it.
/// The re-check under the digest lock is what makes the race benign.
async fn unlink_if_unreferenced(state: &AppState, digest: Digest) -> ApiResult<()> {
    let _guard = state.locks.acquire(LockKey::Digest(digest)).await;
    if state.db.refcount(&digest).await? == 0 {
        state.store.unlink(&digest).await?;
    }
    Ok(())
}

// --- LIST ---

pub async fn list_files(
    State(state): State<AppState>,
    UrlPath(raw): UrlPath<String>,
    Query(query): Query<VersionQuery>,
) -> ApiResult<Response> {
    let path = FilePath::parse(&raw)?;
    list_response(&state, path.dir_prefix(), query.required()?)
}

/// `GET /list` without a path enumerates the whole store; the migration
/// tooling leans on this.
pub async fn list_root(
    State(state): State<AppState>,
    Query(query): Query<VersionQuery>,
) -> ApiResult<Response> {
    list_response(&state, "/".to_owned(), query.required()?)
}

fn list_response(state: &AppState, prefix: String, cutoff: Version) -> ApiResult<Response> {
    let entries = state.db.list(prefix, cutoff);
    let lines = ReceiverStream::new(entries).map(|entry| {
        entry
            .map(|mut line| {
                line.push('\n');
                bytes::Bytes::from(line)
            })
            .map_err(std::io::Error::other)
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from_stream(lines))
        .map_err(|err| ApiError::Internal(err.into()))
}

// --- Introspection ---

pub async fn version() -> String {
    format!("filetracker-server {}\n", env!("CARGO_PKG_VERSION"))
}

pub async fn status(State(state): State<AppState>) -> ApiResult<String> {
    let stats = state.db.stats().await?;
    Ok(format!("links: {}\nblobs: {}\n", stats.links, stats.blobs))
}
