//! Read-through fallback to a legacy origin.
//!
//! On a GET/HEAD miss the server can either bounce the client to the
//! origin with a 307 or fetch and re-stream the origin's response itself.
//! PUT and DELETE never come here, and nothing fetched through the
//! fallback lands in the local store; migration happens externally by
//! replaying uploads.

use axum::{
    body::Body,
    http::{HeaderName, StatusCode, header},
    response::Response,
};
use futures::TryStreamExt;
use tracing::debug;
use url::Url;

use crate::error::{ApiError, ApiResult};

const LOGICAL_SIZE: HeaderName = HeaderName::from_static("logical-size");

/// Response headers worth relaying from the origin.
const PASSTHROUGH: [HeaderName; 4] = [
    LOGICAL_SIZE,
    header::LAST_MODIFIED,
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackMode {
    /// 307 to `<base>/<path>`; the client follows.
    Redirect,
    /// Fetch from the origin and stream the body through.
    Proxy,
}

#[derive(Debug, Clone)]
pub struct FallbackProxy {
    base: Url,
    mode: FallbackMode,
    client: reqwest::Client,
}

impl FallbackProxy {
    pub fn new(base: Url, mode: FallbackMode) -> Self {
        FallbackProxy {
            base,
            mode,
            client: reqwest::Client::new(),
        }
    }

    fn target(&self, relative: &str) -> ApiResult<Url> {
        self.base
            .join(relative)
            .map_err(|err| ApiError::Upstream(format!("bad fallback target: {err}")))
    }

    /// Serve a local miss from the origin. `head` suppresses the body.
    pub async fn fetch(&self, relative: &str, head: bool) -> ApiResult<Response> {
        let target = self.target(relative)?;
        debug!("local miss, consulting fallback at {target}");

        match self.mode {
            FallbackMode::Redirect => Response::builder()
                .status(StatusCode::TEMPORARY_REDIRECT)
                .header(header::LOCATION, target.as_str())
                .body(Body::empty())
                .map_err(|err| ApiError::Internal(err.into())),
            FallbackMode::Proxy => {
                let request = if head {
                    self.client.head(target)
                } else {
                    self.client.get(target)
                };
                let origin = request
                    .send()
                    .await
                    .map_err(|err| ApiError::Upstream(err.to_string()))?;

                match origin.status() {
                    StatusCode::NOT_FOUND => Err(ApiError::NotFound),
                    status if status.is_success() => {
                        let mut response = Response::builder().status(StatusCode::OK);
                        for name in PASSTHROUGH {
                            if let Some(value) = origin.headers().get(&name) {
                                response = response.header(name, value);
                            }
                        }
                        let body = if head {
                            Body::empty()
                        } else {
                            Body::from_stream(
                                origin.bytes_stream().map_err(std::io::Error::other),
                            )
                        };
                        response
                            .body(body)
                            .map_err(|err| ApiError::Internal(err.into()))
                    }
                    status => Err(ApiError::Upstream(format!("origin returned {status}"))),
                }
            }
        }
    }
}
