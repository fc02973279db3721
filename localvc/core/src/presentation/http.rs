// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Smart HTTP transport.
//!
//! Every request below the base path passes the access filter first:
//! authenticate (401), resolve the locator (400) and authorize the requested
//! service (403/500). `info/refs` opens every fetch and push, so it is the
//! request that counts against the client's authentication limit (429) and
//! the one whose decision lands in the access log. The RPC that follows is
//! authorized again without a second log entry.

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json, Router};
use futures::{StreamExt, TryStreamExt};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::task::AbortHandle;
use tokio_util::io::{ReaderStream, StreamReader};
use tower_http::decompression::RequestDecompressionLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::domain::access::GitAccessError;
use crate::domain::identity::Identity;
use crate::domain::locator::RepositoryLocator;
use crate::infrastructure::protocol::{GitService, ProtocolError};
use crate::presentation::GitServices;

const INFO_REFS: &str = "/info/refs";
const UPLOAD_PACK_BUFFER: usize = 64 * 1024;

/// Set by the access filter for the git handlers.
#[derive(Debug, Clone)]
pub struct GitRequest {
    pub identity: Identity,
    pub locator: RepositoryLocator,
}

pub fn router(services: Arc<GitServices>) -> Router {
    let base = services.base_url.path().trim_end_matches('/').to_string();

    let git = Router::new()
        .route(&format!("{}/{{*path}}", base), get(get_git).post(post_git))
        .layer(middleware::from_fn_with_state(services.clone(), git_access_filter))
        .layer(RequestDecompressionLayer::new());

    Router::new()
        .route("/health", get(health))
        .merge(git)
        .layer(SetResponseHeaderLayer::overriding(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(services)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

/// Service a request asks for: the `service` query parameter on `info/refs`,
/// the last path segment on RPC requests.
fn requested_service(uri: &Uri) -> Option<GitService> {
    let path = uri.path();
    if path.ends_with(INFO_REFS) {
        let query = uri.query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == "service")
            .and_then(|(_, value)| GitService::from_name(&value))
    } else {
        let (_, endpoint) = path.rsplit_once('/')?;
        GitService::from_name(endpoint)
    }
}

async fn check_access(
    services: &GitServices,
    uri: &Uri,
    authorization: Option<&str>,
    peer: Option<IpAddr>,
) -> Result<GitRequest, GitAccessError> {
    let discovery = uri.path().ends_with(INFO_REFS);
    if discovery {
        services.auth_limiter.check(peer)?;
    }
    let identity = services.authenticator.authenticate_basic(authorization).await?;
    let locator = services.locate(uri.path())?;

    match requested_service(uri) {
        Some(service) if discovery => {
            services.authorize(&identity, &locator, service.action(), peer).await?;
        }
        Some(service) => {
            services
                .authorizer
                .authorize(&identity, &locator, service.action())
                .await?;
        }
        None if discovery => {
            return Err(GitAccessError::BadRequest(
                "missing or unsupported service parameter".to_string(),
            ));
        }
        None => {}
    }

    Ok(GitRequest { identity, locator })
}

async fn git_access_filter(
    State(services): State<Arc<GitServices>>,
    mut request: Request,
    next: Next,
) -> Response {
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    match check_access(&services, request.uri(), authorization.as_deref(), peer).await {
        Ok(git_request) => {
            request.extensions_mut().insert(git_request);
            next.run(request).await
        }
        Err(e) => {
            if authorization.is_some() {
                warn!("Denied {} {}: {}", request.method(), request.uri().path(), e);
            } else {
                debug!("Challenging anonymous request to {}", request.uri().path());
            }
            metrics::counter!("localvc_git_access_denied_total", "transport" => "http", "reason" => e.kind())
                .increment(1);
            access_error_response(&e)
        }
    }
}

fn access_error_response(error: &GitAccessError) -> Response {
    let status = StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let message = match error {
        GitAccessError::Internal(_) => "internal error".to_string(),
        other => other.to_string(),
    };
    (status, message).into_response()
}

fn protocol_error_response(error: &ProtocolError) -> Response {
    let status = match error {
        ProtocolError::RepositoryNotFound(_) => StatusCode::NOT_FOUND,
        ProtocolError::Malformed(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("Git protocol failure: {}", error);
    }
    (status, error.to_string()).into_response()
}

fn git_response(content_type: String, body: Body) -> Response {
    let headers: [(HeaderName, String); 4] = [
        (header::CONTENT_TYPE, content_type),
        (header::CACHE_CONTROL, "no-cache, max-age=0, must-revalidate".to_string()),
        (header::PRAGMA, "no-cache".to_string()),
        (header::EXPIRES, "Fri, 01 Jan 1980 00:00:00 GMT".to_string()),
    ];
    (StatusCode::OK, headers, body).into_response()
}

fn body_reader(body: Body) -> impl AsyncRead + Send + Unpin + 'static {
    StreamReader::new(body.into_data_stream().map_err(std::io::Error::other))
}

/// Aborts a task once the response body that streams its output is dropped.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn get_git(
    State(services): State<Arc<GitServices>>,
    Extension(git): Extension<GitRequest>,
    uri: Uri,
) -> Response {
    if !uri.path().ends_with(INFO_REFS) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let Some(service) = requested_service(&uri) else {
        return (StatusCode::BAD_REQUEST, "unsupported service").into_response();
    };
    metrics::counter!("localvc_git_requests_total", "transport" => "http", "service" => service.name())
        .increment(1);

    let repository = match services.store.open(&git.locator) {
        Ok(repository) => repository,
        Err(e) => return protocol_error_response(&e),
    };
    match services.engine.http_advertisement(&repository.path, service).await {
        Ok(advertisement) => git_response(
            format!("application/x-{}-advertisement", service.name()),
            Body::from(advertisement),
        ),
        Err(e) => protocol_error_response(&e),
    }
}

async fn post_git(
    State(services): State<Arc<GitServices>>,
    Extension(git): Extension<GitRequest>,
    request: Request,
) -> Response {
    let Some(service) = requested_service(request.uri()).filter(|_| !request.uri().path().ends_with(INFO_REFS)) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    metrics::counter!("localvc_git_requests_total", "transport" => "http", "service" => service.name())
        .increment(1);

    let repository = match services.store.open(&git.locator) {
        Ok(repository) => repository,
        Err(e) => return protocol_error_response(&e),
    };
    let mut input = body_reader(request.into_body());
    let content_type = format!("application/x-{}-result", service.name());

    match service {
        GitService::UploadPack => {
            let (mut writer, reader) = tokio::io::duplex(UPLOAD_PACK_BUFFER);
            let path: PathBuf = repository.path;
            let services = services.clone();
            let task = tokio::spawn(async move {
                if let Err(e) = services.engine.upload_pack(&path, &mut input, &mut writer, true).await {
                    warn!("upload-pack for {} failed: {}", git.locator, e);
                }
            });
            let guard = AbortOnDrop(task.abort_handle());
            let stream = ReaderStream::new(reader).map(move |chunk| {
                let _guard = &guard;
                chunk
            });
            git_response(content_type, Body::from_stream(stream))
        }
        GitService::ReceivePack => {
            let mut output = Vec::new();
            match services.receive_pack(&repository, &mut input, &mut output, false).await {
                Ok(report) => {
                    debug!(
                        "{} pushed {} command(s) to {}",
                        git.identity.login,
                        report.commands.len(),
                        git.locator
                    );
                    git_response(content_type, Body::from(output))
                }
                Err(e) => protocol_error_response(&e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_service() {
        let uri: Uri = "/git/PROG1/eist24/ab12cde.git/info/refs?service=git-receive-pack".parse().unwrap();
        assert_eq!(requested_service(&uri), Some(GitService::ReceivePack));

        let uri: Uri = "/git/PROG1/eist24/ab12cde.git/git-upload-pack".parse().unwrap();
        assert_eq!(requested_service(&uri), Some(GitService::UploadPack));

        let uri: Uri = "/git/PROG1/eist24/ab12cde.git/info/refs".parse().unwrap();
        assert_eq!(requested_service(&uri), None);

        let uri: Uri = "/git/PROG1/eist24/ab12cde.git/info/refs?service=git-upload-archive".parse().unwrap();
        assert_eq!(requested_service(&uri), None);
    }

    #[tokio::test]
    async fn test_dropping_guard_aborts_task() {
        let task = tokio::spawn(std::future::pending::<()>());
        drop(AbortOnDrop(task.abort_handle()));
        assert!(task.await.unwrap_err().is_cancelled());
    }

    #[test]
    fn test_internal_errors_are_not_leaked() {
        let response = access_error_response(&GitAccessError::Internal("db down".to_string()));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = access_error_response(&GitAccessError::Authentication("no header".to_string()));
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = access_error_response(&GitAccessError::RateLimited("slow down".to_string()));
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
