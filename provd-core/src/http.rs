//! HTTP download surface for devices.
//!
//! Every request goes through the request-processing pipeline, then is
//! routed to the matched plugin's HTTP file service. The listener is
//! expected to sit behind a reverse proxy; a configurable trusted-proxy
//! count controls how many `X-Forwarded-For` hops are believed when
//! recovering the device's client IP.
//!
//! When url-key authentication is enabled, the first path segment is the
//! tenant's provisioning key; unknown keys are answered with a 404
//! before the pipeline runs.

use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tracing::{debug, info, warn};

use crate::app::ProvisioningApplication;
use crate::error::Result;
use crate::ident::{RequestInfo, RequestProcessingService};
use crate::security::log_security_msg;

/// A file-serving subtree used to answer a plugin's HTTP requests.
pub trait HttpFileService: Send + Sync {
    /// Normalize a request path before lookup.
    fn path_preprocess(&self, path: &str) -> String {
        path.to_string()
    }

    /// Map a request path to a local file, or `None` when the path does
    /// not resolve inside the served tree.
    fn resolve(&self, path: &str) -> Option<PathBuf>;
}

/// Serve files under a directory, refusing any path that would escape
/// it.
pub struct DirectoryHttpService {
    root: PathBuf,
}

impl DirectoryHttpService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl HttpFileService for DirectoryHttpService {
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let stripped = path.trim_start_matches('/');
        let mut resolved = self.root.clone();
        for component in Path::new(stripped).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(resolved)
    }
}

/// Shared state of the device download surface.
pub struct HttpServerState {
    pub app: Arc<ProvisioningApplication>,
    pub process_service: Arc<RequestProcessingService>,
    /// Number of `X-Forwarded-For` hops to believe.
    pub trusted_proxies: usize,
}

/// Build the axum router for the device download surface.
pub fn router(state: Arc<HttpServerState>) -> Router {
    Router::new().fallback(serve_device_file).with_state(state)
}

/// Serve the router on the given address until the task is cancelled.
pub async fn serve(addr: SocketAddr, state: Arc<HttpServerState>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_listener(listener, state).await
}

/// Serve the router on an already-bound listener.
pub async fn serve_listener(
    listener: tokio::net::TcpListener,
    state: Arc<HttpServerState>,
) -> Result<()> {
    info!("HTTP device server listening on {}", listener.local_addr()?);
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Recover the client IP, believing up to `trusted_proxies` forwarded
/// hops.
fn client_ip(headers: &HeaderMap, peer: SocketAddr, trusted_proxies: usize) -> String {
    if trusted_proxies > 0 {
        if let Some(forwarded) = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
        {
            let hops: Vec<&str> = forwarded
                .split(',')
                .map(str::trim)
                .filter(|hop| !hop.is_empty())
                .collect();
            if hops.len() >= trusted_proxies {
                return hops[hops.len() - trusted_proxies].to_string();
            }
        }
    }
    peer.ip().to_string()
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Nowhere to route this request.").into_response()
}

async fn serve_device_file(
    State(state): State<Arc<HttpServerState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let ip = client_ip(&headers, peer, state.trusted_proxies);
    let mut path = uri.path().to_string();
    info!("Processing HTTP request: {}", path);

    if state.app.use_provisioning_key() {
        let (key, rest) = match split_first_segment(&path) {
            Some(parts) => parts,
            None => return not_found(),
        };
        match state.app.tenant_from_provisioning_key(key) {
            Some(tenant_uuid) => {
                debug!("Provisioning key matched tenant {}", tenant_uuid);
                path = rest;
            }
            None => {
                log_security_msg(&format!("Invalid provisioning key from {ip}"));
                return not_found();
            }
        }
    }

    let request = RequestInfo::Http {
        ip: ip.clone(),
        path: path.clone(),
    };
    let (_device, pg_id) = state.process_service.process(&request).await;

    let Some(pg_id) = pg_id else {
        return not_found();
    };
    let Some(plugin) = state.app.pg_mgr().get(&pg_id) else {
        return not_found();
    };
    let Some(service) = plugin.http_service() else {
        return not_found();
    };

    if let Some(filename) = request.filename() {
        if plugin.is_sensitive_filename(filename) {
            log_security_msg(&format!("Sensitive file requested from {ip}: {filename}"));
        }
    }

    let rewritten = service.path_preprocess(&path);
    let Some(file_path) = service.resolve(&rewritten) else {
        return not_found();
    };
    match tokio::fs::read(&file_path).await {
        Ok(content) => {
            debug!("Serving {} from plugin {}", file_path.display(), pg_id);
            (
                StatusCode::OK,
                [("content-type", "application/octet-stream")],
                content,
            )
                .into_response()
        }
        Err(e) => {
            warn!("Could not serve {}: {}", file_path.display(), e);
            not_found()
        }
    }
}

fn split_first_segment(path: &str) -> Option<(&str, String)> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.split_once('/') {
        Some((first, rest)) => Some((first, format!("/{rest}"))),
        None => Some((trimmed, "/".to_string())),
    }
}
