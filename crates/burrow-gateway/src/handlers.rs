//! Public HTTP surface: routing and tunnel dispatch.
//!
//! Two forwarding entry points share one downstream path: the `/proxy/<sub>`
//! form for setups without wildcard DNS, and the Host-header form for
//! `<sub>.<domain>` requests. Both end in [`dispatch`], which opens a fresh
//! stream on the session's multiplexer, writes one request frame, and reads
//! one response frame.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine as _;
use burrow_core::protocol::{trace_header, RequestFrame, ResponseFrame, TRACE_HEADER};
use burrow_core::new_trace_id;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE, HOST, RETRY_AFTER};
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::blob::BlobStore;
use crate::ratelimit::RateLimiter;
use crate::registry::SessionRegistry;
use crate::server;

/// Largest accepted share-blob ciphertext.
const MAX_BLOB_SIZE: usize = 10 * 1024 * 1024;

/// Shared gateway state threaded through every handler.
pub(crate) struct GatewayState {
    pub domain: String,
    pub version: String,
    pub registry: SessionRegistry,
    pub limiter: RateLimiter,
    pub blobs: Option<Arc<dyn BlobStore>>,
}

pub(crate) async fn handle(
    req: Request<Incoming>,
    state: Arc<GatewayState>,
) -> Response<Full> {
    let path = req.uri().path().to_string();
    match path.as_str() {
        "/connect" => server::handle_connect(req, state),
        "/health" => handle_health(&state),
        "/api/share" => handle_share(req, &state).await,
        "/api/rate-limits" => handle_rate_limits(&req, &state),
        _ if path.starts_with("/proxy/") => handle_proxy(req, state).await,
        _ if path.starts_with("/api/blob/") => handle_get_blob(&path, &state),
        _ => handle_host_dispatch(req, state).await,
    }
}

type Full = http_body_util::Full<Bytes>;

pub(crate) fn text_response(status: StatusCode, message: &str) -> Response<Full> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(format!("{message}\n"))))
        .expect("valid response builder")
}

fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<Full> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(value.to_string())))
        .expect("valid response builder")
}

fn json_error(status: StatusCode, message: &str) -> Response<Full> {
    json_response(status, &json!({ "error": message }))
}

fn handle_health(state: &GatewayState) -> Response<Full> {
    json_response(
        StatusCode::OK,
        &json!({
            "ok": true,
            "time": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "version": state.version,
        }),
    )
}

fn handle_rate_limits(req: &Request<Incoming>, state: &GatewayState) -> Response<Full> {
    if req.method() != Method::GET {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }
    let (requests_per_min, max_conns) = state.limiter.limits();
    json_response(
        StatusCode::OK,
        &json!({
            "requests_per_min": requests_per_min,
            "max_concurrent_conns": max_conns,
        }),
    )
}

/// `/proxy/<sub>/<rest>`: path-based forwarding for setups without
/// wildcard DNS.
async fn handle_proxy(req: Request<Incoming>, state: Arc<GatewayState>) -> Response<Full> {
    let path = req.uri().path().to_string();
    let rest = path.strip_prefix("/proxy/").unwrap_or("");
    let (subdomain, target_path) = match rest.split_once('/') {
        Some((sub, tail)) => (sub.to_string(), format!("/{tail}")),
        None => (rest.to_string(), "/".to_string()),
    };
    if subdomain.is_empty() {
        return text_response(StatusCode::BAD_REQUEST, "missing subdomain");
    }

    let target = match req.uri().query() {
        Some(query) => format!("{target_path}?{query}"),
        None => target_path,
    };
    dispatch(req, state, &subdomain, target).await
}

/// Catch-all: Host-header forwarding for `<sub>.<domain>` requests.
async fn handle_host_dispatch(req: Request<Incoming>, state: Arc<GatewayState>) -> Response<Full> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let Some(subdomain) = extract_subdomain(&host, &state.domain) else {
        return text_response(StatusCode::NOT_FOUND, "not found");
    };

    let path = req.uri().path();
    let target_path = if path.is_empty() { "/" } else { path };
    let target = match req.uri().query() {
        Some(query) => format!("{target_path}?{query}"),
        None => target_path.to_string(),
    };
    dispatch(req, state, &subdomain, target).await
}

/// Extract the single-label subdomain from a Host value: strip an optional
/// scheme and the port, then require a `.<domain>` suffix. Nested labels and
/// the bare domain are routing misses.
pub(crate) fn extract_subdomain(host: &str, domain: &str) -> Option<String> {
    let host = host
        .strip_prefix("http://")
        .or_else(|| host.strip_prefix("https://"))
        .unwrap_or(host);
    let host = host.split(':').next().unwrap_or(host);

    if domain.is_empty() {
        return None;
    }
    let suffix = format!(".{domain}");
    let subdomain = host.strip_suffix(&suffix)?;
    if subdomain.is_empty() || subdomain.contains('.') {
        return None;
    }
    Some(subdomain.to_string())
}

/// Shared downstream path: rate check, session lookup, one stream, one
/// request frame, one response frame.
async fn dispatch(
    req: Request<Incoming>,
    state: Arc<GatewayState>,
    subdomain: &str,
    target: String,
) -> Response<Full> {
    if let Err(retry_after) = state.limiter.allow_request(subdomain) {
        let mut response = json_error(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
        if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
            response.headers_mut().insert(RETRY_AFTER, value);
        }
        return response;
    }

    let Some(session) = state.registry.get(subdomain).await else {
        return text_response(StatusCode::BAD_GATEWAY, "tunnel not found");
    };

    let mut stream = match session.mux.open().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(subdomain = %subdomain, error = %e, "open stream failed");
            return text_response(StatusCode::BAD_GATEWAY, "tunnel unavailable");
        }
    };

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, "read request body failed");
            return text_response(StatusCode::BAD_REQUEST, "read body failed");
        }
    };

    // Single value per header name; Host never crosses the tunnel.
    let mut headers = HashMap::new();
    for name in parts.headers.keys() {
        if name == &HOST {
            continue;
        }
        if let Some(value) = parts.headers.get(name).and_then(|v| v.to_str().ok()) {
            headers.insert(name.as_str().to_string(), value.to_string());
        }
    }

    let id = new_trace_id();
    let trace = trace_header(&headers)
        .map(str::to_string)
        .unwrap_or_else(|| id.clone());
    headers.insert(TRACE_HEADER.to_string(), trace.clone());

    let frame = RequestFrame {
        id: id.clone(),
        method: parts.method.to_string(),
        url: target,
        headers,
        body: body.to_vec(),
    };

    debug!(trace_id = %id, subdomain = %subdomain, method = %frame.method, url = %frame.url, "forwarding request");

    if let Err(e) = stream.send_message(&frame).await {
        warn!(trace_id = %id, error = %e, "tunnel write failed");
        return text_response(StatusCode::BAD_GATEWAY, "tunnel write failed");
    }

    let reply: ResponseFrame = match stream.recv_message().await {
        Ok(reply) => reply,
        Err(e) => {
            warn!(trace_id = %id, error = %e, "tunnel read failed");
            return text_response(StatusCode::BAD_GATEWAY, "tunnel read failed");
        }
    };
    stream.close().await;

    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(reply.body)))
        .expect("valid response builder");

    let response_headers = response.headers_mut();
    for (name, value) in &reply.headers {
        // The body is re-framed locally.
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding") {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            response_headers.insert(name, value);
        }
    }
    if !response_headers.contains_key(TRACE_HEADER) {
        if let Ok(value) = HeaderValue::from_str(&trace) {
            response_headers.insert(HeaderName::from_static(TRACE_HEADER), value);
        }
    }

    response
}

#[derive(Debug, Deserialize)]
struct ShareRequest {
    ciphertext: String,
}

/// `POST /api/share`: park dashboard-encrypted ciphertext and hand back a
/// share link.
async fn handle_share(req: Request<Incoming>, state: &GatewayState) -> Response<Full> {
    if req.method() != Method::POST {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }
    let Some(blobs) = &state.blobs else {
        return json_error(StatusCode::SERVICE_UNAVAILABLE, "sharing not enabled");
    };

    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return json_error(StatusCode::BAD_REQUEST, "read body failed"),
    };
    let share: ShareRequest = match serde_json::from_slice(&body) {
        Ok(share) => share,
        Err(_) => return json_error(StatusCode::BAD_REQUEST, "invalid json"),
    };

    let ciphertext = match base64::engine::general_purpose::STANDARD.decode(&share.ciphertext) {
        Ok(ciphertext) => ciphertext,
        Err(_) => return json_error(StatusCode::BAD_REQUEST, "invalid ciphertext encoding"),
    };
    if ciphertext.len() > MAX_BLOB_SIZE {
        return json_error(StatusCode::PAYLOAD_TOO_LARGE, "payload too large");
    }

    match blobs.save(ciphertext) {
        Ok(id) => json_response(
            StatusCode::OK,
            &json!({
                "id": id,
                "url": format!("http://{host}/shared/{id}"),
            }),
        ),
        Err(e) => {
            warn!(error = %e, "save blob failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to save")
        }
    }
}

/// `GET /api/blob/<id>`: fetch stored ciphertext for the replay tool.
fn handle_get_blob(path: &str, state: &GatewayState) -> Response<Full> {
    let Some(blobs) = &state.blobs else {
        return json_error(StatusCode::SERVICE_UNAVAILABLE, "sharing not enabled");
    };
    let id = path.strip_prefix("/api/blob/").unwrap_or("");
    if id.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "missing id");
    }

    match blobs.get(id) {
        Ok(Some(ciphertext)) => json_response(
            StatusCode::OK,
            &json!({
                "ciphertext": base64::engine::general_purpose::STANDARD.encode(ciphertext),
            }),
        ),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "not found or expired"),
        Err(e) => {
            warn!(error = %e, "get blob failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to get")
        }
    }
}
