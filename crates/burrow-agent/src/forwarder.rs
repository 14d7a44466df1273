//! Per-stream request forwarding.
//!
//! Every inbound stream carries one request frame. The forwarder replays it
//! against the local service and answers with one response frame; any
//! failure before a local response exists becomes a synthetic 502 so the
//! stream never goes unanswered.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use burrow_core::protocol::{RequestFrame, ResponseFrame};
use burrow_core::{MuxStream, TunnelError, TunnelResult};
use tracing::{debug, warn};

/// Total cap on one local HTTP exchange.
pub const LOCAL_TIMEOUT: Duration = Duration::from_secs(30);

/// One completed round trip, as handed to the recorder seat.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub method: String,
    pub url: String,
    pub request_headers: HashMap<String, String>,
    pub request_body: Vec<u8>,
    pub status: u16,
    pub response_headers: HashMap<String, String>,
    pub response_body: Vec<u8>,
    pub duration_ms: u64,
}

/// Seat for the out-of-scope request archive. Called from forwarder tasks,
/// so implementations must be thread-safe; errors are logged, never fatal.
pub trait RequestRecorder: Send + Sync {
    fn record(&self, record: &RequestRecord) -> TunnelResult<()>;
}

pub(crate) async fn handle_stream(
    mut stream: MuxStream,
    http: reqwest::Client,
    local_port: u16,
    recorder: Option<Arc<dyn RequestRecorder>>,
) {
    let request: RequestFrame = match stream.recv_message().await {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "decode request frame failed");
            stream.close().await;
            return;
        }
    };

    let started = Instant::now();
    match replay(&http, local_port, &request).await {
        Ok((status, headers, body)) => {
            let duration_ms = started.elapsed().as_millis() as u64;
            debug!(trace_id = %request.id, status, duration_ms, "request forwarded");

            if let Some(recorder) = &recorder {
                let record = RequestRecord {
                    method: request.method.clone(),
                    url: request.url.clone(),
                    request_headers: request.headers.clone(),
                    request_body: request.body.clone(),
                    status,
                    response_headers: headers.clone(),
                    response_body: body.clone(),
                    duration_ms,
                };
                if let Err(e) = recorder.record(&record) {
                    warn!(error = %e, "record round trip failed");
                }
            }

            let reply = ResponseFrame {
                id: request.id,
                status,
                headers,
                body,
            };
            if let Err(e) = stream.send_message(&reply).await {
                debug!(error = %e, "send response frame failed");
            }
        }
        Err(e) => {
            warn!(trace_id = %request.id, url = %request.url, error = %e, "local replay failed");
            send_error(&mut stream, &request.id, 502).await;
        }
    }
    stream.close().await;
}

/// Replay one frame against the local service. Headers are copied verbatim
/// (the trace id rides along with them); the client re-derives framing.
async fn replay(
    http: &reqwest::Client,
    local_port: u16,
    request: &RequestFrame,
) -> TunnelResult<(u16, HashMap<String, String>, Vec<u8>)> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .map_err(|e| TunnelError::Http(e.to_string()))?;
    let url = format!("http://127.0.0.1:{local_port}{}", request.url);

    let mut builder = http.request(method, &url);
    for (name, value) in &request.headers {
        if name.eq_ignore_ascii_case("host")
            || name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }

    let response = builder
        .body(request.body.clone())
        .send()
        .await
        .map_err(|e| TunnelError::Http(e.to_string()))?;

    let status = response.status().as_u16();
    let mut headers = HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            // First value wins for repeated names.
            headers
                .entry(name.as_str().to_string())
                .or_insert_with(|| value.to_string());
        }
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| TunnelError::Http(e.to_string()))?;

    Ok((status, headers, body.to_vec()))
}

async fn send_error(stream: &mut MuxStream, id: &str, status: u16) {
    let reply = ResponseFrame {
        id: id.to_string(),
        status,
        headers: HashMap::new(),
        body: b"tunnel error".to_vec(),
    };
    if let Err(e) = stream.send_message(&reply).await {
        debug!(error = %e, "send error frame failed");
    }
}
