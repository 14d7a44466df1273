//! Gateway process: accepts tunnel control connections on `/connect` and
//! serves the public HTTP surface.
//!
//! Each accepted TCP connection is served by hyper with upgrade support; a
//! successful `/connect` upgrade hands the raw stream to the tunnel
//! admission flow, which runs the multiplexer in server mode, performs the
//! handshake on the first inbound stream, and registers the session.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use burrow_core::protocol::{
    generate_subdomain, HandshakeRequest, HandshakeResponse,
};
use burrow_core::{Multiplexer, TunnelResult, WsCarrier};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::blob::BlobStore;
use crate::handlers::{self, text_response, GatewayState};
use crate::ratelimit::{RateLimiter, DEFAULT_MAX_CONNS, DEFAULT_REQUESTS_PER_MIN};
use crate::registry::{Session, SessionRegistry};

/// Deadline for the agent to open the handshake stream and send its request.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long in-flight connections get to finish after shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub addr: SocketAddr,
    /// Public routing domain; empty disables Host-based dispatch.
    pub domain: String,
    pub version: String,
    /// Per-subdomain requests per minute; 0 selects the default (60).
    pub requests_per_min: usize,
    /// Per-subdomain concurrent connections; 0 selects the default (5).
    pub max_conns: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            domain: String::new(),
            version: "dev".to_string(),
            requests_per_min: 0,
            max_conns: 0,
        }
    }
}

/// The public gateway. Bind first, then [`run`](Gateway::run).
pub struct Gateway {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<GatewayState>,
}

impl Gateway {
    /// Bind the public listener and build the shared state.
    pub async fn bind(config: GatewayConfig) -> TunnelResult<Self> {
        Self::bind_with_blobs(config, None).await
    }

    /// Bind with a share-blob store attached.
    pub async fn bind_with_blobs(
        config: GatewayConfig,
        blobs: Option<Arc<dyn BlobStore>>,
    ) -> TunnelResult<Self> {
        let listener = TcpListener::bind(config.addr).await?;
        let local_addr = listener.local_addr()?;

        let requests_per_min = if config.requests_per_min == 0 {
            DEFAULT_REQUESTS_PER_MIN
        } else {
            config.requests_per_min
        };
        let max_conns = if config.max_conns == 0 {
            DEFAULT_MAX_CONNS
        } else {
            config.max_conns
        };

        let state = Arc::new(GatewayState {
            domain: config.domain,
            version: config.version,
            registry: SessionRegistry::new(),
            limiter: RateLimiter::new(requests_per_min, max_conns),
            blobs,
        });

        info!(addr = %local_addr, "gateway listening");
        Ok(Self {
            listener,
            local_addr,
            state,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn domain(&self) -> &str {
        &self.state.domain
    }

    pub async fn session_count(&self) -> usize {
        self.state.registry.count().await
    }

    /// Serve until `cancel` fires, then stop accepting, tear down live
    /// sessions, and drain in-flight connections with a grace period.
    pub async fn run(&self, cancel: CancellationToken) -> TunnelResult<()> {
        let mut conns = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.listener.accept() => match result {
                    Ok((stream, remote)) => {
                        let state = self.state.clone();
                        conns.spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req: Request<Incoming>| {
                                let state = state.clone();
                                async move {
                                    Ok::<_, Infallible>(handlers::handle(req, state).await)
                                }
                            });
                            if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                .serve_connection_with_upgrades(io, service)
                                .await
                            {
                                debug!(remote = %remote, error = %e, "connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                    }
                },
                Some(_) = conns.join_next(), if !conns.is_empty() => {}
            }
        }

        info!("gateway shutting down");

        // Tear down tunnel sessions first so in-flight dispatches fail fast;
        // their monitors remove registry entries and release conn slots.
        for session in self.state.registry.drain().await {
            session.mux.close();
        }

        let drain = async {
            while conns.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("shutdown grace expired, aborting remaining connections");
            conns.abort_all();
        }

        info!("gateway stopped");
        Ok(())
    }
}

/// `GET /connect`: upgrade to WebSocket and hand the carrier to admission.
pub(crate) fn handle_connect(
    req: Request<Incoming>,
    state: Arc<GatewayState>,
) -> Response<Full<Bytes>> {
    let is_websocket = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let Some(key) = req.headers().get(SEC_WEBSOCKET_KEY) else {
        return text_response(StatusCode::BAD_REQUEST, "not a websocket upgrade");
    };
    if !is_websocket {
        return text_response(StatusCode::BAD_REQUEST, "not a websocket upgrade");
    }

    let accept = derive_accept_key(key.as_bytes());
    let mut req = req;
    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                let io = TokioIo::new(upgraded);
                let ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
                admit(state, ws).await;
            }
            Err(e) => {
                warn!(error = %e, "websocket upgrade failed");
            }
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_ACCEPT, accept)
        .body(Full::new(Bytes::new()))
        .expect("valid response builder")
}

/// Tunnel admission: handshake on the first inbound stream, subdomain
/// assignment, conn-slot reservation, registration, and the session monitor.
async fn admit<S>(state: Arc<GatewayState>, ws: WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mux = Multiplexer::server(WsCarrier::new(ws));

    let accepted = tokio::time::timeout(HANDSHAKE_TIMEOUT, mux.accept()).await;
    let Ok(Some(mut stream)) = accepted else {
        warn!("handshake stream never arrived");
        mux.close();
        return;
    };

    let request: HandshakeRequest =
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.recv_message()).await {
            Ok(Ok(request)) => request,
            Ok(Err(e)) => {
                warn!(error = %e, "handshake decode failed");
                stream.close().await;
                mux.close();
                return;
            }
            Err(_) => {
                warn!("handshake timed out");
                stream.close().await;
                mux.close();
                return;
            }
        };

    // A free hint wins; a taken or absent hint gets a fresh random name.
    let subdomain = match &request.subdomain {
        Some(hint) if !hint.is_empty() && !state.registry.contains(hint).await => hint.clone(),
        _ => loop {
            let candidate = generate_subdomain();
            if !state.registry.contains(&candidate).await {
                break candidate;
            }
        },
    };

    if !state.limiter.acquire_connection(&subdomain) {
        warn!(subdomain = %subdomain, "connection limit exceeded");
        let denied = HandshakeResponse {
            success: false,
            subdomain: String::new(),
            public_url: String::new(),
            error: Some("connection limit exceeded".to_string()),
        };
        let _ = stream.send_message(&denied).await;
        stream.close().await;
        mux.close();
        return;
    }

    let public_url = if state.domain.is_empty() {
        format!("http://localhost/{subdomain}")
    } else {
        format!("http://{subdomain}.{}", state.domain)
    };

    let session = Arc::new(Session {
        subdomain: subdomain.clone(),
        public_url: public_url.clone(),
        mux: mux.clone(),
        connected_at: Instant::now(),
    });
    state.registry.insert(session.clone()).await;

    let granted = HandshakeResponse {
        success: true,
        subdomain: subdomain.clone(),
        public_url: public_url.clone(),
        error: None,
    };
    if let Err(e) = stream.send_message(&granted).await {
        warn!(error = %e, "handshake reply failed");
        state.registry.remove(&subdomain).await;
        state.limiter.release_connection(&subdomain);
        stream.close().await;
        mux.close();
        return;
    }
    stream.close().await;

    info!(subdomain = %subdomain, public_url = %public_url, "client connected");

    // Session monitor: registry entry and conn slot go away together when
    // the multiplexer terminates.
    tokio::spawn(async move {
        session.mux.close_chan().cancelled().await;
        state.registry.remove(&session.subdomain).await;
        state.limiter.release_connection(&session.subdomain);
        state.limiter.cleanup_subdomain(&session.subdomain);
        info!(subdomain = %session.subdomain, "client disconnected");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use base64::Engine as _;
    use burrow_agent::{Agent, AgentConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    async fn start_gateway(
        domain: &str,
        requests_per_min: usize,
        blobs: Option<Arc<dyn BlobStore>>,
    ) -> (Arc<Gateway>, CancellationToken) {
        let config = GatewayConfig {
            addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            domain: domain.to_string(),
            version: "test".to_string(),
            requests_per_min,
            max_conns: 0,
        };
        let gateway = Arc::new(Gateway::bind_with_blobs(config, blobs).await.unwrap());
        let cancel = CancellationToken::new();
        {
            let gateway = gateway.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let _ = gateway.run(cancel).await;
            });
        }
        (gateway, cancel)
    }

    /// Minimal local HTTP service: replies `200 hello` with `x-custom: v`
    /// and reports each received request head on the channel.
    async fn stub_local_service() -> (u16, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut byte = [0u8; 1];
                    while !head.ends_with(b"\r\n\r\n") {
                        match socket.read(&mut byte).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => head.push(byte[0]),
                        }
                    }
                    let _ = tx.send(String::from_utf8_lossy(&head).to_string());
                    let _ = socket
                        .write_all(
                            b"HTTP/1.1 200 OK\r\n\
                              content-length: 5\r\n\
                              x-custom: v\r\n\
                              connection: close\r\n\r\nhello",
                        )
                        .await;
                });
            }
        });

        (port, rx)
    }

    async fn connect_agent(gateway: &Gateway, local_port: u16, hint: Option<&str>) -> Agent {
        let agent = Agent::new(AgentConfig {
            gateway_addr: gateway.local_addr().to_string(),
            local_port,
            subdomain: hint.map(str::to_string),
            reconnect: false,
        })
        .unwrap();
        agent.connect(CancellationToken::new()).await.unwrap();
        agent
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Raw HTTP/1.1 exchange against the gateway, for Host-header control.
    async fn raw_request(addr: SocketAddr, request: &str) -> String {
        let mut socket = tokio::net::TcpStream::connect(addr).await.unwrap();
        socket.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        socket.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).to_string()
    }

    #[tokio::test]
    async fn handshake_assigns_subdomain_and_registers() {
        let (gateway, _cancel) = start_gateway("test.local", 0, None).await;
        let agent = connect_agent(&gateway, 3000, None).await;

        let subdomain = agent.subdomain().await.unwrap();
        assert_eq!(subdomain.len(), 8);
        assert!(subdomain.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(
            agent.public_url().await.unwrap(),
            format!("http://{subdomain}.test.local")
        );
        assert_eq!(gateway.session_count().await, 1);

        agent.close().await;
        wait_until(|| {
            let gateway = gateway.clone();
            async move { gateway.session_count().await == 0 }
        })
        .await;
    }

    #[tokio::test]
    async fn proxy_route_round_trips_with_headers_and_trace() {
        let (gateway, _cancel) = start_gateway("test.local", 0, None).await;
        let (port, mut seen) = stub_local_service().await;
        let agent = connect_agent(&gateway, port, None).await;
        let subdomain = agent.subdomain().await.unwrap();

        let url = format!(
            "http://{}/proxy/{subdomain}/path?x=1",
            gateway.local_addr()
        );
        let response = reqwest::get(&url).await.unwrap();

        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(response.headers()["x-custom"], "v");
        let trace = response.headers()["x-trace-id"].to_str().unwrap().to_string();
        assert_eq!(trace.len(), 26);
        assert_eq!(response.text().await.unwrap(), "hello");

        let head = seen.recv().await.unwrap();
        assert!(head.starts_with("GET /path?x=1 HTTP/1.1\r\n"), "head: {head}");
        assert!(head.to_lowercase().contains(&format!("x-trace-id: {}", trace.to_lowercase())));
    }

    #[tokio::test]
    async fn existing_trace_id_is_preserved_end_to_end() {
        let (gateway, _cancel) = start_gateway("test.local", 0, None).await;
        let (port, mut seen) = stub_local_service().await;
        let agent = connect_agent(&gateway, port, None).await;
        let subdomain = agent.subdomain().await.unwrap();

        let url = format!("http://{}/proxy/{subdomain}/", gateway.local_addr());
        let response = reqwest::Client::new()
            .get(&url)
            .header("x-trace-id", "caller-supplied-trace")
            .send()
            .await
            .unwrap();

        assert_eq!(
            response.headers()["x-trace-id"],
            "caller-supplied-trace"
        );
        let head = seen.recv().await.unwrap();
        assert!(head.to_lowercase().contains("x-trace-id: caller-supplied-trace"));
    }

    #[tokio::test]
    async fn host_route_strips_port_and_forwards() {
        let (gateway, _cancel) = start_gateway("test.local", 0, None).await;
        let (port, mut seen) = stub_local_service().await;
        let agent = connect_agent(&gateway, port, None).await;
        let subdomain = agent.subdomain().await.unwrap();

        let response = raw_request(
            gateway.local_addr(),
            &format!(
                "GET /a HTTP/1.1\r\nhost: {subdomain}.test.local:8080\r\nconnection: close\r\n\r\n"
            ),
        )
        .await;

        assert!(response.starts_with("HTTP/1.1 200"), "response: {response}");
        assert!(response.contains("hello"));
        let head = seen.recv().await.unwrap();
        assert!(head.starts_with("GET /a HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn unknown_tunnel_is_bad_gateway() {
        let (gateway, _cancel) = start_gateway("test.local", 0, None).await;

        let url = format!("http://{}/proxy/deadbeef/x", gateway.local_addr());
        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status().as_u16(), 502);

        let response = raw_request(
            gateway.local_addr(),
            "GET /a HTTP/1.1\r\nhost: deadbeef.test.local\r\nconnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 502"), "response: {response}");
    }

    #[tokio::test]
    async fn bad_hosts_are_routing_misses() {
        let (gateway, _cancel) = start_gateway("test.local", 0, None).await;

        for host in ["test.local", "a.b.test.local", "elsewhere.example.com"] {
            let response = raw_request(
                gateway.local_addr(),
                &format!("GET / HTTP/1.1\r\nhost: {host}\r\nconnection: close\r\n\r\n"),
            )
            .await;
            assert!(
                response.starts_with("HTTP/1.1 404"),
                "host {host}: {response}"
            );
        }
    }

    #[tokio::test]
    async fn missing_proxy_subdomain_is_bad_request() {
        let (gateway, _cancel) = start_gateway("test.local", 0, None).await;
        let url = format!("http://{}/proxy/", gateway.local_addr());
        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status().as_u16(), 400);
    }

    #[tokio::test]
    async fn over_limit_requests_get_429_with_retry_after() {
        let (gateway, _cancel) = start_gateway("test.local", 2, None).await;
        let (port, _seen) = stub_local_service().await;
        let agent = connect_agent(&gateway, port, None).await;
        let subdomain = agent.subdomain().await.unwrap();

        let url = format!("http://{}/proxy/{subdomain}/", gateway.local_addr());
        for _ in 0..2 {
            let response = reqwest::get(&url).await.unwrap();
            assert_eq!(response.status().as_u16(), 200);
        }

        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status().as_u16(), 429);
        let retry_after: u64 = response.headers()["retry-after"]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry_after >= 1);
    }

    #[tokio::test]
    async fn subdomain_hint_honored_then_ignored_on_collision() {
        let (gateway, _cancel) = start_gateway("test.local", 0, None).await;

        let first = connect_agent(&gateway, 3000, Some("myapp")).await;
        assert_eq!(first.subdomain().await.unwrap(), "myapp");

        let second = connect_agent(&gateway, 3000, Some("myapp")).await;
        let assigned = second.subdomain().await.unwrap();
        assert_ne!(assigned, "myapp");
        assert_eq!(assigned.len(), 8);
        assert_eq!(gateway.session_count().await, 2);
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let (gateway, _cancel) = start_gateway("", 0, None).await;
        let url = format!("http://{}/health", gateway.local_addr());
        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status().as_u16(), 200);

        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["ok"], true);
        assert_eq!(body["version"], "test");
        assert!(body["time"].as_str().unwrap().contains('T'));
    }

    #[tokio::test]
    async fn rate_limits_endpoint_reports_configuration() {
        let (gateway, _cancel) = start_gateway("", 7, None).await;
        let url = format!("http://{}/api/rate-limits", gateway.local_addr());
        let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(body["requests_per_min"], 7);
        assert_eq!(body["max_concurrent_conns"], 5);
    }

    #[tokio::test]
    async fn share_and_blob_round_trip() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let (gateway, _cancel) = start_gateway("", 0, Some(store)).await;
        let base = format!("http://{}", gateway.local_addr());

        let ciphertext = base64::engine::general_purpose::STANDARD.encode(b"sealed exchange");
        let body: serde_json::Value = reqwest::Client::new()
            .post(format!("{base}/api/share"))
            .json(&serde_json::json!({ "ciphertext": ciphertext }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = body["id"].as_str().unwrap();
        assert_eq!(id.len(), 26);
        assert!(body["url"].as_str().unwrap().contains("/shared/"));

        let fetched: serde_json::Value = reqwest::get(format!("{base}/api/blob/{id}"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(fetched["ciphertext"].as_str().unwrap(), ciphertext);

        let missing = reqwest::get(format!("{base}/api/blob/01ARZ3NDEKTSV4RRFFQ69G5FAV"))
            .await
            .unwrap();
        assert_eq!(missing.status().as_u16(), 404);
    }

    #[tokio::test]
    async fn share_requires_a_store() {
        let (gateway, _cancel) = start_gateway("", 0, None).await;
        let response = reqwest::Client::new()
            .post(format!("http://{}/api/share", gateway.local_addr()))
            .json(&serde_json::json!({ "ciphertext": "" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 503);
    }

    #[tokio::test]
    async fn non_upgrade_connect_is_bad_request() {
        let (gateway, _cancel) = start_gateway("", 0, None).await;
        let url = format!("http://{}/connect", gateway.local_addr());
        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status().as_u16(), 400);
    }

    #[tokio::test]
    async fn gateway_close_fires_agent_disconnect_observer() {
        let (gateway, cancel) = start_gateway("test.local", 0, None).await;

        let disconnects = Arc::new(AtomicUsize::new(0));
        let agent = Agent::new(AgentConfig {
            gateway_addr: gateway.local_addr().to_string(),
            local_port: 3000,
            subdomain: None,
            reconnect: false,
        })
        .unwrap();
        {
            let disconnects = disconnects.clone();
            agent.on_disconnect(move || {
                disconnects.fetch_add(1, Ordering::SeqCst);
            });
        }
        agent.connect(CancellationToken::new()).await.unwrap();
        assert_eq!(gateway.session_count().await, 1);

        cancel.cancel();

        wait_until(|| {
            let disconnects = disconnects.clone();
            async move { disconnects.load(Ordering::SeqCst) == 1 }
        })
        .await;
        wait_until(|| {
            let agent = agent.clone();
            async move { !agent.is_connected().await }
        })
        .await;
    }
}
