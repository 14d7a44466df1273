//! The tunnel agent.
//!
//! Holds one long-lived control connection to the gateway. Connecting
//! performs the handshake on a fresh stream, then two tasks take over: an
//! accept loop that spawns a forwarder per inbound stream, and a monitor
//! that watches the multiplexer's close signal and re-enters the connect
//! loop when reconnection is enabled.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use burrow_core::protocol::{HandshakeRequest, HandshakeResponse, PROTOCOL_VERSION};
use burrow_core::{Multiplexer, TunnelError, TunnelResult, WsCarrier};
use tokio::sync::RwLock;
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::forwarder::{self, RequestRecorder, LOCAL_TIMEOUT};

/// Deadline for dialing the gateway and completing the handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Backoff starts at one second and doubles up to this cap.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Gateway address, `host:port`.
    pub gateway_addr: String,
    /// Local service port to replay requests against.
    pub local_port: u16,
    /// Optional subdomain hint; silently ignored when taken.
    pub subdomain: Option<String>,
    /// Reconnect with backoff after failures and carrier loss.
    pub reconnect: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            gateway_addr: "localhost:8080".to_string(),
            local_port: 3000,
            subdomain: None,
            reconnect: true,
        }
    }
}

type ConnectedFn = Box<dyn Fn(&str) + Send + Sync>;
type DisconnectFn = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct LinkState {
    connected: bool,
    subdomain: Option<String>,
    public_url: Option<String>,
    mux: Option<Multiplexer>,
}

struct Shared {
    config: AgentConfig,
    http: reqwest::Client,
    state: RwLock<LinkState>,
    on_connected: std::sync::Mutex<Option<ConnectedFn>>,
    on_disconnect: std::sync::Mutex<Option<DisconnectFn>>,
    recorder: std::sync::Mutex<Option<Arc<dyn RequestRecorder>>>,
    reconnect: AtomicBool,
}

/// Tunnel agent handle. Cheap to clone.
#[derive(Clone)]
pub struct Agent {
    shared: Arc<Shared>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> TunnelResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(LOCAL_TIMEOUT)
            .build()
            .map_err(|e| TunnelError::Http(e.to_string()))?;
        let reconnect = config.reconnect;

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                http,
                state: RwLock::new(LinkState::default()),
                on_connected: std::sync::Mutex::new(None),
                on_disconnect: std::sync::Mutex::new(None),
                recorder: std::sync::Mutex::new(None),
                reconnect: AtomicBool::new(reconnect),
            }),
        })
    }

    /// Observer invoked with the public URL after every successful connect.
    pub fn on_connected<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *lock(&self.shared.on_connected) = Some(Box::new(f));
    }

    /// Observer invoked once per lost connection.
    pub fn on_disconnect<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *lock(&self.shared.on_disconnect) = Some(Box::new(f));
    }

    /// Attach the request-archive recorder seat.
    pub fn set_recorder(&self, recorder: Arc<dyn RequestRecorder>) {
        *lock(&self.shared.recorder) = Some(recorder);
    }

    /// Establish the tunnel. With reconnection enabled this retries with
    /// exponential backoff until it succeeds or `cancel` fires (returning
    /// `Ok`); with reconnection disabled the first failure is returned.
    pub async fn connect(&self, cancel: CancellationToken) -> TunnelResult<()> {
        connect_with_backoff(self.shared.clone(), cancel).await
    }

    pub async fn is_connected(&self) -> bool {
        self.shared.state.read().await.connected
    }

    pub async fn subdomain(&self) -> Option<String> {
        self.shared.state.read().await.subdomain.clone()
    }

    pub async fn public_url(&self) -> Option<String> {
        self.shared.state.read().await.public_url.clone()
    }

    /// Disable reconnection and tear the tunnel down.
    pub async fn close(&self) {
        self.shared.reconnect.store(false, Ordering::SeqCst);
        let mux = {
            let mut state = self.shared.state.write().await;
            state.connected = false;
            state.mux.take()
        };
        if let Some(mux) = mux {
            mux.close();
        }
    }

    /// Block until `cancel` fires, then close the tunnel.
    pub async fn wait(&self, cancel: &CancellationToken) {
        cancel.cancelled().await;
        self.close().await;
    }
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Boxed so the monitor task can re-enter the loop without a recursive
/// future type.
fn connect_with_backoff(
    shared: Arc<Shared>,
    cancel: CancellationToken,
) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send>> {
    Box::pin(async move {
        let mut backoff = Duration::from_secs(1);

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            match connect_once(&shared, &cancel).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if !shared.reconnect.load(Ordering::SeqCst) {
                        return Err(e);
                    }
                    warn!(error = %e, backoff_secs = backoff.as_secs(), "connect failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    })
}

async fn connect_once(shared: &Arc<Shared>, cancel: &CancellationToken) -> TunnelResult<()> {
    let url = format!("ws://{}/connect", shared.config.gateway_addr);
    debug!(url = %url, "dialing gateway");

    let (ws, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
        .await
        .map_err(|_| TunnelError::Timeout)??;

    let mux = Multiplexer::client(WsCarrier::new(ws));

    let mut stream = mux.open().await?;
    let request = HandshakeRequest {
        version: PROTOCOL_VERSION.to_string(),
        subdomain: shared.config.subdomain.clone(),
        auth_token: None,
    };
    if let Err(e) = stream.send_message(&request).await {
        mux.close();
        return Err(e);
    }

    let response: HandshakeResponse =
        match tokio::time::timeout(CONNECT_TIMEOUT, stream.recv_message()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                mux.close();
                return Err(e);
            }
            Err(_) => {
                mux.close();
                return Err(TunnelError::Timeout);
            }
        };
    stream.close().await;

    if !response.success {
        mux.close();
        return Err(TunnelError::Handshake(
            response.error.unwrap_or_else(|| "rejected".to_string()),
        ));
    }

    {
        let mut state = shared.state.write().await;
        state.connected = true;
        state.subdomain = Some(response.subdomain.clone());
        state.public_url = Some(response.public_url.clone());
        state.mux = Some(mux.clone());
    }

    info!(public_url = %response.public_url, subdomain = %response.subdomain, "tunnel established");
    if let Some(cb) = lock(&shared.on_connected).as_ref() {
        cb(&response.public_url);
    }

    spawn_accept_loop(shared.clone(), mux.clone(), cancel.clone());
    spawn_monitor(shared.clone(), mux, cancel.clone());

    Ok(())
}

fn spawn_accept_loop(shared: Arc<Shared>, mux: Multiplexer, cancel: CancellationToken) {
    tokio::spawn(async move {
        let recorder = lock(&shared.recorder).clone();
        loop {
            let stream = tokio::select! {
                _ = cancel.cancelled() => break,
                stream = mux.accept() => stream,
            };
            match stream {
                Some(stream) => {
                    let http = shared.http.clone();
                    let local_port = shared.config.local_port;
                    let recorder = recorder.clone();
                    tokio::spawn(forwarder::handle_stream(stream, http, local_port, recorder));
                }
                None => break,
            }
        }
        debug!("accept loop ended");
    });
}

fn spawn_monitor(shared: Arc<Shared>, mux: Multiplexer, cancel: CancellationToken) {
    tokio::spawn(async move {
        let close_chan = mux.close_chan();
        tokio::select! {
            _ = close_chan.cancelled() => {
                {
                    let mut state = shared.state.write().await;
                    state.connected = false;
                    state.mux = None;
                }
                warn!("tunnel connection lost");
                if let Some(cb) = lock(&shared.on_disconnect).as_ref() {
                    cb();
                }
                if shared.reconnect.load(Ordering::SeqCst) && !cancel.is_cancelled() {
                    info!("reconnecting");
                    let _ = connect_with_backoff(shared.clone(), cancel).await;
                }
            }
            _ = cancel.cancelled() => {
                mux.close();
            }
        }
    });
}
