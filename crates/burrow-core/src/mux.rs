//! Stream multiplexer over an ordered byte carrier.
//!
//! Runs logical, independently flow-controlled streams over one full-duplex
//! byte pipe (normally a [`WsCarrier`](crate::carrier::WsCarrier)). The
//! gateway runs the server side and opens a stream per public request; the
//! agent runs the client side and opens only the handshake stream.
//!
//! Carrier wire format: `[1-byte kind][4-byte stream id][4-byte length][payload]`.
//! The client allocates odd stream ids, the server even ones. A keepalive
//! ping flows every 30 s; a missing pong within the 10 s write timeout tears
//! the connection down. All failure paths converge on the close token
//! returned by [`Multiplexer::close_chan`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec;
use crate::error::{TunnelError, TunnelResult};

/// Interval between keepalive pings.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// Deadline for any single carrier write, and for the pong reply.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest payload in one outbound frame; larger writes are chunked.
const MAX_FRAME_PAYLOAD: usize = 64 * 1024;
/// Reader-side cap on a single inbound frame payload.
const MAX_INBOUND_PAYLOAD: usize = 1024 * 1024;
const FRAME_HEADER_LEN: usize = 9;

const KIND_OPEN: u8 = 0x01;
const KIND_DATA: u8 = 0x02;
const KIND_CLOSE: u8 = 0x03;
const KIND_RESET: u8 = 0x04;
const KIND_PING: u8 = 0x05;
const KIND_PONG: u8 = 0x06;
const KIND_GOAWAY: u8 = 0x07;

struct Frame {
    kind: u8,
    id: u32,
    payload: Vec<u8>,
}

fn encode_frame(frame: &Frame) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + frame.payload.len());
    buf.push(frame.kind);
    buf.extend_from_slice(&frame.id.to_be_bytes());
    buf.extend_from_slice(&(frame.payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&frame.payload);
    buf
}

struct Shared {
    out_tx: mpsc::Sender<Frame>,
    /// Inbound routing: stream id → sender feeding that stream's reader.
    streams: Mutex<HashMap<u32, mpsc::Sender<Vec<u8>>>>,
    next_id: AtomicU32,
    closed: CancellationToken,
}

/// A multiplexed connection handle. Cheap to clone; all clones drive the
/// same carrier.
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<Shared>,
    accept_rx: Arc<Mutex<mpsc::Receiver<MuxStream>>>,
}

impl Multiplexer {
    /// Client side: allocates odd stream ids.
    pub fn client<C>(carrier: C) -> Self
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::start(carrier, 1)
    }

    /// Server side: allocates even stream ids.
    pub fn server<C>(carrier: C) -> Self
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::start(carrier, 2)
    }

    fn start<C>(carrier: C, first_id: u32) -> Self
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(carrier);
        let (out_tx, out_rx) = mpsc::channel::<Frame>(256);
        let (accept_tx, accept_rx) = mpsc::channel::<MuxStream>(64);
        let closed = CancellationToken::new();
        let pong = Arc::new(Notify::new());

        let shared = Arc::new(Shared {
            out_tx: out_tx.clone(),
            streams: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(first_id),
            closed: closed.clone(),
        });

        tokio::spawn(read_loop(read_half, shared.clone(), accept_tx, pong.clone()));
        tokio::spawn(write_loop(write_half, out_rx, closed.clone()));
        tokio::spawn(keepalive_loop(out_tx, pong, closed));

        Self {
            shared,
            accept_rx: Arc::new(Mutex::new(accept_rx)),
        }
    }

    /// Open a new outbound stream.
    pub async fn open(&self) -> TunnelResult<MuxStream> {
        if self.shared.closed.is_cancelled() {
            return Err(TunnelError::Closed);
        }
        let id = self.shared.next_id.fetch_add(2, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(256);
        self.shared.streams.lock().await.insert(id, tx);

        let open = Frame {
            kind: KIND_OPEN,
            id,
            payload: Vec::new(),
        };
        if self.shared.out_tx.send(open).await.is_err() {
            self.shared.streams.lock().await.remove(&id);
            return Err(TunnelError::Closed);
        }

        Ok(MuxStream::new(id, rx, self.shared.out_tx.clone()))
    }

    /// Accept the next inbound stream. Returns `None` once the multiplexer
    /// has terminated.
    pub async fn accept(&self) -> Option<MuxStream> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            stream = rx.recv() => stream,
            _ = self.shared.closed.cancelled() => None,
        }
    }

    /// Completion signal: fires on peer close, carrier error, keepalive
    /// timeout, or local [`close`](Self::close).
    pub fn close_chan(&self) -> CancellationToken {
        self.shared.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Terminate the connection. The writer sends a goodbye frame and shuts
    /// the carrier down; in-flight streams observe EOF.
    pub fn close(&self) {
        self.shared.closed.cancel();
    }
}

async fn read_frame<C>(rh: &mut ReadHalf<C>) -> std::io::Result<Frame>
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    rh.read_exact(&mut header).await?;
    let kind = header[0];
    let id = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
    if len > MAX_INBOUND_PAYLOAD {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame payload too large: {len}"),
        ));
    }
    let mut payload = vec![0u8; len];
    rh.read_exact(&mut payload).await?;
    Ok(Frame { kind, id, payload })
}

async fn read_loop<C>(
    mut rh: ReadHalf<C>,
    shared: Arc<Shared>,
    accept_tx: mpsc::Sender<MuxStream>,
    pong: Arc<Notify>,
) where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let frame = tokio::select! {
            res = read_frame(&mut rh) => match res {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(error = %e, "carrier read ended");
                    break;
                }
            },
            _ = shared.closed.cancelled() => break,
        };

        match frame.kind {
            KIND_OPEN => {
                let (tx, rx) = mpsc::channel(256);
                shared.streams.lock().await.insert(frame.id, tx);
                let stream = MuxStream::new(frame.id, rx, shared.out_tx.clone());
                if accept_tx.send(stream).await.is_err() {
                    shared.streams.lock().await.remove(&frame.id);
                    break;
                }
            }
            KIND_DATA => {
                let tx = shared.streams.lock().await.get(&frame.id).cloned();
                match tx {
                    Some(tx) => {
                        if tx.send(frame.payload).await.is_err() {
                            // Local reader is gone; tell the peer to stop.
                            shared.streams.lock().await.remove(&frame.id);
                            let reset = Frame {
                                kind: KIND_RESET,
                                id: frame.id,
                                payload: Vec::new(),
                            };
                            let _ = shared.out_tx.send(reset).await;
                        }
                    }
                    None => {
                        debug!(stream_id = frame.id, "data for unknown stream");
                    }
                }
            }
            KIND_CLOSE | KIND_RESET => {
                shared.streams.lock().await.remove(&frame.id);
            }
            KIND_PING => {
                let reply = Frame {
                    kind: KIND_PONG,
                    id: frame.id,
                    payload: frame.payload,
                };
                let _ = shared.out_tx.send(reply).await;
            }
            KIND_PONG => {
                pong.notify_waiters();
            }
            KIND_GOAWAY => {
                debug!("peer closed the connection");
                break;
            }
            other => {
                warn!(kind = other, "unknown frame kind");
            }
        }
    }

    shared.closed.cancel();
    shared.streams.lock().await.clear();
}

async fn write_all_flush<C>(wh: &mut WriteHalf<C>, buf: &[u8]) -> std::io::Result<()>
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    wh.write_all(buf).await?;
    wh.flush().await
}

async fn write_loop<C>(
    mut wh: WriteHalf<C>,
    mut out_rx: mpsc::Receiver<Frame>,
    closed: CancellationToken,
) where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let frame = tokio::select! {
            frame = out_rx.recv() => frame,
            _ = closed.cancelled() => None,
        };

        let Some(frame) = frame else {
            // Local close or all senders gone: wave goodbye, shut the
            // carrier down, and make sure the token is tripped.
            let goodbye = encode_frame(&Frame {
                kind: KIND_GOAWAY,
                id: 0,
                payload: Vec::new(),
            });
            let _ = tokio::time::timeout(WRITE_TIMEOUT, async {
                let _ = write_all_flush(&mut wh, &goodbye).await;
                let _ = wh.shutdown().await;
            })
            .await;
            closed.cancel();
            return;
        };

        let buf = encode_frame(&frame);
        match tokio::time::timeout(WRITE_TIMEOUT, write_all_flush(&mut wh, &buf)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "carrier write failed");
                closed.cancel();
                return;
            }
            Err(_) => {
                warn!("carrier write timed out");
                closed.cancel();
                return;
            }
        }
    }
}

async fn keepalive_loop(
    out_tx: mpsc::Sender<Frame>,
    pong: Arc<Notify>,
    closed: CancellationToken,
) {
    let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
    ticker.tick().await; // skip the immediate first tick

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = closed.cancelled() => return,
        }

        let wait = pong.notified();
        tokio::pin!(wait);
        wait.as_mut().enable();

        let ping = Frame {
            kind: KIND_PING,
            id: 0,
            payload: Vec::new(),
        };
        if out_tx.send(ping).await.is_err() {
            return;
        }

        tokio::select! {
            _ = &mut wait => {}
            _ = closed.cancelled() => return,
            _ = tokio::time::sleep(WRITE_TIMEOUT) => {
                warn!("keepalive timed out, closing connection");
                closed.cancel();
                return;
            }
        }
    }
}

/// One logical stream. Carries exactly one request/response exchange in
/// tunnel usage, then gets closed.
pub struct MuxStream {
    id: u32,
    rx: mpsc::Receiver<Vec<u8>>,
    out: mpsc::Sender<Frame>,
    read_buf: Vec<u8>,
    read_off: usize,
    sent_close: bool,
}

impl MuxStream {
    fn new(id: u32, rx: mpsc::Receiver<Vec<u8>>, out: mpsc::Sender<Frame>) -> Self {
        Self {
            id,
            rx,
            out,
            read_buf: Vec::new(),
            read_off: 0,
            sent_close: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Read the next chunk. `Ok(0)` means the peer closed the stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> TunnelResult<usize> {
        // Drain leftover bytes from the previous chunk first.
        if self.read_off < self.read_buf.len() {
            let available = self.read_buf.len() - self.read_off;
            let n = available.min(buf.len());
            buf[..n].copy_from_slice(&self.read_buf[self.read_off..self.read_off + n]);
            self.read_off += n;
            if self.read_off >= self.read_buf.len() {
                self.read_buf.clear();
                self.read_off = 0;
            }
            return Ok(n);
        }

        match self.rx.recv().await {
            Some(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    self.read_buf = data;
                    self.read_off = n;
                }
                Ok(n)
            }
            None => Ok(0),
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> TunnelResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(TunnelError::Closed);
            }
            filled += n;
        }
        Ok(())
    }

    /// Write all bytes, chunked into frames.
    pub async fn write_all(&mut self, data: &[u8]) -> TunnelResult<()> {
        for chunk in data.chunks(MAX_FRAME_PAYLOAD) {
            let frame = Frame {
                kind: KIND_DATA,
                id: self.id,
                payload: chunk.to_vec(),
            };
            self.out.send(frame).await.map_err(|_| TunnelError::Closed)?;
        }
        Ok(())
    }

    /// Send a length-prefixed CBOR message on this stream.
    pub async fn send_message<T: Serialize>(&mut self, value: &T) -> TunnelResult<()> {
        let message = codec::encode_message(value)?;
        self.write_all(&message).await
    }

    /// Receive one length-prefixed CBOR message from this stream.
    pub async fn recv_message<T: DeserializeOwned>(&mut self) -> TunnelResult<T> {
        let mut prefix = [0u8; codec::LENGTH_PREFIX_LEN];
        self.read_exact(&mut prefix).await?;
        let len = codec::parse_length(prefix)?;
        let mut payload = vec![0u8; len];
        self.read_exact(&mut payload).await?;
        codec::decode_message(&payload)
    }

    /// Close this stream cleanly. The peer's reader observes EOF.
    pub async fn close(&mut self) {
        if !self.sent_close {
            self.sent_close = true;
            let frame = Frame {
                kind: KIND_CLOSE,
                id: self.id,
                payload: Vec::new(),
            };
            let _ = self.out.send(frame).await;
        }
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        if !self.sent_close {
            let frame = Frame {
                kind: KIND_RESET,
                id: self.id,
                payload: Vec::new(),
            };
            let _ = self.out.try_send(frame);
        }
    }
}
