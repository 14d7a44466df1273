//! Byte-stream view of a WebSocket control carrier.
//!
//! The multiplexer wants an ordered byte pipe; the carrier is a message
//! channel. [`WsCarrier`] bridges the two: reads drain the current binary
//! message and cross message boundaries seamlessly, and every write is
//! emitted as exactly one binary message.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

/// Adapter presenting a `WebSocketStream` as `AsyncRead + AsyncWrite`.
///
/// Non-binary messages are skipped on read; ping replies are handled by the
/// protocol layer underneath. A close frame or transport EOF reads as EOF.
pub struct WsCarrier<S> {
    inner: WebSocketStream<S>,
    read_buf: Vec<u8>,
    read_off: usize,
}

impl<S> WsCarrier<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buf: Vec::new(),
            read_off: 0,
        }
    }
}

fn to_io(e: WsError) -> io::Error {
    io::Error::other(e)
}

impl<S> AsyncRead for WsCarrier<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            // Drain leftover bytes from the current message first.
            if this.read_off < this.read_buf.len() {
                let available = &this.read_buf[this.read_off..];
                let n = available.len().min(buf.remaining());
                buf.put_slice(&available[..n]);
                this.read_off += n;
                if this.read_off >= this.read_buf.len() {
                    this.read_buf.clear();
                    this.read_off = 0;
                }
                return Poll::Ready(Ok(()));
            }

            match std::task::ready!(this.inner.poll_next_unpin(cx)) {
                Some(Ok(Message::Binary(data))) => {
                    if data.is_empty() {
                        continue;
                    }
                    this.read_buf = data.to_vec();
                    this.read_off = 0;
                }
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    return Poll::Ready(Ok(()))
                }
                Some(Err(e)) => return Poll::Ready(Err(to_io(e))),
            }
        }
    }
}

impl<S> AsyncWrite for WsCarrier<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match std::task::ready!(this.inner.poll_ready_unpin(cx)) {
            Ok(()) => {}
            Err(e) => return Poll::Ready(Err(to_io(e))),
        }
        this.inner
            .start_send_unpin(Message::binary(buf.to_vec()))
            .map_err(to_io)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.inner.poll_flush_unpin(cx).map_err(to_io)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match std::task::ready!(this.inner.poll_close_unpin(cx)) {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(to_io(e))),
        }
    }
}
