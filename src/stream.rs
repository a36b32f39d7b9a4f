//! TCP- and UDP-flavoured adapters over QUIC streams.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use futures::ready;
use log::debug;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use crate::address::{Address, NetLocation};
use crate::error::{Error, Result};
use crate::frag::frag_udp_message;
use crate::protocol::{ServerResponse, UdpMessage};
use crate::session::UdpSessionRegistry;

/// Scratch size for the hold loop that drains a UDP conn's stream.
const HOLD_BUFFER_SIZE: usize = 512;

/// A proxied TCP connection carried on one QUIC stream.
///
/// With fast-open the server's response is parsed lazily on the first
/// read; a rejection surfaces there (and on every read after) instead of
/// at dial time.
pub struct TcpConn {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    established: bool,
    pending: BytesMut,
    rejected: Option<String>,
}

impl TcpConn {
    pub(crate) fn new(
        send: quinn::SendStream,
        recv: quinn::RecvStream,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        established: bool,
    ) -> Self {
        Self {
            send,
            recv,
            local_addr,
            remote_addr,
            established,
            pending: BytesMut::new(),
            rejected: None,
        }
    }

    /// Pseudo address copied from the QUIC connection at dial time.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Pseudo address copied from the QUIC connection at dial time.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn poll_read_response(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            let mut scratch = [0u8; 256];
            let mut read_buf = ReadBuf::new(&mut scratch);
            ready!(Pin::new(&mut self.recv).poll_read(cx, &mut read_buf))?;
            if read_buf.filled().is_empty() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed before server response",
                )));
            }
            self.pending.extend_from_slice(read_buf.filled());
            if let Some((response, consumed)) = ServerResponse::decode_partial(&self.pending) {
                self.pending.advance(consumed);
                if !response.ok {
                    self.rejected = Some(response.message.clone());
                    let _ = self.recv.stop(quinn::VarInt::from_u32(0));
                    let _ = self.send.finish();
                    return Poll::Ready(Err(rejection_error(&response.message)));
                }
                self.established = true;
                return Poll::Ready(Ok(()));
            }
        }
    }
}

fn rejection_error(message: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionRefused,
        format!("connection rejected: {}", message),
    )
}

impl AsyncRead for TcpConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(ref message) = this.rejected {
            return Poll::Ready(Err(rejection_error(message)));
        }
        if !this.established {
            ready!(this.poll_read_response(cx))?;
        }
        // Bytes that arrived in the same flight as the response.
        if !this.pending.is_empty() {
            let n = this.pending.len().min(buf.remaining());
            buf.put_slice(&this.pending.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.send), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        // Cancel the read side first so a half-closed stream cannot leak.
        let _ = this.recv.stop(quinn::VarInt::from_u32(0));
        let _ = this.send.finish();
        Poll::Ready(Ok(()))
    }
}

/// A proxied UDP flow bound to a server-assigned session id.
///
/// The paired QUIC stream carries no payload; it exists so either side can
/// observe teardown. A background task drains it and closes the session
/// when the server goes away.
pub struct UdpConn {
    conn: quinn::Connection,
    session_id: u32,
    receiver: tokio::sync::Mutex<mpsc::Receiver<UdpMessage>>,
    registry: Arc<UdpSessionRegistry>,
    send: std::sync::Mutex<Option<quinn::SendStream>>,
    local_addr: SocketAddr,
    closed: Arc<AtomicBool>,
}

impl UdpConn {
    pub(crate) fn new(
        conn: quinn::Connection,
        session_id: u32,
        receiver: mpsc::Receiver<UdpMessage>,
        registry: Arc<UdpSessionRegistry>,
        send: quinn::SendStream,
        recv: quinn::RecvStream,
        local_addr: SocketAddr,
    ) -> Self {
        let closed = Arc::new(AtomicBool::new(false));
        tokio::spawn(hold(
            recv,
            closed.clone(),
            registry.clone(),
            session_id,
        ));
        Self {
            conn,
            session_id,
            receiver: tokio::sync::Mutex::new(receiver),
            registry,
            send: std::sync::Mutex::new(Some(send)),
            local_addr,
            closed,
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receives one datagram, returning the bytes copied and the origin
    /// address the server reported. Returns `ClientClosed` once the
    /// session is torn down.
    pub async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, NetLocation)> {
        let msg = self.receiver.lock().await.recv().await;
        let Some(msg) = msg else {
            return Err(Error::Closed);
        };
        let n = msg.data.len().min(buf.len());
        buf[..n].copy_from_slice(&msg.data[..n]);
        let address =
            Address::from(&msg.host).unwrap_or_else(|_| Address::Hostname(msg.host.clone()));
        Ok((n, NetLocation::new(address, msg.port)))
    }

    /// Sends one datagram to `target`, fragmenting if it exceeds the QUIC
    /// datagram ceiling.
    pub async fn write_to(&self, buf: &[u8], target: &NetLocation) -> Result<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::Closed);
        }
        let msg = UdpMessage {
            session_id: self.session_id,
            host: target.address().to_string(),
            port: target.port(),
            msg_id: 0,
            frag_id: 0,
            frag_count: 1,
            data: Bytes::copy_from_slice(buf),
        };
        match self.conn.send_datagram(msg.encode()) {
            Ok(()) => Ok(buf.len()),
            Err(quinn::SendDatagramError::TooLarge) => {
                let max = self.conn.max_datagram_size().ok_or_else(|| {
                    Error::Protocol("peer does not support datagrams".to_string())
                })?;
                let mut msg = msg;
                msg.msg_id = rand::rng().random_range(1..=u16::MAX);
                for frag in frag_udp_message(msg, max) {
                    self.conn.send_datagram(frag.encode())?;
                }
                Ok(buf.len())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Removes the session from the registry and closes the stream.
    /// Idempotent; pending reads return `ClientClosed`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        debug!("udp session {}: closing", self.session_id);
        self.registry.close_session(self.session_id);
        if let Some(mut send) = self.send.lock().unwrap().take() {
            let _ = send.finish();
        }
    }
}

impl Drop for UdpConn {
    fn drop(&mut self) {
        self.close();
    }
}

async fn hold(
    mut recv: quinn::RecvStream,
    closed: Arc<AtomicBool>,
    registry: Arc<UdpSessionRegistry>,
    session_id: u32,
) {
    let mut buf = [0u8; HOLD_BUFFER_SIZE];
    loop {
        match recv.read(&mut buf).await {
            Ok(Some(n)) => {
                debug!("udp session {}: hold read {} bytes", session_id, n);
            }
            Ok(None) | Err(_) => break,
        }
    }
    // Peer-initiated teardown.
    if !closed.swap(true, Ordering::Relaxed) {
        debug!("udp session {}: stream closed by peer", session_id);
        registry.close_session(session_id);
    }
}
