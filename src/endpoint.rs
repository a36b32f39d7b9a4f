//! Glue between the packet underlay and the QUIC engine.
//!
//! `PacketConnStub` is the socket quinn drives. It forwards to whichever
//! `DatagramSocket` is currently installed, and the underlay can be
//! swapped while the endpoint keeps running; that swap is what a soft
//! reset is.

use std::fmt;
use std::io::{self, IoSliceMut};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;

use quinn::udp::{RecvMeta, Transmit};
use quinn::{AsyncUdpSocket, UdpPoller, VarInt};

use crate::congestion::BrutalConfig;
use crate::pktconn::DatagramSocket;

/// Keep-alive period for dialed connections.
const KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(10);

pub(crate) struct PacketConnStub {
    inner: RwLock<Arc<dyn DatagramSocket>>,
}

impl PacketConnStub {
    pub fn new(inner: Arc<dyn DatagramSocket>) -> Self {
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// Installs a fresh underlay and returns the previous one.
    pub fn swap(&self, fresh: Arc<dyn DatagramSocket>) -> Arc<dyn DatagramSocket> {
        std::mem::replace(&mut *self.inner.write().unwrap(), fresh)
    }

    fn socket(&self) -> Arc<dyn DatagramSocket> {
        self.inner.read().unwrap().clone()
    }
}

impl fmt::Debug for PacketConnStub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketConnStub")
            .field("local_addr", &self.socket().local_addr().ok())
            .finish()
    }
}

impl AsyncUdpSocket for PacketConnStub {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        Box::pin(StubPoller)
    }

    fn try_send(&self, transmit: &Transmit) -> io::Result<()> {
        match self
            .socket()
            .try_send_to(transmit.contents, transmit.destination)
        {
            Ok(_) => Ok(()),
            // UDP is lossy anyway; dropping beats stalling the endpoint.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        let socket = self.socket();
        match socket.poll_recv_from(cx, &mut bufs[0]) {
            Poll::Ready(Ok((len, addr))) => {
                meta[0] = RecvMeta {
                    addr,
                    len,
                    stride: len,
                    ecn: None,
                    dst_ip: None,
                };
                Poll::Ready(Ok(1))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket().local_addr()
    }
}

/// Sends through the stub never block, so writability is always granted.
#[derive(Debug)]
struct StubPoller;

impl UdpPoller for StubPoller {
    fn poll_writable(self: Pin<&mut Self>, _cx: &mut Context) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

pub(crate) struct QuicParams {
    pub stream_receive_window: u64,
    pub conn_receive_window: u64,
    pub disable_mtu_discovery: bool,
}

pub(crate) fn new_transport_config(
    params: &QuicParams,
    brutal: Arc<BrutalConfig>,
) -> quinn::TransportConfig {
    let mut transport = quinn::TransportConfig::default();
    transport
        .stream_receive_window(varint(params.stream_receive_window))
        .receive_window(varint(params.conn_receive_window))
        .keep_alive_interval(Some(KEEP_ALIVE_PERIOD))
        .datagram_receive_buffer_size(Some(65_536))
        .congestion_controller_factory(brutal);
    if params.disable_mtu_discovery {
        transport.mtu_discovery_config(None);
    }
    transport
}

fn varint(value: u64) -> VarInt {
    VarInt::from_u64(value).unwrap_or(VarInt::MAX)
}

pub(crate) fn new_endpoint(stub: Arc<PacketConnStub>) -> io::Result<quinn::Endpoint> {
    quinn::Endpoint::new_with_abstract_socket(
        quinn::EndpointConfig::default(),
        None,
        stub,
        Arc::new(quinn::TokioRuntime),
    )
}
