//! Raw UDP underlay for the QUIC engine.
//!
//! `DatagramSocket` is the minimal packet-socket capability the client
//! needs: a poll-based receive, a non-blocking send, a local address and a
//! close. The plain socket, both obfuscated variants and the multi-path
//! pool all implement it, so the QUIC endpoint can be wired to any of them
//! through the same adapter.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::ready;
use rand::Rng;
use tokio::io::ReadBuf;
use tokio::net::UdpSocket;

use crate::config::TransportProtocol;
use crate::obfs::XPlusObfuscator;

/// SO_RCVBUF / SO_SNDBUF requested on the raw socket, best-effort.
const SOCKET_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Scratch size for obfuscated packets.
const OBFS_BUFFER_SIZE: usize = 4096;

/// Length of the WeChat video pre-roll prepended to every packet.
const WECHAT_HEADER_LEN: usize = 13;

pub trait DatagramSocket: Send + Sync {
    /// Polls for one datagram, copying the payload into `buf`.
    fn poll_recv_from(
        &self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<(usize, SocketAddr)>>;

    /// Sends one datagram without blocking. Implementations may drop
    /// packets rather than block.
    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Stops the socket: later sends fail and pending reads go silent.
    fn close(&self);
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket closed")
}

/// Binds an unconnected UDP socket in the address family of `remote` with
/// enlarged kernel buffers.
pub fn new_udp_socket(remote: SocketAddr) -> io::Result<UdpSocket> {
    let domain = if remote.is_ipv6() {
        socket2::Domain::IPV6
    } else {
        socket2::Domain::IPV4
    };
    let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;

    // Best-effort: some platforms refuse large buffers.
    let _ = socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE);
    let _ = socket.set_send_buffer_size(SOCKET_BUFFER_SIZE);

    socket.set_nonblocking(true)?;
    let bind_addr: SocketAddr = if remote.is_ipv6() {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    };
    socket.bind(&bind_addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Creates the packet socket for the configured protocol, composing the
/// optional obfuscator.
pub fn new_packet_conn(
    remote: SocketAddr,
    protocol: TransportProtocol,
    obfs: Option<&XPlusObfuscator>,
) -> io::Result<Arc<dyn DatagramSocket>> {
    let socket = new_udp_socket(remote)?;
    let conn: Arc<dyn DatagramSocket> = match protocol {
        TransportProtocol::Udp => match obfs {
            Some(obfs) => Arc::new(ObfsUdpSocket::new(socket, obfs.clone())),
            None => Arc::new(PlainUdpSocket::new(socket)),
        },
        TransportProtocol::WechatVideo => Arc::new(WeChatUdpSocket::new(socket, obfs.cloned())),
    };
    Ok(conn)
}

pub struct PlainUdpSocket {
    socket: UdpSocket,
    closed: AtomicBool,
}

impl PlainUdpSocket {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            closed: AtomicBool::new(false),
        }
    }
}

impl DatagramSocket for PlainUdpSocket {
    fn poll_recv_from(
        &self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<(usize, SocketAddr)>> {
        if self.closed.load(Ordering::Relaxed) {
            return Poll::Pending;
        }
        let mut read_buf = ReadBuf::new(buf);
        let addr = ready!(self.socket.poll_recv_from(cx, &mut read_buf))?;
        Poll::Ready(Ok((read_buf.filled().len(), addr)))
    }

    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(closed_error());
        }
        self.socket.try_send_to(buf, target)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

pub struct ObfsUdpSocket {
    socket: UdpSocket,
    obfs: XPlusObfuscator,
    read_buf: Mutex<Box<[u8]>>,
    write_buf: Mutex<Box<[u8]>>,
    closed: AtomicBool,
}

impl ObfsUdpSocket {
    pub fn new(socket: UdpSocket, obfs: XPlusObfuscator) -> Self {
        Self {
            socket,
            obfs,
            read_buf: Mutex::new(vec![0u8; OBFS_BUFFER_SIZE].into_boxed_slice()),
            write_buf: Mutex::new(vec![0u8; OBFS_BUFFER_SIZE].into_boxed_slice()),
            closed: AtomicBool::new(false),
        }
    }
}

impl DatagramSocket for ObfsUdpSocket {
    fn poll_recv_from(
        &self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<(usize, SocketAddr)>> {
        if self.closed.load(Ordering::Relaxed) {
            return Poll::Pending;
        }
        let mut scratch = self.read_buf.lock().unwrap();
        loop {
            let (n, addr) = {
                let mut read_buf = ReadBuf::new(&mut scratch);
                let addr = ready!(self.socket.poll_recv_from(cx, &mut read_buf))?;
                (read_buf.filled().len(), addr)
            };
            let out = self.obfs.deobfuscate(&scratch[..n], buf);
            if out > 0 {
                return Poll::Ready(Ok((out, addr)));
            }
            // Undecodable packet, keep polling.
        }
    }

    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(closed_error());
        }
        let mut scratch = self.write_buf.lock().unwrap();
        let n = self.obfs.obfuscate(buf, &mut scratch);
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "packet too large to obfuscate",
            ));
        }
        self.socket.try_send_to(&scratch[..n], target)?;
        Ok(buf.len())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

/// UDP socket masquerading as a WeChat video call: every packet gets a
/// 13-byte pre-roll with an incrementing serial number, composed with the
/// optional obfuscator.
pub struct WeChatUdpSocket {
    socket: UdpSocket,
    obfs: Option<XPlusObfuscator>,
    serial: AtomicU32,
    read_buf: Mutex<Box<[u8]>>,
    write_buf: Mutex<Box<[u8]>>,
    closed: AtomicBool,
}

impl WeChatUdpSocket {
    pub fn new(socket: UdpSocket, obfs: Option<XPlusObfuscator>) -> Self {
        Self {
            socket,
            obfs,
            serial: AtomicU32::new(rand::rng().random_range(10_000..11_000)),
            read_buf: Mutex::new(vec![0u8; OBFS_BUFFER_SIZE].into_boxed_slice()),
            write_buf: Mutex::new(vec![0u8; OBFS_BUFFER_SIZE].into_boxed_slice()),
            closed: AtomicBool::new(false),
        }
    }

    fn fill_header(&self, header: &mut [u8]) {
        header[0] = 0xa1;
        header[1] = 0x08;
        header[2..6].copy_from_slice(&self.serial.fetch_add(1, Ordering::Relaxed).to_be_bytes());
        header[6] = 0x10;
        header[7] = 0x11;
        header[8] = 0x18;
        header[9] = 0x30;
        header[10] = 0x22;
        header[11] = 0x30;
        header[12] = rand::rng().random::<u8>();
    }
}

impl DatagramSocket for WeChatUdpSocket {
    fn poll_recv_from(
        &self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<(usize, SocketAddr)>> {
        if self.closed.load(Ordering::Relaxed) {
            return Poll::Pending;
        }
        let mut scratch = self.read_buf.lock().unwrap();
        loop {
            let (n, addr) = {
                let mut read_buf = ReadBuf::new(&mut scratch);
                let addr = ready!(self.socket.poll_recv_from(cx, &mut read_buf))?;
                (read_buf.filled().len(), addr)
            };
            if n <= WECHAT_HEADER_LEN {
                continue;
            }
            let body = &scratch[WECHAT_HEADER_LEN..n];
            let out = match &self.obfs {
                Some(obfs) => obfs.deobfuscate(body, buf),
                None => {
                    if body.len() > buf.len() {
                        continue;
                    }
                    buf[..body.len()].copy_from_slice(body);
                    body.len()
                }
            };
            if out > 0 {
                return Poll::Ready(Ok((out, addr)));
            }
        }
    }

    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(closed_error());
        }
        let mut scratch = self.write_buf.lock().unwrap();
        self.fill_header(&mut scratch[..WECHAT_HEADER_LEN]);
        let body_len = match &self.obfs {
            Some(obfs) => obfs.obfuscate(buf, &mut scratch[WECHAT_HEADER_LEN..]),
            None => {
                if scratch.len() - WECHAT_HEADER_LEN < buf.len() {
                    0
                } else {
                    scratch[WECHAT_HEADER_LEN..WECHAT_HEADER_LEN + buf.len()].copy_from_slice(buf);
                    buf.len()
                }
            }
        };
        if body_len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "packet too large for wechat framing",
            ));
        }
        self.socket
            .try_send_to(&scratch[..WECHAT_HEADER_LEN + body_len], target)?;
        Ok(buf.len())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::future::poll_fn;

    use super::*;

    async fn recv_from(socket: &dyn DatagramSocket, buf: &mut [u8]) -> (usize, SocketAddr) {
        poll_fn(|cx| socket.poll_recv_from(cx, buf)).await.unwrap()
    }

    #[tokio::test]
    async fn obfuscated_sockets_interoperate() {
        let server = "127.0.0.1:0".parse().unwrap();
        let a = ObfsUdpSocket::new(
            new_udp_socket(server).unwrap(),
            XPlusObfuscator::new(b"secret".to_vec()),
        );
        let b = ObfsUdpSocket::new(
            new_udp_socket(server).unwrap(),
            XPlusObfuscator::new(b"secret".to_vec()),
        );

        let b_addr = b.local_addr().unwrap();
        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), b_addr.port());
        assert_eq!(a.try_send_to(b"hello over obfs", target).unwrap(), 15);

        let mut buf = [0u8; 64];
        let (n, _) = recv_from(&b, &mut buf).await;
        assert_eq!(&buf[..n], b"hello over obfs");
    }

    #[tokio::test]
    async fn plain_receiver_sees_ciphertext() {
        let server = "127.0.0.1:0".parse().unwrap();
        let a = ObfsUdpSocket::new(
            new_udp_socket(server).unwrap(),
            XPlusObfuscator::new(b"secret".to_vec()),
        );
        let b = PlainUdpSocket::new(new_udp_socket(server).unwrap());

        let target = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            b.local_addr().unwrap().port(),
        );
        a.try_send_to(b"payload", target).unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = recv_from(&b, &mut buf).await;
        assert_eq!(n, 7 + crate::obfs::SALT_LEN);
        assert_ne!(&buf[..n], b"payload");
    }

    #[tokio::test]
    async fn wechat_framing_round_trips() {
        let server = "127.0.0.1:0".parse().unwrap();
        let obfs = XPlusObfuscator::new(b"k".to_vec());
        let a = WeChatUdpSocket::new(new_udp_socket(server).unwrap(), Some(obfs.clone()));
        let b = WeChatUdpSocket::new(new_udp_socket(server).unwrap(), Some(obfs));
        let plain = PlainUdpSocket::new(new_udp_socket(server).unwrap());

        let b_target = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            b.local_addr().unwrap().port(),
        );
        a.try_send_to(b"wechat payload", b_target).unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = recv_from(&b, &mut buf).await;
        assert_eq!(&buf[..n], b"wechat payload");

        // The raw packet leads with the fixed pre-roll bytes.
        let plain_target = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            plain.local_addr().unwrap().port(),
        );
        a.try_send_to(b"x", plain_target).unwrap();
        let (n, _) = recv_from(&plain, &mut buf).await;
        assert!(n > WECHAT_HEADER_LEN);
        assert_eq!(buf[0], 0xa1);
        assert_eq!(buf[1], 0x08);
    }

    #[tokio::test]
    async fn closed_socket_rejects_sends() {
        let server = "127.0.0.1:0".parse().unwrap();
        let socket = PlainUdpSocket::new(new_udp_socket(server).unwrap());
        socket.close();
        assert!(socket.try_send_to(b"x", server).is_err());
    }
}
