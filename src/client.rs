//! Hysteria client: connection lifecycle, rate-limited reconnection and
//! stream dialing.
//!
//! The client dials lazily: the first `dial_tcp`/`dial_udp` resolves the
//! server, brings up the packet underlay (a single obfuscated socket, or
//! the port-hopping pool when a range is configured), dials QUIC through
//! it and runs the control-stream handshake. Stream opening escalates
//! through resets when the connection has gone bad: first a soft reset
//! that swaps the UDP socket under the live QUIC session, then a single
//! hard reset that re-dials end to end.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use log::{debug, info, warn};
use quinn::AsyncUdpSocket;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::address::NetLocation;
use crate::config::{
    ClientConfig, TransportProtocol, DEFAULT_ALPN, DEFAULT_CONNECTION_RECEIVE_WINDOW,
    DEFAULT_STREAM_RECEIVE_WINDOW,
};
use crate::config::parse_port_range;
use crate::congestion::BrutalConfig;
use crate::endpoint::{new_endpoint, new_transport_config, PacketConnStub, QuicParams};
use crate::error::{Error, Result};
use crate::obfs::XPlusObfuscator;
use crate::pktconn::{new_packet_conn, DatagramSocket};
use crate::port_pool::{PortHoppingPool, DEFAULT_CONCURRENT};
use crate::protocol::{
    ClientHello, ClientRequest, ServerHello, ServerResponse, CLOSE_ERROR_CODE_AUTH,
    CLOSE_ERROR_CODE_GENERIC, CLOSE_ERROR_CODE_PROTOCOL, PROTOCOL_VERSION,
};
use crate::session::{run_demux, UdpSessionRegistry};
use crate::stream::{TcpConn, UdpConn};
use crate::tls;

/// Bound on control-stream open plus handshake.
const PROTOCOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Non-forced reconnects within this window of the last connect are
/// coalesced into a no-op.
const SERVER_CONN_INTERVAL: Duration = Duration::from_secs(5);

enum Underlay {
    Single(Arc<dyn DatagramSocket>),
    Pool(Arc<PortHoppingPool>),
}

impl Underlay {
    fn as_socket(&self) -> Arc<dyn DatagramSocket> {
        match self {
            Underlay::Single(socket) => socket.clone(),
            Underlay::Pool(pool) => pool.clone(),
        }
    }

    fn close(&self) {
        self.as_socket().close();
    }
}

#[derive(Default)]
struct ClientInner {
    endpoint: Option<quinn::Endpoint>,
    stub: Option<Arc<PacketConnStub>>,
    underlay: Option<Underlay>,
    conn: Option<quinn::Connection>,
    registry: Option<Arc<UdpSessionRegistry>>,
    // The control stream stays open for the life of the connection.
    control: Option<(quinn::SendStream, quinn::RecvStream)>,
    demux: Option<tokio::task::JoinHandle<()>>,
    last_connect_at: Option<Instant>,
}

struct OpenedStream {
    conn: quinn::Connection,
    send: quinn::SendStream,
    recv: quinn::RecvStream,
    registry: Arc<UdpSessionRegistry>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

pub struct Client {
    server: String,
    server_name: String,
    protocol: TransportProtocol,
    send_bps: u64,
    recv_bps: u64,
    auth: Vec<u8>,
    fast_open: bool,
    obfs: Option<XPlusObfuscator>,
    port_range: Option<(u16, u16)>,
    concurrent: usize,
    tls_config: Arc<rustls::ClientConfig>,
    quic_params: QuicParams,
    /// Server-advertised receive rate, feeding the Brutal sender.
    bandwidth: Arc<AtomicU64>,
    closed: AtomicBool,
    // Serializes connect, reconnect and stream opening: at most one QUIC
    // dial is ever in flight.
    inner: Mutex<ClientInner>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let server_location = NetLocation::from_str(&config.server, None)
            .map_err(|e| Error::Config(format!("invalid server address: {}", e)))?;
        let (send_bps, recv_bps) = config.speed()?;

        let server_name = config
            .sni
            .clone()
            .unwrap_or_else(|| server_location.address().to_string());

        let fingerprint = match &config.fingerprint {
            Some(fingerprint) => Some(tls::decode_fingerprint(fingerprint)?),
            None => ca_fingerprint(&config)?,
        };
        let alpn = config.alpn.as_deref().unwrap_or(DEFAULT_ALPN);
        let tls_config = Arc::new(tls::build_client_config(
            fingerprint,
            config.skip_cert_verify,
            alpn,
        ));

        let concurrent = config.hop_interval.unwrap_or(DEFAULT_CONCURRENT).max(1);
        let port_range = match &config.ports {
            Some(ports) => {
                let range = parse_port_range(ports)
                    .ok_or_else(|| Error::Config(format!("invalid port range: {}", ports)))?;
                let span = (range.1 - range.0) as usize + 1;
                if span <= concurrent {
                    return Err(Error::Config(format!(
                        "port range {} too small for {} concurrent sockets",
                        ports, concurrent
                    )));
                }
                Some(range)
            }
            None => None,
        };

        Ok(Self {
            server: config.server.clone(),
            server_name,
            protocol: config.protocol,
            send_bps,
            recv_bps,
            auth: config
                .auth_str
                .as_deref()
                .unwrap_or_default()
                .as_bytes()
                .to_vec(),
            fast_open: config.fast_open,
            obfs: config
                .obfs
                .as_deref()
                .map(|secret| XPlusObfuscator::new(secret.as_bytes().to_vec())),
            port_range,
            concurrent,
            tls_config,
            quic_params: QuicParams {
                stream_receive_window: config
                    .recv_window_conn
                    .unwrap_or(DEFAULT_STREAM_RECEIVE_WINDOW),
                conn_receive_window: config.recv_window.unwrap_or(DEFAULT_CONNECTION_RECEIVE_WINDOW),
                disable_mtu_discovery: config.disable_mtu_discovery,
            },
            bandwidth: Arc::new(AtomicU64::new(0)),
            closed: AtomicBool::new(false),
            inner: Mutex::new(ClientInner::default()),
        })
    }

    /// Opens a proxied TCP connection to `addr` (`host:port`).
    pub async fn dial_tcp(&self, addr: &str) -> Result<TcpConn> {
        let location = NetLocation::from_str(addr, None)
            .map_err(|e| Error::Config(format!("invalid address {}: {}", addr, e)))?;
        let mut opened = self.open_stream_with_reconnect().await?;

        let request = ClientRequest {
            udp: false,
            host: location.address().to_string(),
            port: location.port(),
        };
        let mut buf = BytesMut::new();
        request.encode(&mut buf);
        if let Err(e) = opened.send.write_all(&buf).await {
            let _ = opened.send.finish();
            return Err(e.into());
        }

        if !self.fast_open {
            let response = match ServerResponse::read(&mut opened.recv).await {
                Ok(response) => response,
                Err(e) => {
                    let _ = opened.send.finish();
                    return Err(e);
                }
            };
            if !response.ok {
                let _ = opened.send.finish();
                return Err(Error::ConnectionRejected(response.message));
            }
        }

        Ok(TcpConn::new(
            opened.send,
            opened.recv,
            opened.local_addr,
            opened.remote_addr,
            !self.fast_open,
        ))
    }

    /// Opens a proxied UDP flow. The server assigns the session id.
    pub async fn dial_udp(&self) -> Result<UdpConn> {
        let mut opened = self.open_stream_with_reconnect().await?;

        let request = ClientRequest {
            udp: true,
            host: String::new(),
            port: 0,
        };
        let mut buf = BytesMut::new();
        request.encode(&mut buf);
        if let Err(e) = opened.send.write_all(&buf).await {
            let _ = opened.send.finish();
            return Err(e.into());
        }

        let response = match ServerResponse::read(&mut opened.recv).await {
            Ok(response) => response,
            Err(e) => {
                let _ = opened.send.finish();
                return Err(e);
            }
        };
        if !response.ok {
            let _ = opened.send.finish();
            return Err(Error::ConnectionRejected(response.message));
        }

        // Register against the registry captured with the stream, so a
        // racing reconnect cannot strand the session in a stale map.
        let receiver = opened.registry.create_session(response.udp_session_id);
        Ok(UdpConn::new(
            opened.conn,
            response.udp_session_id,
            receiver,
            opened.registry,
            opened.send,
            opened.recv,
            opened.local_addr,
        ))
    }

    /// Terminal close: fails every subsequent operation with
    /// `ClientClosed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        let mut inner = self.inner.lock().await;
        info!("closing client for {}", self.server);
        if let Some(task) = inner.demux.take() {
            task.abort();
        }
        if let Some(conn) = inner.conn.take() {
            conn.close(CLOSE_ERROR_CODE_GENERIC.into(), b"");
        }
        inner.control = None;
        inner.registry = None;
        match inner.underlay.take() {
            Some(Underlay::Pool(pool)) => pool.shutdown().await,
            Some(underlay) => underlay.close(),
            None => {}
        }
        inner.stub = None;
        if let Some(endpoint) = inner.endpoint.take() {
            endpoint.close(CLOSE_ERROR_CODE_GENERIC.into(), b"");
        }
    }

    async fn open_stream_with_reconnect(&self) -> Result<OpenedStream> {
        let mut inner = self.inner.lock().await;
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::Closed);
        }

        if inner.conn.is_none() {
            self.connect_locked(&mut inner).await?;
        }
        match Self::open_stream(&inner).await {
            Ok(opened) => return Ok(opened),
            Err(Error::Closed) => return Err(Error::Closed),
            Err(e) => debug!("open stream failed: {}, trying soft reset", e),
        }

        // Soft reset first: swap the UDP underlay under the live session.
        self.reconnect_locked(&mut inner, false).await?;
        match Self::open_stream(&inner).await {
            Ok(opened) => return Ok(opened),
            Err(Error::Closed) => return Err(Error::Closed),
            Err(e) => warn!("open stream failed after soft reset: {}, reconnecting", e),
        }

        // Then one hard reset. No further retries after this.
        self.reconnect_locked(&mut inner, true).await?;
        Self::open_stream(&inner).await
    }

    async fn open_stream(inner: &ClientInner) -> Result<OpenedStream> {
        let conn = inner.conn.clone().ok_or(Error::NoConn)?;
        let registry = inner.registry.clone().ok_or(Error::NoConn)?;
        let (send, recv) = conn.open_bi().await?;
        let local_addr = inner
            .stub
            .as_ref()
            .and_then(|stub| stub.local_addr().ok())
            .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
        let remote_addr = conn.remote_address();
        Ok(OpenedStream {
            conn,
            send,
            recv,
            registry,
            local_addr,
            remote_addr,
        })
    }

    async fn reconnect_locked(&self, inner: &mut ClientInner, force: bool) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::Closed);
        }
        if !force {
            if let Some(at) = inner.last_connect_at {
                if at.elapsed() < SERVER_CONN_INTERVAL {
                    debug!("reconnect suppressed, last connect {:?} ago", at.elapsed());
                    return Ok(());
                }
            }
            if inner.conn.is_some() {
                if let Some(stub) = inner.stub.clone() {
                    self.soft_reset(inner, &stub).await?;
                    return Ok(());
                }
            }
            return self.connect_locked(inner).await;
        }
        self.connect_locked(inner).await
    }

    /// Replaces the UDP socket beneath the live QUIC session.
    async fn soft_reset(&self, inner: &mut ClientInner, stub: &Arc<PacketConnStub>) -> Result<()> {
        let server_addr = self.resolve_server().await?;
        let fresh = self.new_underlay(server_addr)?;
        info!("soft reset: swapping packet underlay");
        stub.swap(fresh.as_socket());
        if let Some(old) = inner.underlay.replace(fresh) {
            old.close();
        }
        inner.last_connect_at = Some(Instant::now());
        Ok(())
    }

    /// Full dial: underlay, QUIC connection, control-stream handshake.
    async fn connect_locked(&self, inner: &mut ClientInner) -> Result<()> {
        // Clear the previous connection.
        if let Some(conn) = inner.conn.take() {
            conn.close(CLOSE_ERROR_CODE_GENERIC.into(), b"");
        }
        if let Some(task) = inner.demux.take() {
            task.abort();
        }
        inner.control = None;
        inner.registry = None;

        info!("connecting to {}", self.server);
        let server_addr = self.resolve_server().await?;
        let underlay = self.new_underlay(server_addr)?;

        let endpoint = match (inner.endpoint.clone(), inner.stub.clone()) {
            (Some(endpoint), Some(stub)) => {
                stub.swap(underlay.as_socket());
                endpoint
            }
            _ => {
                let stub = Arc::new(PacketConnStub::new(underlay.as_socket()));
                let endpoint = new_endpoint(stub.clone()).map_err(Error::Io)?;
                inner.stub = Some(stub);
                inner.endpoint = Some(endpoint.clone());
                endpoint
            }
        };
        if let Some(old) = inner.underlay.replace(underlay) {
            old.close();
        }

        let quic_client_config =
            quinn::crypto::rustls::QuicClientConfig::try_from((*self.tls_config).clone())
                .map_err(|e| Error::Config(format!("TLS config rejected for QUIC: {}", e)))?;
        let mut client_config = quinn::ClientConfig::new(Arc::new(quic_client_config));
        client_config.transport_config(Arc::new(new_transport_config(
            &self.quic_params,
            Arc::new(BrutalConfig::new(self.bandwidth.clone())),
        )));

        let conn = endpoint
            .connect_with(client_config, server_addr, &self.server_name)?
            .await?;

        match self.handshake(&conn).await {
            Ok((control, server_recv_bps)) => {
                debug!(
                    "handshake done, server receive rate {} B/s",
                    server_recv_bps
                );
                self.bandwidth.store(server_recv_bps, Ordering::Relaxed);
                let registry = Arc::new(UdpSessionRegistry::new());
                inner.demux = Some(tokio::spawn(run_demux(conn.clone(), registry.clone())));
                inner.registry = Some(registry);
                inner.control = Some(control);
                inner.conn = Some(conn);
                inner.last_connect_at = Some(Instant::now());
                Ok(())
            }
            Err(e) => {
                let code = match e {
                    Error::AuthRejected(_) => CLOSE_ERROR_CODE_AUTH,
                    _ => CLOSE_ERROR_CODE_PROTOCOL,
                };
                conn.close(code.into(), b"");
                Err(e)
            }
        }
    }

    async fn handshake(
        &self,
        conn: &quinn::Connection,
    ) -> Result<((quinn::SendStream, quinn::RecvStream), u64)> {
        let opened = timeout(PROTOCOL_TIMEOUT, conn.open_bi())
            .await
            .map_err(|_| Error::Protocol("control stream open timed out".to_string()))?;
        let (mut send, mut recv) = opened?;

        let mut buf = BytesMut::new();
        buf.put_u8(PROTOCOL_VERSION);
        ClientHello {
            send_bps: self.send_bps,
            recv_bps: self.recv_bps,
            auth: self.auth.clone(),
        }
        .encode(&mut buf);
        send.write_all(&buf).await?;

        let hello = timeout(PROTOCOL_TIMEOUT, ServerHello::read(&mut recv))
            .await
            .map_err(|_| Error::Protocol("server hello timed out".to_string()))??;
        if !hello.ok {
            return Err(Error::AuthRejected(hello.message));
        }
        Ok(((send, recv), hello.recv_bps))
    }

    async fn resolve_server(&self) -> Result<SocketAddr> {
        let mut addrs = tokio::net::lookup_host(self.server.as_str())
            .await
            .map_err(Error::Io)?;
        addrs
            .next()
            .ok_or_else(|| Error::Config(format!("could not resolve {}", self.server)))
    }

    fn new_underlay(&self, server_addr: SocketAddr) -> Result<Underlay> {
        match self.port_range {
            Some(range) => {
                let pool = Arc::new(PortHoppingPool::new(
                    server_addr,
                    range,
                    self.protocol,
                    self.obfs.clone(),
                    self.concurrent,
                ));
                pool.init().map_err(Error::Io)?;
                Ok(Underlay::Pool(pool))
            }
            None => Ok(Underlay::Single(
                new_packet_conn(server_addr, self.protocol, self.obfs.as_ref())
                    .map_err(Error::Io)?,
            )),
        }
    }
}

fn ca_fingerprint(config: &ClientConfig) -> Result<Option<Vec<u8>>> {
    use rustls::pki_types::pem::PemObject;

    let pem_bytes = match (&config.ca, &config.ca_str) {
        (Some(path), _) => std::fs::read(path)
            .map_err(|e| Error::Config(format!("could not read CA {}: {}", path.display(), e)))?,
        (None, Some(ca_str)) => ca_str.as_bytes().to_vec(),
        (None, None) => return Ok(None),
    };
    let der = rustls::pki_types::CertificateDer::from_pem_slice(&pem_bytes)
        .map_err(|e| Error::Config(format!("CA cert is not PEM: {:?}", e)))?;
    Ok(Some(tls::sha256(der.as_ref())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ClientConfig {
        ClientConfig {
            server: "127.0.0.1:28443".to_string(),
            up: "10 Mbps".to_string(),
            down: "50 Mbps".to_string(),
            skip_cert_verify: true,
            ..Default::default()
        }
    }

    #[test]
    fn rejects_bad_rates() {
        let mut config = base_config();
        config.up = "0".to_string();
        assert!(matches!(Client::new(config), Err(Error::Config(_))));

        let mut config = base_config();
        config.down = "warp speed".to_string();
        assert!(matches!(Client::new(config), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_bad_port_ranges() {
        let mut config = base_config();
        config.ports = Some("9000-8000".to_string());
        assert!(matches!(Client::new(config), Err(Error::Config(_))));

        // Range must leave room to rotate into.
        let mut config = base_config();
        config.ports = Some("9000-9001".to_string());
        config.hop_interval = Some(2);
        assert!(matches!(Client::new(config), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_bad_fingerprints() {
        let mut config = base_config();
        config.fingerprint = Some("not hex".to_string());
        assert!(matches!(Client::new(config), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_bad_ca_pem() {
        let mut config = base_config();
        config.ca_str = Some("definitely not pem".to_string());
        assert!(matches!(Client::new(config), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn closed_client_fails_fast() {
        let client = Client::new(base_config()).unwrap();
        client.close().await;
        assert!(matches!(
            client.dial_tcp("example.com:80").await,
            Err(Error::Closed)
        ));
        assert!(matches!(client.dial_udp().await, Err(Error::Closed)));
        // Idempotent.
        client.close().await;
    }
}
