//! Multi-path UDP pool.
//!
//! Presents a single logical `DatagramSocket` that is internally a set of
//! `concurrent` sockets, each bound to a different randomly chosen server
//! port from the configured range. Every routine carries a randomized send
//! budget; exhausting it rotates the routine out in favour of a socket to
//! a fresh port, so no single 4-tuple carries traffic for long. Retired
//! sockets stay readable for a while (packets already in flight) before
//! their history chunk is closed.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use log::{debug, error, info};
use rand::Rng;
use tokio::sync::mpsc;

use crate::config::TransportProtocol;
use crate::obfs::XPlusObfuscator;
use crate::pktconn::{new_packet_conn, DatagramSocket};

/// Pool-wide receive queue depth; packets are dropped beyond it.
const PACKET_QUEUE_SIZE: usize = 128;

/// Receive buffer per packet, Ethernet-MTU-ish.
const RECV_BUFFER_SIZE: usize = 1500;

/// Base send budget per routine; the actual budget is randomized in
/// `[base, 2*base)`. A fatal read error poisons the counter with
/// `3 * base` so the routine rotates out on its next pick.
const ROUTINE_MAX_SEND: u32 = 32 * 1024;

pub const DEFAULT_CONCURRENT: usize = 2;

/// Grace period before retiring sockets on close, covering in-flight
/// reads.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

enum WriteStatus {
    MaxSend,
    Io(io::Error),
}

enum RotateError {
    Rotated,
    Closed,
    Io(io::Error),
}

struct Routine {
    addr_idx: usize,
    remote: SocketAddr,
    socket: Arc<dyn DatagramSocket>,
    send_counter: Arc<AtomicU32>,
    max_send: u32,
    recv_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Routine {
    fn write_to(&self, buf: &[u8]) -> Result<usize, WriteStatus> {
        let sent = self.send_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if sent > self.max_send {
            return Err(WriteStatus::MaxSend);
        }
        self.socket
            .try_send_to(buf, self.remote)
            .map_err(WriteStatus::Io)
    }

    fn close(&self) {
        self.socket.close();
        if let Some(task) = self.recv_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

struct PoolState {
    work: Vec<Arc<Routine>>,
    used_idx: HashSet<usize>,
    history: Vec<Arc<Routine>>,
}

pub struct PortHoppingPool {
    server_addr: SocketAddr,
    addr_pool: Vec<SocketAddr>,
    protocol: TransportProtocol,
    obfs: Option<XPlusObfuscator>,
    concurrent: usize,
    send_budget: u32,
    state: Mutex<PoolState>,
    recv_tx: mpsc::Sender<Box<[u8]>>,
    recv_rx: Mutex<mpsc::Receiver<Box<[u8]>>>,
    closed: AtomicBool,
}

impl PortHoppingPool {
    /// `server_addr` is the address QUIC believes it talks to; the pool
    /// fans packets out to `port_range` on the same host.
    pub fn new(
        server_addr: SocketAddr,
        port_range: (u16, u16),
        protocol: TransportProtocol,
        obfs: Option<XPlusObfuscator>,
        concurrent: usize,
    ) -> Self {
        let addr_pool = (port_range.0..=port_range.1)
            .map(|port| SocketAddr::new(server_addr.ip(), port))
            .collect();
        let (recv_tx, recv_rx) = mpsc::channel(PACKET_QUEUE_SIZE);
        Self {
            server_addr,
            addr_pool,
            protocol,
            obfs,
            concurrent: concurrent.max(1),
            send_budget: ROUTINE_MAX_SEND,
            state: Mutex::new(PoolState {
                work: Vec::new(),
                used_idx: HashSet::new(),
                history: Vec::new(),
            }),
            recv_tx,
            recv_rx: Mutex::new(recv_rx),
            closed: AtomicBool::new(false),
        }
    }

    /// Brings up the initial routines on distinct random ports.
    pub fn init(&self) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        let count = self.concurrent.min(self.addr_pool.len());
        let indices = rand::seq::index::sample(&mut rand::rng(), self.addr_pool.len(), count);
        for idx in indices {
            let routine = self.spawn_routine(idx)?;
            state.work.push(routine.clone());
            state.used_idx.insert(idx);
            state.history.push(routine);
        }
        Ok(())
    }

    fn spawn_routine(&self, idx: usize) -> io::Result<Arc<Routine>> {
        let remote = self.addr_pool[idx];
        let socket = new_packet_conn(remote, self.protocol, self.obfs.as_ref())?;
        let max_send = rand::rng().random_range(self.send_budget..2 * self.send_budget);
        let routine = Arc::new(Routine {
            addr_idx: idx,
            remote,
            socket: socket.clone(),
            send_counter: Arc::new(AtomicU32::new(0)),
            max_send,
            recv_task: Mutex::new(None),
        });
        debug!(
            "port pool: new routine to {}, budget {}",
            remote, max_send
        );

        let recv_tx = self.recv_tx.clone();
        let counter = routine.send_counter.clone();
        let poison = 3 * self.send_budget;
        let task = tokio::spawn(async move {
            let mut buf = [0u8; RECV_BUFFER_SIZE];
            loop {
                let result =
                    std::future::poll_fn(|cx| socket.poll_recv_from(cx, &mut buf)).await;
                match result {
                    Ok((n, _addr)) => match recv_tx.try_send(Box::from(&buf[..n])) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            debug!("port pool: receive queue full, dropped {} bytes", n);
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    },
                    Err(e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::Interrupted =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("port pool: receive loop ended: {}", e);
                        counter.store(poison, Ordering::Relaxed);
                        break;
                    }
                }
            }
        });
        *routine.recv_task.lock().unwrap() = Some(task);
        Ok(routine)
    }

    fn pick(&self) -> Option<Arc<Routine>> {
        let state = self.state.lock().unwrap();
        if state.work.is_empty() {
            return None;
        }
        let i = rand::rng().random_range(0..state.work.len());
        Some(state.work[i].clone())
    }

    fn rotate(&self, stale: &Arc<Routine>) -> Result<Arc<Routine>, RotateError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(RotateError::Closed);
        }
        let mut state = self.state.lock().unwrap();
        let Some(pos) = state.work.iter().position(|r| Arc::ptr_eq(r, stale)) else {
            // Another writer already rotated this routine out.
            return Err(RotateError::Rotated);
        };
        if state.used_idx.len() >= self.addr_pool.len() {
            return Err(RotateError::Rotated);
        }

        let mut rng = rand::rng();
        let idx = loop {
            let candidate = rng.random_range(0..self.addr_pool.len());
            if !state.used_idx.contains(&candidate) {
                break candidate;
            }
        };
        let fresh = self.spawn_routine(idx).map_err(RotateError::Io)?;
        info!("port pool: rotating {} -> {}", stale.remote, fresh.remote);

        state.work.swap_remove(pos);
        state.used_idx.remove(&stale.addr_idx);
        state.work.push(fresh.clone());
        state.used_idx.insert(idx);
        state.history.push(fresh.clone());

        if state.history.len() >= 4 * self.concurrent {
            let retired: Vec<Arc<Routine>> = state.history.drain(..self.concurrent).collect();
            for routine in retired {
                debug!("port pool: closing {}", routine.remote);
                routine.close();
            }
        }

        Ok(fresh)
    }

    /// Graceful close: a grace period for in-flight operations, then every
    /// socket ever created, then the receive queue.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        tokio::time::sleep(CLOSE_GRACE).await;
        let routines = self.drain_routines();
        for routine in &routines {
            routine.close();
        }
        tokio::time::sleep(CLOSE_GRACE).await;
        self.recv_rx.lock().unwrap().close();
    }

    fn drain_routines(&self) -> Vec<Arc<Routine>> {
        let mut state = self.state.lock().unwrap();
        state.work.clear();
        state.used_idx.clear();
        state.history.drain(..).collect()
    }

    #[cfg(test)]
    fn set_send_budget(&mut self, budget: u32) {
        self.send_budget = budget;
    }

    #[cfg(test)]
    fn snapshot(&self) -> (usize, HashSet<usize>, usize) {
        let state = self.state.lock().unwrap();
        let from_work: HashSet<usize> = state.work.iter().map(|r| r.addr_idx).collect();
        assert_eq!(
            from_work, state.used_idx,
            "used_idx out of sync with work pool"
        );
        (state.work.len(), state.used_idx.clone(), state.history.len())
    }
}

impl DatagramSocket for PortHoppingPool {
    fn poll_recv_from(
        &self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<(usize, SocketAddr)>> {
        let mut receiver = self.recv_rx.lock().unwrap();
        match receiver.poll_recv(cx) {
            Poll::Ready(Some(packet)) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Poll::Ready(Ok((n, self.server_addr)))
            }
            // Deliberate silent EOF: erroring here would break QUIC
            // connection reuse across a close.
            Poll::Ready(None) => Poll::Pending,
            Poll::Pending => Poll::Pending,
        }
    }

    fn try_send_to(&self, buf: &[u8], _target: SocketAddr) -> io::Result<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "pool closed"));
        }

        let mut last_error = None;
        for _ in 0..self.concurrent {
            let Some(routine) = self.pick() else { break };
            match routine.write_to(buf) {
                Ok(n) => return Ok(n),
                Err(WriteStatus::MaxSend) => match self.rotate(&routine) {
                    Ok(fresh) => {
                        return match fresh.write_to(buf) {
                            Ok(n) => Ok(n),
                            Err(WriteStatus::Io(e)) => Err(e),
                            // A brand-new routine cannot be over budget.
                            Err(WriteStatus::MaxSend) => Ok(buf.len()),
                        };
                    }
                    Err(RotateError::Rotated) => continue,
                    Err(RotateError::Closed) => {
                        return Err(io::Error::new(io::ErrorKind::NotConnected, "pool closed"))
                    }
                    Err(RotateError::Io(e)) => return Err(e),
                },
                Err(WriteStatus::Io(e)) => {
                    error!("port pool: write to {} failed: {}", routine.remote, e);
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) => Err(e),
            // Out of attempts: drop the packet, UDP semantics.
            None => Ok(buf.len()),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        let state = self.state.lock().unwrap();
        state
            .history
            .last()
            .or_else(|| state.work.last())
            .map(|r| r.socket.local_addr())
            .unwrap_or_else(|| {
                Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "pool has no routines",
                ))
            })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        let routines = self.drain_routines();
        tokio::spawn(async move {
            tokio::time::sleep(CLOSE_GRACE).await;
            for routine in &routines {
                routine.close();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::future::poll_fn;
    use std::net::{IpAddr, Ipv4Addr};

    use tokio::net::UdpSocket;

    use super::*;

    const RANGE: (u16, u16) = (29_800, 29_809);

    async fn bind_listeners(range: (u16, u16)) -> Vec<UdpSocket> {
        let mut listeners = Vec::new();
        for port in range.0..=range.1 {
            listeners.push(
                UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
                    .await
                    .unwrap(),
            );
        }
        listeners
    }

    fn new_pool(range: (u16, u16), concurrent: usize, budget: u32) -> PortHoppingPool {
        let server_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), range.0);
        let mut pool = PortHoppingPool::new(
            server_addr,
            range,
            TransportProtocol::Udp,
            None,
            concurrent,
        );
        pool.set_send_budget(budget);
        pool
    }

    #[tokio::test]
    async fn init_establishes_invariants() {
        let pool = new_pool((29_820, 29_829), 2, 4);
        pool.init().unwrap();
        let (work, used, history) = pool.snapshot();
        assert_eq!(work, 2);
        assert_eq!(used.len(), 2);
        assert_eq!(history, 2);
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rotation_under_send_pressure() {
        let _listeners = bind_listeners(RANGE).await;
        let pool = new_pool(RANGE, 2, 4);
        pool.init().unwrap();

        let server_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), RANGE.0);
        for _ in 0..100 {
            let _ = pool.try_send_to(b"packet", server_addr);
        }

        let (work, used, history) = pool.snapshot();
        assert_eq!(work, 2);
        assert_eq!(used.len(), 2);
        // 100 sends over budgets of 4..8 forces many rotations; history is
        // trimmed in chunks of `concurrent` once it reaches 4x.
        assert!(history > 2, "expected at least one rotation");
        assert!(history < 4 * 2 + 2, "history was never retired");

        pool.shutdown().await;
        let state = pool.state.lock().unwrap();
        assert!(state.work.is_empty());
        assert!(state.history.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn packets_spread_across_server_ports() {
        let listeners = bind_listeners((29_840, 29_849)).await;
        let pool = new_pool((29_840, 29_849), 2, 8);
        pool.init().unwrap();

        let server_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 29_840);
        for _ in 0..200 {
            let _ = pool.try_send_to(b"spread", server_addr);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut ports_hit = 0;
        let mut buf = [0u8; 64];
        for listener in &listeners {
            if listener.try_recv_from(&mut buf).is_ok() {
                ports_hit += 1;
            }
        }
        assert!(
            ports_hit >= 3,
            "expected traffic on several ports, saw {}",
            ports_hit
        );
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pool_receives_from_any_routine_port() {
        let listeners = bind_listeners((29_860, 29_869)).await;
        let pool = new_pool((29_860, 29_869), 2, 1000);
        pool.init().unwrap();

        let server_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 29_860);
        pool.try_send_to(b"marco", server_addr).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Whichever listener got the packet answers to its source.
        let mut buf = [0u8; 64];
        let mut answered = false;
        for listener in &listeners {
            if let Ok((n, from)) = listener.try_recv_from(&mut buf) {
                assert_eq!(&buf[..n], b"marco");
                listener.send_to(b"polo", from).await.unwrap();
                answered = true;
            }
        }
        assert!(answered);

        let (n, addr) = tokio::time::timeout(
            Duration::from_secs(2),
            poll_fn(|cx| pool.poll_recv_from(cx, &mut buf)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(&buf[..n], b"polo");
        // Receives are reported as coming from the logical server address.
        assert_eq!(addr, server_addr);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn closed_pool_rejects_sends() {
        let pool = new_pool((29_880, 29_889), 2, 4);
        pool.init().unwrap();
        pool.shutdown().await;
        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 29_880);
        assert!(pool.try_send_to(b"x", target).is_err());
    }
}
