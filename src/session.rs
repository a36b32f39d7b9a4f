//! UDP session registry and datagram demultiplexer.
//!
//! Each `dial_udp` call owns one `session_id` entry. The demux task is the
//! single producer for every session queue; queues are bounded and the
//! dispatch path never blocks, dropping messages when a consumer falls
//! behind.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::debug;
use tokio::sync::mpsc;

use crate::frag::Defragger;
use crate::protocol::UdpMessage;

/// Per-session queue depth before messages are dropped.
const SESSION_QUEUE_SIZE: usize = 8;

#[derive(Default)]
pub struct UdpSessionRegistry {
    sessions: RwLock<HashMap<u32, mpsc::Sender<UdpMessage>>>,
}

impl UdpSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session and hands back the consumer endpoint. The
    /// receiver yields `None` once the session is closed.
    pub fn create_session(&self, session_id: u32) -> mpsc::Receiver<UdpMessage> {
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_SIZE);
        self.sessions.write().unwrap().insert(session_id, tx);
        rx
    }

    pub fn close_session(&self, session_id: u32) {
        self.sessions.write().unwrap().remove(&session_id);
    }

    /// Delivers a reassembled message to its session queue. Unknown
    /// sessions and full queues drop the message.
    pub fn dispatch(&self, msg: UdpMessage) {
        let sessions = self.sessions.read().unwrap();
        if let Some(tx) = sessions.get(&msg.session_id) {
            let session_id = msg.session_id;
            if let Err(err) = tx.try_send(msg) {
                if let mpsc::error::TrySendError::Full(dropped) = err {
                    debug!(
                        "udp session {}: queue full, dropped {} bytes",
                        session_id,
                        dropped.data.len()
                    );
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }
}

/// Reads QUIC datagrams for the life of the connection, reassembling and
/// dispatching them. Malformed datagrams are skipped; a connection error
/// ends the loop.
pub(crate) async fn run_demux(conn: quinn::Connection, registry: Arc<UdpSessionRegistry>) {
    let mut defragger = Defragger::default();
    loop {
        let data = match conn.read_datagram().await {
            Ok(data) => data,
            Err(_) => break,
        };
        let msg = match UdpMessage::decode(data) {
            Ok(msg) => msg,
            Err(_) => continue,
        };
        if let Some(complete) = defragger.feed(msg) {
            registry.dispatch(complete);
        }
    }
}
