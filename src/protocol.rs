//! Hysteria wire protocol.
//!
//! The control stream carries a one-byte protocol version followed by a
//! `ClientHello`/`ServerHello` exchange; every proxy stream starts with a
//! `ClientRequest`/`ServerResponse` pair; UDP payloads travel as
//! `UdpMessage` envelopes on QUIC unreliable datagrams. All integers are
//! big-endian with fixed widths and `u16` length prefixes, matching the
//! deployed server implementation byte for byte.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Protocol version byte sent at the head of the control stream.
pub const PROTOCOL_VERSION: u8 = 3;

/// QUIC application close codes.
pub const CLOSE_ERROR_CODE_GENERIC: u32 = 0x00;
pub const CLOSE_ERROR_CODE_PROTOCOL: u32 = 0x10;
pub const CLOSE_ERROR_CODE_AUTH: u32 = 0x11;

async fn read_exact(recv: &mut quinn::RecvStream, buf: &mut [u8]) -> Result<()> {
    recv.read_exact(buf).await?;
    Ok(())
}

async fn read_u16_prefixed(recv: &mut quinn::RecvStream) -> Result<Vec<u8>> {
    let mut len = [0u8; 2];
    read_exact(recv, &mut len).await?;
    let mut data = vec![0u8; u16::from_be_bytes(len) as usize];
    read_exact(recv, &mut data).await?;
    Ok(data)
}

fn string_from_wire(data: Vec<u8>) -> Result<String> {
    String::from_utf8(data).map_err(|_| Error::Protocol("invalid UTF-8 string".to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub send_bps: u64,
    pub recv_bps: u64,
    pub auth: Vec<u8>,
}

impl ClientHello {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.send_bps);
        buf.put_u64(self.recv_bps);
        buf.put_u16(self.auth.len() as u16);
        buf.put_slice(&self.auth);
    }

    pub async fn read(recv: &mut quinn::RecvStream) -> Result<Self> {
        let mut fixed = [0u8; 16];
        read_exact(recv, &mut fixed).await?;
        let auth = read_u16_prefixed(recv).await?;
        Ok(Self {
            send_bps: u64::from_be_bytes(fixed[0..8].try_into().unwrap()),
            recv_bps: u64::from_be_bytes(fixed[8..16].try_into().unwrap()),
            auth,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub ok: bool,
    pub recv_bps: u64,
    pub message: String,
}

impl ServerHello {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.ok as u8);
        buf.put_u64(self.recv_bps);
        buf.put_u16(self.message.len() as u16);
        buf.put_slice(self.message.as_bytes());
    }

    pub async fn read(recv: &mut quinn::RecvStream) -> Result<Self> {
        let mut fixed = [0u8; 9];
        read_exact(recv, &mut fixed).await?;
        let message = string_from_wire(read_u16_prefixed(recv).await?)?;
        Ok(Self {
            ok: fixed[0] != 0,
            recv_bps: u64::from_be_bytes(fixed[1..9].try_into().unwrap()),
            message,
        })
    }
}

/// Per-stream request. UDP requests carry an empty host and port zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    pub udp: bool,
    pub host: String,
    pub port: u16,
}

impl ClientRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.udp as u8);
        buf.put_u16(self.host.len() as u16);
        buf.put_slice(self.host.as_bytes());
        buf.put_u16(self.port);
    }

    pub async fn read(recv: &mut quinn::RecvStream) -> Result<Self> {
        let mut udp = [0u8; 1];
        read_exact(recv, &mut udp).await?;
        let host = string_from_wire(read_u16_prefixed(recv).await?)?;
        let mut port = [0u8; 2];
        read_exact(recv, &mut port).await?;
        Ok(Self {
            udp: udp[0] != 0,
            host,
            port: u16::from_be_bytes(port),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerResponse {
    pub ok: bool,
    pub udp_session_id: u32,
    pub message: String,
}

impl ServerResponse {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.ok as u8);
        buf.put_u32(self.udp_session_id);
        buf.put_u16(self.message.len() as u16);
        buf.put_slice(self.message.as_bytes());
    }

    pub async fn read(recv: &mut quinn::RecvStream) -> Result<Self> {
        let mut fixed = [0u8; 5];
        read_exact(recv, &mut fixed).await?;
        let message = string_from_wire(read_u16_prefixed(recv).await?)?;
        Ok(Self {
            ok: fixed[0] != 0,
            udp_session_id: u32::from_be_bytes(fixed[1..5].try_into().unwrap()),
            message,
        })
    }

    /// Incremental decode for the fast-open read path: `None` until the
    /// buffered bytes contain a whole response, then the response and the
    /// number of bytes it consumed.
    pub fn decode_partial(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < 7 {
            return None;
        }
        let msg_len = u16::from_be_bytes([buf[5], buf[6]]) as usize;
        if buf.len() < 7 + msg_len {
            return None;
        }
        let message = String::from_utf8_lossy(&buf[7..7 + msg_len]).into_owned();
        Some((
            Self {
                ok: buf[0] != 0,
                udp_session_id: u32::from_be_bytes(buf[1..5].try_into().unwrap()),
                message,
            },
            7 + msg_len,
        ))
    }
}

/// UDP datagram envelope. `msg_id` is zero exactly when the message is
/// unfragmented (`frag_count == 1`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpMessage {
    pub session_id: u32,
    pub host: String,
    pub port: u16,
    pub msg_id: u16,
    pub frag_id: u8,
    pub frag_count: u8,
    pub data: Bytes,
}

impl UdpMessage {
    /// Encoded size of everything except the payload bytes.
    pub fn header_size(&self) -> usize {
        4 + 2 + self.host.len() + 2 + 2 + 1 + 1 + 2
    }

    pub fn encoded_size(&self) -> usize {
        self.header_size() + self.data.len()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        buf.put_u32(self.session_id);
        buf.put_u16(self.host.len() as u16);
        buf.put_slice(self.host.as_bytes());
        buf.put_u16(self.port);
        buf.put_u16(self.msg_id);
        buf.put_u8(self.frag_id);
        buf.put_u8(self.frag_count);
        buf.put_u16(self.data.len() as u16);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        if buf.remaining() < 6 {
            return Err(Error::Protocol("UDP message too short".to_string()));
        }
        let session_id = buf.get_u32();
        let host_len = buf.get_u16() as usize;
        if buf.remaining() < host_len + 8 {
            return Err(Error::Protocol("truncated UDP message".to_string()));
        }
        let host = string_from_wire(buf.split_to(host_len).to_vec())?;
        let port = buf.get_u16();
        let msg_id = buf.get_u16();
        let frag_id = buf.get_u8();
        let frag_count = buf.get_u8();
        let data_len = buf.get_u16() as usize;
        if buf.remaining() < data_len {
            return Err(Error::Protocol("truncated UDP payload".to_string()));
        }
        Ok(Self {
            session_id,
            host,
            port,
            msg_id,
            frag_id,
            frag_count,
            data: buf.split_to(data_len),
        })
    }
}
