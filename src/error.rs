use std::io;

/// Errors surfaced by the Hysteria client.
///
/// `NoConn` is an internal signal: stream opening observed an empty
/// connection slot and the client reconnects before it can reach a caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("QUIC connect failed: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("QUIC connection lost: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("stream write failed: {0}")]
    StreamWrite(#[from] quinn::WriteError),

    #[error("stream read failed: {0}")]
    StreamRead(#[from] quinn::ReadExactError),

    #[error("datagram send failed: {0}")]
    Datagram(#[from] quinn::SendDatagramError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("auth error: {0}")]
    AuthRejected(String),

    #[error("connection rejected: {0}")]
    ConnectionRejected(String),

    #[error("no connection")]
    NoConn,

    #[error("client closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
