//! hysteria-client - client-side transport for the Hysteria protocol.
//!
//! Multiplexes TCP and UDP application flows over an authenticated QUIC
//! connection with the fixed-rate "Brutal" congestion controller, an
//! optional XPlus packet obfuscation layer, and an optional multi-path
//! UDP underlay that rotates across a range of server ports.
//!
//! ```no_run
//! use hysteria_client::{Client, ClientConfig};
//!
//! # async fn run() -> hysteria_client::Result<()> {
//! let config: ClientConfig = serde_yaml::from_str(
//!     r#"
//! server: example.com:443
//! up: "20 Mbps"
//! down: "100 Mbps"
//! auth_str: hunter2
//! "#,
//! )
//! .unwrap();
//! let client = Client::new(config)?;
//! let conn = client.dial_tcp("example.com:80").await?;
//! # drop(conn);
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod client;
pub mod config;
pub mod congestion;
mod endpoint;
pub mod error;
pub mod frag;
pub mod obfs;
pub mod pktconn;
pub mod port_pool;
pub mod protocol;
pub mod session;
pub mod stream;
mod tls;

pub use client::Client;
pub use config::{ClientConfig, TransportProtocol};
pub use error::{Error, Result};
pub use stream::{TcpConn, UdpConn};
