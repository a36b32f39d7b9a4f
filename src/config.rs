use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default ALPN offered to the server.
pub const DEFAULT_ALPN: &str = "hysteria";

/// Default per-stream receive window (15 MiB).
pub const DEFAULT_STREAM_RECEIVE_WINDOW: u64 = 15_728_640;

/// Default per-connection receive window (64 MiB).
pub const DEFAULT_CONNECTION_RECEIVE_WINDOW: u64 = 67_108_864;

/// Packet framing used on the raw UDP underlay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportProtocol {
    #[default]
    Udp,
    WechatVideo,
}

/// Client options, decodable from the YAML shape used by proxy frontends.
///
/// `up` and `down` are rate strings: a bare integer means Mbps, otherwise
/// `<int>[KMGT]?[Bb]ps` where `B` is bytes and `b` is bits.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ClientConfig {
    pub server: String,
    #[serde(default)]
    pub protocol: TransportProtocol,
    pub up: String,
    pub down: String,
    #[serde(default)]
    pub auth_str: Option<String>,
    #[serde(default)]
    pub obfs: Option<String>,
    #[serde(default)]
    pub sni: Option<String>,
    #[serde(default, rename = "skip-cert-verify")]
    pub skip_cert_verify: bool,
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub alpn: Option<String>,
    #[serde(default)]
    pub ca: Option<std::path::PathBuf>,
    #[serde(default)]
    pub ca_str: Option<String>,
    #[serde(default)]
    pub recv_window_conn: Option<u64>,
    #[serde(default)]
    pub recv_window: Option<u64>,
    #[serde(default)]
    pub disable_mtu_discovery: bool,
    #[serde(default)]
    pub fast_open: bool,
    /// Inclusive server port range `begin-end`; enables multi-path.
    #[serde(default)]
    pub ports: Option<String>,
    /// Socket concurrency for the multi-path pool.
    #[serde(default)]
    pub hop_interval: Option<usize>,
}

impl ClientConfig {
    /// Parsed `(up, down)` rates in bytes per second.
    pub fn speed(&self) -> Result<(u64, u64)> {
        let up = parse_rate(&self.up)
            .ok_or_else(|| Error::Config(format!("invalid upload speed: {}", self.up)))?;
        let down = parse_rate(&self.down)
            .ok_or_else(|| Error::Config(format!("invalid download speed: {}", self.down)))?;
        Ok((up, down))
    }
}

/// Parses a rate string into bytes per second.
///
/// Mirrors the accepted value space of existing Hysteria frontends: a bare
/// integer is Mbps, otherwise `<int>[KMGT]?[Bb]ps` with binary unit
/// multipliers; a trailing `b` divides by eight. Zero or anything
/// unparseable yields `None`.
pub(crate) fn parse_rate(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(v) = s.parse::<u64>() {
        // No unit given, interpret as Mbps.
        let n = v.checked_mul(1 << 20)? >> 3;
        return if n == 0 { None } else { Some(n) };
    }

    let rest = s.strip_suffix("ps")?;
    let (value_part, bits) = match *rest.as_bytes().last()? {
        b'b' => (&rest[..rest.len() - 1], true),
        b'B' => (&rest[..rest.len() - 1], false),
        _ => return None,
    };
    let value_part = value_part.trim_end();
    let (digits, multiplier) = match *value_part.as_bytes().last()? {
        b'K' => (&value_part[..value_part.len() - 1], 1u64 << 10),
        b'M' => (&value_part[..value_part.len() - 1], 1 << 20),
        b'G' => (&value_part[..value_part.len() - 1], 1 << 30),
        b'T' => (&value_part[..value_part.len() - 1], 1 << 40),
        b'0'..=b'9' => (value_part, 1),
        _ => return None,
    };
    let v = digits.trim().parse::<u64>().ok()?;
    let mut n = v.checked_mul(multiplier)?;
    if bits {
        n >>= 3;
    }
    if n == 0 {
        None
    } else {
        Some(n)
    }
}

/// Parses an inclusive `begin-end` UDP port range.
pub(crate) fn parse_port_range(s: &str) -> Option<(u16, u16)> {
    let (begin, end) = s.split_once('-')?;
    let begin = begin.trim().parse::<u16>().ok()?;
    let end = end.trim().parse::<u16>().ok()?;
    if begin == 0 || end < begin {
        return None;
    }
    Some((begin, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_integer_is_mbps() {
        assert_eq!(parse_rate("100"), Some(100 * (1 << 20) / 8));
        assert_eq!(parse_rate("1"), Some((1 << 20) / 8));
    }

    #[test]
    fn parses_unit_suffixes() {
        assert_eq!(parse_rate("100 Mbps"), Some(100 * (1 << 20) / 8));
        assert_eq!(parse_rate("100Mbps"), Some(100 * (1 << 20) / 8));
        assert_eq!(parse_rate("16 MBps"), Some(16 << 20));
        assert_eq!(parse_rate("8 Kbps"), Some(1 << 10));
        assert_eq!(parse_rate("1 GBps"), Some(1 << 30));
        assert_eq!(parse_rate("1 Tbps"), Some((1u64 << 40) / 8));
        assert_eq!(parse_rate("512 Bps"), Some(512));
    }

    #[test]
    fn rejects_zero_and_garbage() {
        assert_eq!(parse_rate(""), None);
        assert_eq!(parse_rate("0"), None);
        assert_eq!(parse_rate("0 Mbps"), None);
        assert_eq!(parse_rate("fast"), None);
        assert_eq!(parse_rate("100 Xbps"), None);
        assert_eq!(parse_rate("Mbps"), None);
    }

    #[test]
    fn parses_port_ranges() {
        assert_eq!(parse_port_range("20000-20010"), Some((20000, 20010)));
        assert_eq!(parse_port_range("443-443"), Some((443, 443)));
        assert_eq!(parse_port_range("443"), None);
        assert_eq!(parse_port_range("0-10"), None);
        assert_eq!(parse_port_range("100-50"), None);
        assert_eq!(parse_port_range("a-b"), None);
    }

    #[test]
    fn decodes_yaml_options() {
        let yaml = r#"
server: example.com:443
protocol: wechat-video
up: "50 Mbps"
down: "200 Mbps"
auth_str: letmein
obfs: salamander
skip-cert-verify: true
fast_open: true
ports: 20000-21000
hop_interval: 4
"#;
        let config: ClientConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server, "example.com:443");
        assert_eq!(config.protocol, TransportProtocol::WechatVideo);
        assert!(config.skip_cert_verify);
        assert!(config.fast_open);
        assert_eq!(config.ports.as_deref(), Some("20000-21000"));
        assert_eq!(config.hop_interval, Some(4));
        let (up, down) = config.speed().unwrap();
        assert_eq!(up, 50 * (1 << 20) / 8);
        assert_eq!(down, 200 * (1 << 20) / 8);
    }

    #[test]
    fn defaults_are_plain_udp() {
        let config: ClientConfig =
            serde_yaml::from_str("{server: \"h:1\", up: \"10\", down: \"50\"}").unwrap();
        assert_eq!(config.protocol, TransportProtocol::Udp);
        assert!(!config.skip_cert_verify);
        assert!(config.obfs.is_none());
        assert!(config.ports.is_none());
    }
}
