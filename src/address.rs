use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

fn invalid(s: &str) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("failed to parse address: {}", s),
    )
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Hostname(String),
}

impl Address {
    pub fn from(s: &str) -> std::io::Result<Self> {
        match s.parse::<IpAddr>() {
            Ok(IpAddr::V4(addr)) => return Ok(Address::Ipv4(addr)),
            Ok(IpAddr::V6(addr)) => return Ok(Address::Ipv6(addr)),
            Err(_) => {}
        }
        if s.is_empty() || !is_plausible_hostname(s) {
            return Err(invalid(s));
        }
        Ok(Address::Hostname(s.to_string()))
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, Address::Ipv6(_))
    }

    pub fn hostname(&self) -> Option<&str> {
        match self {
            Address::Hostname(ref hostname) => Some(hostname),
            _ => None,
        }
    }

    pub fn to_ip_addr(&self) -> Option<IpAddr> {
        match self {
            Address::Ipv4(addr) => Some(IpAddr::V4(*addr)),
            Address::Ipv6(addr) => Some(IpAddr::V6(*addr)),
            Address::Hostname(_) => None,
        }
    }
}

/// Loose DNS-name shape check; anything an IP parser rejected must look
/// like a label sequence to be worth resolving later.
fn is_plausible_hostname(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.')
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Ipv4(addr) => write!(f, "{}", addr),
            Address::Ipv6(addr) => write!(f, "{}", addr),
            Address::Hostname(hostname) => write!(f, "{}", hostname),
        }
    }
}

/// A host/port pair where the host may still be an unresolved name.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct NetLocation {
    address: Address,
    port: u16,
}

impl NetLocation {
    pub fn new(address: Address, port: u16) -> Self {
        Self { address, port }
    }

    pub fn from_str(s: &str, default_port: Option<u16>) -> std::io::Result<Self> {
        // Bracketed ipv6 literal, with or without a port: [::1]:443, [::1]
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| invalid(s))?;
            let address = Address::from(host)?;
            if !address.is_ipv6() {
                return Err(invalid(s));
            }
            let port = match tail.strip_prefix(':') {
                Some(port) => port.parse::<u16>().map_err(|_| invalid(s))?,
                None if tail.is_empty() => default_port.ok_or_else(|| invalid(s))?,
                None => return Err(invalid(s)),
            };
            return Ok(Self { address, port });
        }

        match s.rsplit_once(':') {
            // More than one ':' means an unbracketed ipv6 literal rather
            // than host:port.
            Some((host, port)) if !host.contains(':') => Ok(Self {
                address: Address::from(host)?,
                port: port.parse::<u16>().map_err(|_| invalid(s))?,
            }),
            _ => Ok(Self {
                address: Address::from(s)?,
                port: default_port.ok_or_else(|| invalid(s))?,
            }),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn components(&self) -> (&Address, u16) {
        (&self.address, self.port)
    }

    /// Best-effort conversion without resolution. Hostnames map to the
    /// unspecified address, which is what the UDP read path reports when
    /// the server hands back an unresolvable origin.
    pub fn to_socket_addr_lossy(&self) -> SocketAddr {
        match self.address.to_ip_addr() {
            Some(ip) => SocketAddr::new(ip, self.port),
            None => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port),
        }
    }
}

impl std::fmt::Display for NetLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.address {
            Address::Ipv6(addr) => write!(f, "[{}]:{}", addr, self.port),
            _ => write!(f, "{}:{}", self.address, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_location() {
        let loc = NetLocation::from_str("10.0.0.1:8443", None).unwrap();
        assert_eq!(loc.address(), &Address::Ipv4("10.0.0.1".parse().unwrap()));
        assert_eq!(loc.port(), 8443);
    }

    #[test]
    fn parses_hostname_location() {
        let loc = NetLocation::from_str("example.com:80", None).unwrap();
        assert_eq!(loc.address().hostname(), Some("example.com"));
        assert_eq!(loc.port(), 80);
        assert_eq!(loc.to_string(), "example.com:80");
    }

    #[test]
    fn parses_bracketed_ipv6_location() {
        let loc = NetLocation::from_str("[::1]:443", None).unwrap();
        assert!(loc.address().is_ipv6());
        assert_eq!(loc.to_string(), "[::1]:443");
    }

    #[test]
    fn bare_ipv6_takes_the_default_port() {
        let loc = NetLocation::from_str("2001:db8::1", Some(443)).unwrap();
        assert!(loc.address().is_ipv6());
        assert_eq!(loc.port(), 443);
    }

    #[test]
    fn uses_default_port_when_missing() {
        let loc = NetLocation::from_str("example.com", Some(443)).unwrap();
        assert_eq!(loc.port(), 443);
        assert!(NetLocation::from_str("example.com", None).is_err());
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(NetLocation::from_str(":80", None).is_err());
        assert!(NetLocation::from_str("[::1:443", None).is_err());
        assert!(NetLocation::from_str("[example.com]:443", None).is_err());
        assert!(NetLocation::from_str("bad host!:80", None).is_err());
        assert!(Address::from("").is_err());
    }
}
