use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Network address type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressType {
    TCP,
    RDMA,
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressType::TCP => write!(f, "TCP"),
            AddressType::RDMA => write!(f, "RDMA"),
        }
    }
}

/// Network endpoint: a host (IP literal or name), a port and the transport
/// it is reached over.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Host name or IP literal, without IPv6 brackets.
    pub host: String,
    /// Port number.
    pub port: u16,
    /// Transport type.
    pub addr_type: AddressType,
}

impl Address {
    /// Create a new address.
    pub fn new(host: impl Into<String>, port: u16, addr_type: AddressType) -> Self {
        Self {
            host: host.into(),
            port,
            addr_type,
        }
    }

    /// Create an address from a resolved socket address.
    pub fn from_socket_addr(sa: SocketAddr, addr_type: AddressType) -> Self {
        Self::new(sa.ip().to_string(), sa.port(), addr_type)
    }

    /// The unspecified IPv4 endpoint (`0.0.0.0:0`), used when the local side
    /// of a connection cannot be determined.
    pub fn unspecified(addr_type: AddressType) -> Self {
        Self::new("0.0.0.0", 0, addr_type)
    }

    /// Parse a dial destination of the form `"host:port"`.
    ///
    /// IPv6 literals must be bracketed (`"[::1]:6379"`). The port must be a
    /// decimal integer in `0..=65535`.
    pub fn parse_host_port(s: &str, addr_type: AddressType) -> Result<Self, AddressParseError> {
        let (host, port_str) = if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or(AddressParseError::InvalidHost)?;
            let port_str = after.strip_prefix(':').ok_or(AddressParseError::MissingPort)?;
            (host, port_str)
        } else {
            let (host, port_str) = s.rsplit_once(':').ok_or(AddressParseError::MissingPort)?;
            if host.contains(':') {
                // Unbracketed IPv6 literal.
                return Err(AddressParseError::InvalidHost);
            }
            (host, port_str)
        };

        if host.is_empty() {
            return Err(AddressParseError::MissingHost);
        }
        if host.contains(['\0', '[', ']']) {
            return Err(AddressParseError::InvalidHost);
        }
        if port_str.is_empty() {
            return Err(AddressParseError::MissingPort);
        }
        if !port_str.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AddressParseError::InvalidPort);
        }
        let port: u16 = port_str
            .parse()
            .map_err(|_| AddressParseError::InvalidPort)?;

        Ok(Self::new(host, port, addr_type))
    }

    /// Format as a `"host:port"` destination, bracketing IPv6 literals.
    pub fn host_port(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Return the socket address if the host is an IP literal.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        let ip: IpAddr = self.host.parse().ok()?;
        Some(SocketAddr::new(ip, self.port))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.addr_type, self.host_port())
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    /// Parse an address string like `"RDMA://10.0.0.1:6379"`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (type_str, rest) = s.split_once("://").ok_or(AddressParseError::MissingScheme)?;

        let addr_type = match type_str {
            "TCP" => AddressType::TCP,
            "RDMA" => AddressType::RDMA,
            _ => return Err(AddressParseError::UnknownType(type_str.to_string())),
        };

        Self::parse_host_port(rest, addr_type)
    }
}

/// Errors when parsing an `Address` from a string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    #[error("missing '://' scheme separator")]
    MissingScheme,
    #[error("unknown address type: {0}")]
    UnknownType(String),
    #[error("missing host")]
    MissingHost,
    #[error("invalid host")]
    InvalidHost,
    #[error("missing port")]
    MissingPort,
    #[error("invalid port number")]
    InvalidPort,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display() {
        let addr = Address::new("192.168.1.100", 8080, AddressType::TCP);
        assert_eq!(format!("{}", addr), "TCP://192.168.1.100:8080");

        let v6 = Address::new("::1", 6379, AddressType::RDMA);
        assert_eq!(format!("{}", v6), "RDMA://[::1]:6379");
    }

    #[test]
    fn test_parse_host_port() {
        let addr = Address::parse_host_port("10.0.0.1:6378", AddressType::RDMA).unwrap();
        assert_eq!(addr.host, "10.0.0.1");
        assert_eq!(addr.port, 6378);
        assert_eq!(addr.addr_type, AddressType::RDMA);

        let named = Address::parse_host_port("cache-0.internal:0", AddressType::TCP).unwrap();
        assert_eq!(named.host, "cache-0.internal");
        assert_eq!(named.port, 0);

        let v6 = Address::parse_host_port("[fe80::1]:65535", AddressType::RDMA).unwrap();
        assert_eq!(v6.host, "fe80::1");
        assert_eq!(v6.port, 65535);
        assert_eq!(v6.host_port(), "[fe80::1]:65535");
    }

    #[test]
    fn test_parse_host_port_errors() {
        let parse = |s| Address::parse_host_port(s, AddressType::RDMA).unwrap_err();
        assert_eq!(parse("10.0.0.1"), AddressParseError::MissingPort);
        assert_eq!(parse("10.0.0.1:"), AddressParseError::MissingPort);
        assert_eq!(parse("10.0.0.1:http"), AddressParseError::InvalidPort);
        assert_eq!(parse("10.0.0.1:-1"), AddressParseError::InvalidPort);
        assert_eq!(parse("10.0.0.1:+80"), AddressParseError::InvalidPort);
        assert_eq!(parse("10.0.0.1:65536"), AddressParseError::InvalidPort);
        assert_eq!(parse(":6379"), AddressParseError::MissingHost);
        assert_eq!(parse("::1:6379"), AddressParseError::InvalidHost);
        assert_eq!(parse("[::1"), AddressParseError::InvalidHost);
        assert_eq!(parse("[::1]"), AddressParseError::MissingPort);
        assert_eq!(parse("bad\0host:1"), AddressParseError::InvalidHost);
    }

    #[test]
    fn test_address_parse_with_scheme() {
        let addr: Address = "RDMA://10.0.0.1:9999".parse().unwrap();
        assert_eq!(addr.addr_type, AddressType::RDMA);
        assert_eq!(addr.host, "10.0.0.1");
        assert_eq!(addr.port, 9999);

        assert!("no-scheme".parse::<Address>().is_err());
        assert!("UNKNOWN://1.2.3.4:80".parse::<Address>().is_err());
        assert!("TCP://1.2.3.4".parse::<Address>().is_err());
    }

    #[test]
    fn test_socket_addr_conversion() {
        let sa: SocketAddr = "[::ffff:10.0.0.1]:8080".parse().unwrap();
        let addr = Address::from_socket_addr(sa, AddressType::TCP);
        assert_eq!(addr.to_socket_addr(), Some(sa));

        let named = Address::new("localhost", 80, AddressType::TCP);
        assert_eq!(named.to_socket_addr(), None);
    }

    #[test]
    fn test_address_serde() {
        let addr = Address::new("127.0.0.1", 3000, AddressType::RDMA);
        let json = serde_json::to_string(&addr).unwrap();
        let parsed: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(addr, parsed);
    }
}
