use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Address and port identifying a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndPoint {
    host: String,
    port: u16,
}

impl EndPoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<SocketAddr> for EndPoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl FromStr for EndPoint {
    type Err = ProtocolError;

    fn from_str(raw: &str) -> Result<Self> {
        let (host, port) = raw
            .rsplit_once(':')
            .ok_or_else(|| ProtocolError::ConfigError(format!("missing port in '{raw}'")))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(ProtocolError::ConfigError(format!("missing host in '{raw}'")));
        }

        let port = port
            .parse::<u16>()
            .map_err(|e| ProtocolError::ConfigError(format!("invalid port in '{raw}': {e}")))?;

        Ok(Self::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let ep: EndPoint = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(ep.host(), "127.0.0.1");
        assert_eq!(ep.port(), 9000);
        assert_eq!(ep.to_string(), "127.0.0.1:9000");
    }

    #[test]
    fn test_ipv6_brackets() {
        let ep: EndPoint = "[::1]:443".parse().unwrap();
        assert_eq!(ep.host(), "::1");
        assert_eq!(ep.to_string(), "[::1]:443");

        let addr: SocketAddr = "[::1]:443".parse().unwrap();
        assert_eq!(EndPoint::from(addr), ep);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!("localhost".parse::<EndPoint>().is_err());
        assert!(":80".parse::<EndPoint>().is_err());
        assert!("host:99999".parse::<EndPoint>().is_err());
    }
}
