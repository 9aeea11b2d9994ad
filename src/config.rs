use std::{
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

use crate::TransocksError;

pub const DEFAULT_PUMP_METHOD: &str = "buffer";
pub const DEFAULT_TRANSPARENT_METHOD: &str = "redirect";
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Startup configuration, fixed for the lifetime of an [`crate::Environment`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Where redirected TCP connections arrive.
    pub tcp_bind_addr: SocketAddr,

    /// Where redirected UDP datagrams arrive.
    pub udp_bind_addr: SocketAddr,

    /// The upstream SOCKS5 server.
    pub relay_addr: SocketAddr,

    /// Name of the relay strategy, see [`crate::pump::PumpMethod`].
    pub pump_method: String,

    /// Name of the destination recovery method, see
    /// [`crate::transparent::TransparentMethod`].
    pub transparent_method: String,

    /// Bound on connecting to the relay plus the SOCKS5 handshake.
    pub handshake_timeout: Duration,

    /// Tear a pumping connection down after this long without traffic.
    pub idle_timeout: Option<Duration>,
}

impl Config {
    pub fn new(tcp_bind_addr: SocketAddr, udp_bind_addr: SocketAddr, relay_addr: SocketAddr) -> Self {
        Self {
            tcp_bind_addr,
            udp_bind_addr,
            relay_addr,
            pump_method: DEFAULT_PUMP_METHOD.to_owned(),
            transparent_method: DEFAULT_TRANSPARENT_METHOD.to_owned(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_timeout: None,
        }
    }
}

/// Parses `addr:port` (`[v6]:port` for IPv6 literals), resolving host names
/// once. A missing or zero port is rejected.
pub fn parse_addr_port(value: &str) -> crate::Result<SocketAddr> {
    let invalid = || TransocksError::InvalidAddrPort(value.to_owned());

    let addr = match value.parse::<SocketAddr>() {
        Ok(addr) => addr,
        Err(_) => value
            .to_socket_addrs()
            .map_err(|_| invalid())?
            .next()
            .ok_or_else(invalid)?,
    };

    if addr.port() == 0 {
        return Err(invalid());
    }
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ip_literals() {
        assert_eq!(
            parse_addr_port("127.0.0.1:1080").unwrap(),
            "127.0.0.1:1080".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(parse_addr_port("[::1]:12345").unwrap().port(), 12345);
    }

    #[test]
    fn resolves_localhost() {
        let addr = parse_addr_port("localhost:1080").unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 1080);
    }

    #[test]
    fn rejects_missing_or_zero_port() {
        assert!(matches!(
            parse_addr_port("127.0.0.1"),
            Err(TransocksError::InvalidAddrPort(_))
        ));
        assert!(matches!(
            parse_addr_port("127.0.0.1:0"),
            Err(TransocksError::InvalidAddrPort(_))
        ));
        assert!(parse_addr_port("not an address").is_err());
    }

    #[test]
    fn defaults() {
        let config = Config::new(
            "0.0.0.0:1".parse().unwrap(),
            "0.0.0.0:2".parse().unwrap(),
            "127.0.0.1:1080".parse().unwrap(),
        );
        assert_eq!(config.pump_method, DEFAULT_PUMP_METHOD);
        assert_eq!(config.transparent_method, DEFAULT_TRANSPARENT_METHOD);
        assert_eq!(config.handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT);
        assert!(config.idle_timeout.is_none());
    }
}
