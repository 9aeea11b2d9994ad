use std::{
    fmt, io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
};

use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Ipv4 = 0x01,
    DomainName = 0x03,
    Ipv6 = 0x04,
}

impl AddressType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(AddressType::Ipv4),
            0x03 => Some(AddressType::DomainName),
            0x04 => Some(AddressType::Ipv6),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksSocketAddr {
    pub port: u16,
    pub addr: Addr,
}

impl SocksSocketAddr {
    /// Turns `Self` into: ATYP+ADDR+PORT
    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(22);

        bytes.push(self.addr.addr_type().to_u8());

        match &self.addr {
            Addr::Ipv4(addr) => bytes.extend_from_slice(&addr.octets()[..]),
            Addr::Ipv6(addr) => bytes.extend_from_slice(&addr.octets()[..]),
            Addr::Domain(domain) => {
                let len = u8::try_from(domain.len()).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "Domain longer than 255 bytes")
                })?;
                bytes.push(len);
                bytes.extend_from_slice(domain.as_bytes())
            }
        }
        bytes.extend_from_slice(&self.port.to_be_bytes());

        Ok(bytes)
    }

    /// Reads ATYP+ADDR+PORT, as found at the tail of a SOCKS5 reply.
    pub async fn read<R>(reader: &mut R) -> io::Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let addr_type = reader.read_u8().await?;

        let addr = match AddressType::from_u8(addr_type) {
            Some(AddressType::Ipv4) => {
                let mut octets = [0; 4];
                reader.read_exact(&mut octets).await?;
                Addr::Ipv4(Ipv4Addr::from(octets))
            }
            Some(AddressType::Ipv6) => {
                let mut octets = [0; 16];
                reader.read_exact(&mut octets).await?;
                Addr::Ipv6(Ipv6Addr::from(octets))
            }
            Some(AddressType::DomainName) => {
                let len = reader.read_u8().await?;
                let mut buf = vec![0; len as usize];
                reader.read_exact(&mut buf).await?;
                let domain = String::from_utf8(buf).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "Domain was invalid utf8")
                })?;
                Addr::Domain(domain)
            }
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Unknown address type {:#04x}", addr_type),
                ));
            }
        };

        let port = reader.read_u16().await?;
        Ok(SocksSocketAddr { port, addr })
    }
}

impl From<SocketAddr> for SocksSocketAddr {
    fn from(value: SocketAddr) -> Self {
        match value {
            SocketAddr::V4(ipv4) => SocksSocketAddr {
                port: ipv4.port(),
                addr: Addr::Ipv4(*ipv4.ip()),
            },
            SocketAddr::V6(ipv6) => SocksSocketAddr {
                port: ipv6.port(),
                addr: Addr::Ipv6(*ipv6.ip()),
            },
        }
    }
}

impl fmt::Display for SocksSocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.addr {
            Addr::Ipv4(addr) => write!(f, "{}:{}", addr, self.port),
            Addr::Ipv6(addr) => write!(f, "[{}]:{}", addr, self.port),
            Addr::Domain(domain) => write!(f, "{}:{}", domain, self.port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl Addr {
    pub fn addr_type(&self) -> AddressType {
        match self {
            Addr::Ipv4(_) => AddressType::Ipv4,
            Addr::Ipv6(_) => AddressType::Ipv6,
            Addr::Domain(_) => AddressType::DomainName,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_destination_encoding() {
        let addr = SocksSocketAddr::from("93.184.216.34:80".parse::<SocketAddr>().unwrap());
        assert_eq!(
            addr.to_bytes().unwrap(),
            vec![0x01, 93, 184, 216, 34, 0x00, 0x50]
        );
    }

    #[test]
    fn domain_destination_encoding() {
        let addr = SocksSocketAddr {
            port: 443,
            addr: Addr::Domain("example.com".to_owned()),
        };
        let bytes = addr.to_bytes().unwrap();
        assert_eq!(bytes[0], 0x03);
        assert_eq!(bytes[1], 11);
        assert_eq!(&bytes[2..13], b"example.com");
        assert_eq!(&bytes[13..], &[0x01, 0xBB]);
    }

    #[test]
    fn oversized_domain_is_rejected() {
        let addr = SocksSocketAddr {
            port: 80,
            addr: Addr::Domain("a".repeat(256)),
        };
        let err = addr.to_bytes().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn reads_ipv6_bound_address() {
        let mut bytes = vec![0x04];
        bytes.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        bytes.extend_from_slice(&1080u16.to_be_bytes());

        let addr = SocksSocketAddr::read(&mut &bytes[..]).await.unwrap();
        assert_eq!(addr.addr, Addr::Ipv6(Ipv6Addr::LOCALHOST));
        assert_eq!(addr.port, 1080);
        assert_eq!(addr.to_string(), "[::1]:1080");
    }

    #[tokio::test]
    async fn unknown_address_type_is_invalid_data() {
        let bytes = [0x02, 0, 0];
        let err = SocksSocketAddr::read(&mut &bytes[..]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn truncated_address_is_eof() {
        let bytes = [0x01, 127, 0];
        let err = SocksSocketAddr::read(&mut &bytes[..]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
