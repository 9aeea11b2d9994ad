//! Recovering the destination a redirected connection was originally headed
//! for.

use std::{io, net::SocketAddr};

use tokio::net::TcpStream;

use crate::TransocksError;

pub const REDIRECT: &str = "redirect";
pub const TPROXY: &str = "tproxy";

/// Names accepted by [`TransparentMethod::from_name`].
pub const METHOD_NAMES: &[&str] = &[REDIRECT, TPROXY];

/// How the packet filter handed us the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransparentMethod {
    /// netfilter `REDIRECT`: the kernel keeps the original destination
    /// behind `SO_ORIGINAL_DST`.
    Redirect,
    /// netfilter `TPROXY`: the accepted socket's local address is the
    /// original destination.
    Tproxy,
}

impl TransparentMethod {
    pub fn from_name(name: &str) -> crate::Result<Self> {
        match name {
            REDIRECT => Ok(TransparentMethod::Redirect),
            TPROXY => Ok(TransparentMethod::Tproxy),
            _ => Err(TransocksError::UnknownTransparentMethod(name.to_owned())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransparentMethod::Redirect => REDIRECT,
            TransparentMethod::Tproxy => TPROXY,
        }
    }

    pub fn original_destination(&self, stream: &TcpStream) -> io::Result<SocketAddr> {
        match self {
            TransparentMethod::Redirect => original_dst(stream),
            TransparentMethod::Tproxy => stream.local_addr(),
        }
    }
}

#[cfg(target_os = "linux")]
mod netfilter {
    use std::{
        io, mem,
        net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
        os::fd::AsRawFd,
    };

    use tokio::net::TcpStream;

    /// `SO_ORIGINAL_DST` from `linux/netfilter_ipv4.h`.
    const SO_ORIGINAL_DST: libc::c_int = 80;
    /// `IP6T_SO_ORIGINAL_DST` from `linux/netfilter_ipv6/ip6_tables.h`.
    const IP6T_SO_ORIGINAL_DST: libc::c_int = 80;

    pub fn original_dst(stream: &TcpStream) -> io::Result<SocketAddr> {
        match stream.local_addr()? {
            SocketAddr::V4(_) => original_dst_v4(stream),
            SocketAddr::V6(_) => original_dst_v6(stream),
        }
    }

    fn original_dst_v4(stream: &TcpStream) -> io::Result<SocketAddr> {
        // SAFETY: sockaddr_in is plain data, all zeroes is a valid value.
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        // SAFETY: `addr` and `len` describe a buffer the kernel may fill.
        let ret = unsafe {
            libc::getsockopt(
                stream.as_raw_fd(),
                libc::SOL_IP,
                SO_ORIGINAL_DST,
                std::ptr::addr_of_mut!(addr).cast::<libc::c_void>(),
                &mut len,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
        Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(addr.sin_port))))
    }

    fn original_dst_v6(stream: &TcpStream) -> io::Result<SocketAddr> {
        // SAFETY: sockaddr_in6 is plain data, all zeroes is a valid value.
        let mut addr: libc::sockaddr_in6 = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        // SAFETY: `addr` and `len` describe a buffer the kernel may fill.
        let ret = unsafe {
            libc::getsockopt(
                stream.as_raw_fd(),
                libc::SOL_IPV6,
                IP6T_SO_ORIGINAL_DST,
                std::ptr::addr_of_mut!(addr).cast::<libc::c_void>(),
                &mut len,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
        Ok(SocketAddr::V6(SocketAddrV6::new(
            ip,
            u16::from_be(addr.sin6_port),
            addr.sin6_flowinfo,
            addr.sin6_scope_id,
        )))
    }
}

#[cfg(target_os = "linux")]
use netfilter::original_dst;

#[cfg(not(target_os = "linux"))]
fn original_dst(_stream: &TcpStream) -> io::Result<SocketAddr> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "redirect needs netfilter's SO_ORIGINAL_DST",
    ))
}
