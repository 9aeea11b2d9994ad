use std::{io, net::SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, info, instrument, warn};

use crate::{client::Client, config::Config, env::EnvHandle, transparent::TransparentMethod};

const BACKLOG: i32 = 1024;
const DATAGRAM_SIZE: usize = 64 * 1024;

/// The sockets redirected traffic arrives on.
pub struct Listener {
    tcp: TcpListener,
    udp: UdpSocket,
    transparent: TransparentMethod,
}

impl Listener {
    /// Binds both sockets. Must be called from inside the runtime.
    pub fn bind(config: &Config, transparent: TransparentMethod) -> io::Result<Self> {
        let tcp = bind_socket(config.tcp_bind_addr, Type::STREAM, Protocol::TCP, transparent)?;
        tcp.listen(BACKLOG)?;
        let udp = bind_socket(config.udp_bind_addr, Type::DGRAM, Protocol::UDP, transparent)?;

        Ok(Self {
            tcp: TcpListener::from_std(tcp.into())?,
            udp: UdpSocket::from_std(udp.into())?,
            transparent,
        })
    }

    pub fn tcp_addr(&self) -> io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn udp_addr(&self) -> io::Result<SocketAddr> {
        self.udp.local_addr()
    }

    /// Accepts connections and launches a client for each until the future
    /// is dropped. Failures only affect the connection they happened on.
    pub async fn run(self, env: EnvHandle) -> crate::Result<()> {
        let listen_addr = self.tcp_addr()?;
        let mut datagram = vec![0; DATAGRAM_SIZE];

        loop {
            tokio::select! {
                accepted = self.tcp.accept() => match accepted {
                    Ok((stream, peer)) => self.accept(&env, stream, peer, listen_addr),
                    Err(err) => warn!(error = %err, "Failed to accept connection"),
                },
                received = self.udp.recv_from(&mut datagram) => match received {
                    Ok((len, peer)) => debug!(%peer, len, "Discarding UDP datagram"),
                    Err(err) => warn!(error = %err, "Failed to receive UDP datagram"),
                },
            }
        }
    }

    #[instrument(skip(self, env, stream, listen_addr))]
    fn accept(&self, env: &EnvHandle, stream: TcpStream, peer: SocketAddr, listen_addr: SocketAddr) {
        let dest = match self.transparent.original_destination(&stream) {
            Ok(dest) => dest,
            Err(err) => {
                warn!(error = %err, "Failed to recover original destination");
                return;
            }
        };
        match stream.local_addr() {
            Ok(local) if is_self_connection(self.transparent, dest, local, listen_addr) => {
                warn!(%dest, "Connection was not redirected, refusing");
                return;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "Accepted socket has no local address");
                return;
            }
        }
        if let Err(err) = stream.set_nodelay(true) {
            debug!(error = %err, "Failed to set TCP_NODELAY");
        }

        let mut client = Client::new(env);
        client.attach_client(stream, peer, dest);
        if let Some(id) = env.launch(client) {
            info!(%id, %dest, "Accepted connection");
        }
    }
}

/// Whether `dest` is the listener itself, in which case relaying would loop
/// back to us.
///
/// Under `redirect` an unredirected connection reports its own local address.
/// Under `tproxy` the local address always equals `dest`, so `dest` is
/// matched against the bound address instead. A wildcard bind only matches
/// loopback destinations.
fn is_self_connection(
    method: TransparentMethod,
    dest: SocketAddr,
    local: SocketAddr,
    listen_addr: SocketAddr,
) -> bool {
    if dest.port() != listen_addr.port() {
        return false;
    }
    match method {
        TransparentMethod::Redirect => dest == local,
        TransparentMethod::Tproxy if listen_addr.ip().is_unspecified() => dest.ip().is_loopback(),
        TransparentMethod::Tproxy => dest.ip() == listen_addr.ip(),
    }
}

fn bind_socket(
    addr: SocketAddr,
    ty: Type,
    protocol: Protocol,
    transparent: TransparentMethod,
) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), ty, Some(protocol))?;
    socket.set_reuse_address(true)?;
    if transparent == TransparentMethod::Tproxy {
        set_ip_transparent(&socket, addr)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}

#[cfg(target_os = "linux")]
fn set_ip_transparent(socket: &Socket, addr: SocketAddr) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let (level, name) = match addr {
        SocketAddr::V4(_) => (libc::SOL_IP, libc::IP_TRANSPARENT),
        SocketAddr::V6(_) => (libc::SOL_IPV6, libc::IPV6_TRANSPARENT),
    };
    let one: libc::c_int = 1;
    // SAFETY: `one` outlives the call and its size is passed alongside.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            std::ptr::addr_of!(one).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_ip_transparent(_socket: &Socket, _addr: SocketAddr) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "IP_TRANSPARENT is Linux only",
    ))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{io::AsyncReadExt, net::UdpSocket};

    use super::*;
    use crate::{pump::PumpMethod, Environment};

    fn loopback_config() -> Config {
        Config::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:1".parse().unwrap(),
        )
    }

    #[test]
    fn unredirected_connection_is_detected() {
        let listen: SocketAddr = "0.0.0.0:12345".parse().unwrap();
        let local: SocketAddr = "10.0.0.1:12345".parse().unwrap();
        let redirect = TransparentMethod::Redirect;
        assert!(is_self_connection(redirect, local, local, listen));
        assert!(!is_self_connection(redirect, "1.2.3.4:80".parse().unwrap(), local, listen));
    }

    #[test]
    fn tproxy_foreign_destination_on_listener_port_is_relayed() {
        let tproxy = TransparentMethod::Tproxy;
        let foreign: SocketAddr = "203.0.113.5:8080".parse().unwrap();
        let wildcard: SocketAddr = "0.0.0.0:8080".parse().unwrap();
        let bound: SocketAddr = "192.168.1.1:8080".parse().unwrap();

        assert!(!is_self_connection(tproxy, foreign, foreign, wildcard));
        assert!(!is_self_connection(tproxy, foreign, foreign, bound));

        let other_port: SocketAddr = "203.0.113.5:80".parse().unwrap();
        assert!(!is_self_connection(tproxy, other_port, other_port, wildcard));
    }

    #[test]
    fn tproxy_connection_to_the_listener_is_detected() {
        let tproxy = TransparentMethod::Tproxy;
        let bound: SocketAddr = "192.168.1.1:8080".parse().unwrap();
        assert!(is_self_connection(tproxy, bound, bound, bound));

        let wildcard: SocketAddr = "0.0.0.0:8080".parse().unwrap();
        let loopback: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        assert!(is_self_connection(tproxy, loopback, loopback, wildcard));
    }

    #[test]
    fn direct_connection_is_refused() {
        let env = Environment::create(loopback_config()).unwrap();
        env.block_on(async {
            let handle = EnvHandle::new(
                loopback_config(),
                PumpMethod::default(),
                TransparentMethod::Tproxy,
            );
            // Bind without IP_TRANSPARENT, which needs privileges.
            let listener = Listener::bind(handle.config(), TransparentMethod::Redirect).unwrap();
            let listener = Listener {
                transparent: TransparentMethod::Tproxy,
                ..listener
            };
            let addr = listener.tcp_addr().unwrap();
            let serve = tokio::task::spawn_local(listener.run(handle.clone()));

            let mut stream = TcpStream::connect(addr).await.unwrap();
            let mut buf = [0; 8];
            let n = tokio::time::timeout(Duration::from_secs(1), stream.read(&mut buf))
                .await
                .unwrap()
                .unwrap_or(0);
            assert_eq!(n, 0);
            assert!(handle.is_empty());
            serve.abort();
        });
    }

    #[test]
    fn udp_datagrams_are_discarded() {
        let env = Environment::create(loopback_config()).unwrap();
        env.block_on(async {
            let handle = env.handle().clone();
            let listener = Listener::bind(handle.config(), TransparentMethod::Redirect).unwrap();
            let udp_addr = listener.udp_addr().unwrap();
            let serve = tokio::task::spawn_local(listener.run(handle.clone()));

            let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            sender.send_to(b"dropped", udp_addr).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;

            assert!(!serve.is_finished());
            assert!(handle.is_empty());
            serve.abort();
        });
    }
}
