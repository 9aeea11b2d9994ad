use std::{
    cell::Cell,
    fmt, io,
    net::{Shutdown, SocketAddr},
    os::fd::{AsRawFd, RawFd},
    rc::Rc,
    time::Duration,
};

use socket2::SockRef;
use tokio::{net::TcpStream, time::Instant};
use tracing::{debug, trace};

use crate::{env::EnvHandle, TransocksError};

pub mod timer;

use timer::Timer;

/// Stable handle of a registered client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub(crate) u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of an intercepted connection. States only move forward, and any
/// state may jump to [`ClientState::Invalid`], which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClientState {
    New,
    RelayConnected,
    HandshakeFinished,
    Pumping,
    Invalid,
}

impl ClientState {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientState::New => "client_new",
            ClientState::RelayConnected => "client_relay_connected",
            ClientState::HandshakeFinished => "client_socks5_finish_handshake",
            ClientState::Pumping => "client_pumping_data",
            ClientState::Invalid => "client_INVALID",
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the two sockets of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Relay,
}

impl Side {
    pub fn peer(self) -> Side {
        match self {
            Side::Client => Side::Relay,
            Side::Relay => Side::Client,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => f.write_str("client"),
            Side::Relay => f.write_str("relay"),
        }
    }
}

/// Which halves of the two sockets have been closed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HalfClose {
    pub client_read: bool,
    pub client_write: bool,
    pub relay_read: bool,
    pub relay_write: bool,
}

impl HalfClose {
    pub fn read(&self, side: Side) -> bool {
        match side {
            Side::Client => self.client_read,
            Side::Relay => self.relay_read,
        }
    }

    pub fn write(&self, side: Side) -> bool {
        match side {
            Side::Client => self.client_write,
            Side::Relay => self.relay_write,
        }
    }

    fn set_read(&mut self, side: Side) {
        match side {
            Side::Client => self.client_read = true,
            Side::Relay => self.relay_read = true,
        }
    }

    fn set_write(&mut self, side: Side) {
        match side {
            Side::Client => self.client_write = true,
            Side::Relay => self.relay_write = true,
        }
    }
}

/// What an armed client timer is guarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Handshake,
    Idle,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Handshake => f.write_str("Handshake"),
            TimeoutKind::Idle => f.write_str("Idle"),
        }
    }
}

/// The part of a client the registry can observe while the connection task
/// owns the client itself.
#[derive(Debug)]
pub(crate) struct ClientStatus {
    state: Cell<ClientState>,
    half_close: Cell<HalfClose>,
    client_fd: Cell<Option<RawFd>>,
    relay_fd: Cell<Option<RawFd>>,
    client_addr: Cell<Option<SocketAddr>>,
    dest_addr: Cell<Option<SocketAddr>>,
}

impl ClientStatus {
    fn new() -> Self {
        Self {
            state: Cell::new(ClientState::New),
            half_close: Cell::new(HalfClose::default()),
            client_fd: Cell::new(None),
            relay_fd: Cell::new(None),
            client_addr: Cell::new(None),
            dest_addr: Cell::new(None),
        }
    }

    pub(crate) fn state(&self) -> ClientState {
        self.state.get()
    }

    pub(crate) fn info(&self) -> ClientInfo {
        ClientInfo {
            client_addr: self.client_addr.get(),
            dest_addr: self.dest_addr.get(),
            client_fd: self.client_fd.get(),
            relay_fd: self.relay_fd.get(),
            half_close: self.half_close.get(),
            state: self.state.get(),
        }
    }
}

/// Point-in-time snapshot of a connection, for diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub client_addr: Option<SocketAddr>,
    pub dest_addr: Option<SocketAddr>,
    pub client_fd: Option<RawFd>,
    pub relay_fd: Option<RawFd>,
    pub half_close: HalfClose,
    pub state: ClientState,
}

impl fmt::Display for ClientInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn addr(addr: Option<SocketAddr>) -> String {
            addr.map_or_else(|| "-".to_owned(), |addr| addr.to_string())
        }
        fn fd(fd: Option<RawFd>) -> RawFd {
            fd.unwrap_or(-1)
        }
        let hc = &self.half_close;

        write!(f, "\t{} -> {}", addr(self.client_addr), addr(self.dest_addr))?;
        write!(
            f,
            "\n\tfd: client {} relay {}",
            fd(self.client_fd),
            fd(self.relay_fd)
        )?;
        write!(
            f,
            "\n\tclient shut R {} W {}",
            hc.client_read as u8, hc.client_write as u8
        )?;
        write!(
            f,
            "\n\trelay shut R {} W {}",
            hc.relay_read as u8, hc.relay_write as u8
        )?;
        write!(f, "\n\tclient state: {}", self.state)
    }
}

/// Everything owned on behalf of one intercepted connection.
///
/// A client is created by the listener, registered in the [`EnvHandle`]
/// registry and then driven by the pump. Dropping it runs
/// [`Client::teardown`].
pub struct Client {
    pub(crate) env: EnvHandle,
    pub(crate) id: Option<ClientId>,
    pub(crate) status: Rc<ClientStatus>,
    pub(crate) client_io: Option<TcpStream>,
    pub(crate) relay_io: Option<TcpStream>,
    pub(crate) timer: Option<Timer<TimeoutKind>>,
}

impl Client {
    pub fn new(env: &EnvHandle) -> Self {
        Self {
            env: env.clone(),
            id: None,
            status: Rc::new(ClientStatus::new()),
            client_io: None,
            relay_io: None,
            timer: None,
        }
    }

    /// Wires in the accepted socket together with its peer address and the
    /// destination recovered by the transparent method.
    pub fn attach_client(&mut self, stream: TcpStream, client_addr: SocketAddr, dest_addr: SocketAddr) {
        self.status.client_fd.set(Some(stream.as_raw_fd()));
        self.status.client_addr.set(Some(client_addr));
        self.status.dest_addr.set(Some(dest_addr));
        self.client_io = Some(stream);
    }

    pub fn attach_relay(&mut self, stream: TcpStream) {
        self.status.relay_fd.set(Some(stream.as_raw_fd()));
        self.relay_io = Some(stream);
    }

    pub fn id(&self) -> Option<ClientId> {
        self.id
    }

    pub fn env(&self) -> &EnvHandle {
        &self.env
    }

    pub fn state(&self) -> ClientState {
        self.status.state()
    }

    /// Moves the client to `state`. An invalid client stays invalid.
    pub fn set_state(&self, state: ClientState) {
        let current = self.state();
        if current == ClientState::Invalid {
            return;
        }
        debug_assert!(state >= current, "state moved back from {current} to {state}");
        trace!(from = %current, to = %state, "Client state change");
        self.status.state.set(state);
    }

    pub fn half_close(&self) -> HalfClose {
        self.status.half_close.get()
    }

    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.status.client_addr.get()
    }

    pub fn dest_addr(&self) -> Option<SocketAddr> {
        self.status.dest_addr.get()
    }

    pub fn info(&self) -> ClientInfo {
        self.status.info()
    }

    /// Arms the client's timer. The first call creates it; later calls cancel
    /// whatever is pending and re-arm the same timer.
    pub fn set_timeout(&mut self, duration: Duration, kind: TimeoutKind) -> crate::Result<()> {
        let deadline = Instant::now().checked_add(duration).ok_or_else(|| {
            TransocksError::IoError(io::Error::new(
                io::ErrorKind::InvalidInput,
                "timeout out of range",
            ))
        })?;

        match &mut self.timer {
            Some(timer) => timer.rearm(deadline, kind),
            None => self.timer = Some(Timer::new(deadline, kind)),
        }
        Ok(())
    }

    pub fn cancel_timeout(&mut self) {
        if let Some(timer) = &mut self.timer {
            timer.cancel();
        }
    }

    /// Completes when the armed timer fires.
    pub async fn timed_out(&mut self) -> TimeoutKind {
        timer::fired(&mut self.timer).await
    }

    pub(crate) fn stream(&self, side: Side) -> io::Result<&TcpStream> {
        let stream = match side {
            Side::Client => self.client_io.as_ref(),
            Side::Relay => self.relay_io.as_ref(),
        };
        stream.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, format!("{side} socket is closed"))
        })
    }

    /// Records end-of-input on `side`. No further reads happen on it.
    pub(crate) fn mark_read_shutdown(&self, side: Side) {
        let mut half_close = self.half_close();
        half_close.set_read(side);
        self.status.half_close.set(half_close);
        trace!(%side, "Read side reached end of stream");
    }

    /// Shuts down the write half of `side`, once.
    pub(crate) fn shutdown_write(&self, side: Side) -> io::Result<()> {
        let mut half_close = self.half_close();
        if half_close.write(side) {
            return Ok(());
        }
        SockRef::from(self.stream(side)?).shutdown(Shutdown::Write)?;
        half_close.set_write(side);
        self.status.half_close.set(half_close);
        debug!(%side, "Propagated half-close");
        Ok(())
    }

    /// Releases everything the client owns and leaves the registry.
    ///
    /// Sockets that made it past `new` get a full shutdown unless their write
    /// half was already closed by the pump. Calling this again is a no-op.
    pub fn teardown(&mut self) {
        let state = self.state();
        if state == ClientState::Invalid {
            return;
        }
        let info = self.info();
        debug!(
            id = ?self.id,
            src = ?info.client_addr,
            dst = ?info.dest_addr,
            %state,
            "Freeing connection"
        );

        if let Some(mut timer) = self.timer.take() {
            timer.cancel();
        }

        let client_io = self.client_io.take();
        let relay_io = self.relay_io.take();

        if state != ClientState::New {
            let half_close = self.half_close();
            for (side, stream) in [(Side::Client, &client_io), (Side::Relay, &relay_io)] {
                let Some(stream) = stream else {
                    continue;
                };
                if half_close.write(side) {
                    continue;
                }
                if let Err(err) = SockRef::from(stream).shutdown(Shutdown::Both) {
                    trace!(%side, error = %err, "Shutdown on teardown failed");
                }
            }
        }

        self.status.state.set(ClientState::Invalid);

        drop(client_io);
        drop(relay_io);
        self.status.client_fd.set(None);
        self.status.relay_fd.set(None);

        let env = self.env.clone();
        env.unregister(self);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::AsyncReadExt,
        net::{TcpListener, TcpStream},
    };

    use super::*;
    use crate::{config::Config, Environment};

    fn environment() -> Environment {
        let config = Config::new(
            "127.0.0.1:12345".parse().unwrap(),
            "127.0.0.1:12345".parse().unwrap(),
            "127.0.0.1:1080".parse().unwrap(),
        );
        Environment::create(config).unwrap()
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let outside = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (inside, _) = listener.accept().await.unwrap();
        (outside, inside)
    }

    #[test]
    fn fresh_client_is_empty() {
        let env = environment();
        let client = Client::new(env.handle());

        assert_eq!(client.state(), ClientState::New);
        assert_eq!(client.id(), None);
        assert_eq!(client.half_close(), HalfClose::default());
        let info = client.info();
        assert_eq!(info.client_fd, None);
        assert_eq!(info.relay_fd, None);
        assert!(client.timer.is_none());
    }

    #[test]
    fn state_names() {
        assert_eq!(ClientState::New.to_string(), "client_new");
        assert_eq!(ClientState::Pumping.to_string(), "client_pumping_data");
        assert_eq!(ClientState::Invalid.to_string(), "client_INVALID");
        assert!(ClientState::New < ClientState::RelayConnected);
        assert!(ClientState::Pumping < ClientState::Invalid);
    }

    #[test]
    fn invalid_is_terminal() {
        let env = environment();
        let mut client = Client::new(env.handle());
        client.set_state(ClientState::RelayConnected);
        client.teardown();
        assert_eq!(client.state(), ClientState::Invalid);

        client.set_state(ClientState::Pumping);
        assert_eq!(client.state(), ClientState::Invalid);
    }

    #[test]
    fn second_timeout_replaces_first() {
        let env = environment();
        env.block_on(async {
            let mut client = Client::new(env.handle());
            client
                .set_timeout(Duration::from_millis(20), TimeoutKind::Handshake)
                .unwrap();
            client
                .set_timeout(Duration::from_millis(60), TimeoutKind::Idle)
                .unwrap();

            let start = Instant::now();
            assert_eq!(client.timed_out().await, TimeoutKind::Idle);
            assert!(start.elapsed() >= Duration::from_millis(60));
        });
    }

    #[test]
    fn cancelled_timeout_does_not_fire() {
        let env = environment();
        env.block_on(async {
            let mut client = Client::new(env.handle());
            client
                .set_timeout(Duration::from_millis(10), TimeoutKind::Idle)
                .unwrap();
            client.cancel_timeout();

            let fired =
                tokio::time::timeout(Duration::from_millis(100), client.timed_out()).await;
            assert!(fired.is_err());
        });
    }

    #[test]
    fn teardown_closes_sockets_once() {
        let env = environment();
        env.block_on(async {
            let (mut outside, inside) = socket_pair().await;
            let (mut relay_outside, relay_inside) = socket_pair().await;
            let peer = outside.local_addr().unwrap();

            let mut client = Client::new(env.handle());
            client.attach_client(inside, peer, "93.184.216.34:80".parse().unwrap());
            client.attach_relay(relay_inside);
            client.set_state(ClientState::Pumping);
            env.handle().register(&mut client).unwrap();
            assert_eq!(env.handle().len(), 1);

            client.teardown();
            assert_eq!(client.state(), ClientState::Invalid);
            assert!(client.client_io.is_none());
            assert!(client.relay_io.is_none());
            assert_eq!(client.info().client_fd, None);
            assert!(env.handle().is_empty());

            client.teardown();
            assert_eq!(client.state(), ClientState::Invalid);

            let mut buf = [0; 8];
            assert_eq!(outside.read(&mut buf).await.unwrap(), 0);
            assert_eq!(relay_outside.read(&mut buf).await.unwrap(), 0);
        });
    }

    #[test]
    fn half_close_is_issued_once() {
        let env = environment();
        env.block_on(async {
            let (mut outside, inside) = socket_pair().await;
            let peer = outside.local_addr().unwrap();

            let mut client = Client::new(env.handle());
            client.attach_client(inside, peer, peer);
            client.set_state(ClientState::Pumping);

            client.shutdown_write(Side::Client).unwrap();
            client.shutdown_write(Side::Client).unwrap();
            assert!(client.half_close().client_write);
            assert!(!client.half_close().client_read);

            let mut buf = [0; 8];
            assert_eq!(outside.read(&mut buf).await.unwrap(), 0);
        });
    }

    #[test]
    fn dump_format() {
        let info = ClientInfo {
            client_addr: Some("10.0.0.2:40000".parse().unwrap()),
            dest_addr: Some("93.184.216.34:80".parse().unwrap()),
            client_fd: Some(7),
            relay_fd: None,
            half_close: HalfClose {
                client_read: true,
                ..HalfClose::default()
            },
            state: ClientState::Pumping,
        };
        let text = info.to_string();
        assert!(text.contains("10.0.0.2:40000 -> 93.184.216.34:80"));
        assert!(text.contains("fd: client 7 relay -1"));
        assert!(text.contains("client shut R 1 W 0"));
        assert!(text.contains("client state: client_pumping_data"));
    }
}
