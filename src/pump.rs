use std::{future::Future, io};

use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};

use crate::{
    client::{timer, Client, ClientState, Side, TimeoutKind},
    protocol::SocksSocketAddr,
    Socks5Connector, TransocksError,
};

pub mod buffer;
#[cfg(target_os = "linux")]
pub mod splice;

pub use buffer::BufferPump;
#[cfg(target_os = "linux")]
pub use splice::SplicePump;

/// A relay strategy. Given a client whose SOCKS5 handshake has finished, it
/// moves bytes in both directions until both have completed, an error
/// occurs, or the client's timer fires.
///
/// Implementations own whatever per-connection state they need; the
/// [`Client`] only provides sockets, half-close bookkeeping and the timer.
pub trait Pump {
    fn name(&self) -> &'static str;

    fn relay(&self, client: &mut Client) -> impl Future<Output = crate::Result<()>>;
}

/// Names accepted by [`PumpMethod::from_name`] on this platform.
#[cfg(target_os = "linux")]
pub const METHOD_NAMES: &[&str] = &[buffer::NAME, splice::NAME];
#[cfg(not(target_os = "linux"))]
pub const METHOD_NAMES: &[&str] = &[buffer::NAME];

/// The relay strategies selectable by name at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpMethod {
    Buffer(BufferPump),
    #[cfg(target_os = "linux")]
    Splice(SplicePump),
}

impl PumpMethod {
    pub fn from_name(name: &str) -> crate::Result<Self> {
        match name {
            buffer::NAME => Ok(PumpMethod::Buffer(BufferPump)),
            #[cfg(target_os = "linux")]
            splice::NAME => Ok(PumpMethod::Splice(SplicePump)),
            _ => Err(TransocksError::UnknownPumpMethod(name.to_owned())),
        }
    }
}

impl Default for PumpMethod {
    fn default() -> Self {
        PumpMethod::Buffer(BufferPump)
    }
}

impl Pump for PumpMethod {
    fn name(&self) -> &'static str {
        match self {
            PumpMethod::Buffer(pump) => pump.name(),
            #[cfg(target_os = "linux")]
            PumpMethod::Splice(pump) => pump.name(),
        }
    }

    async fn relay(&self, client: &mut Client) -> crate::Result<()> {
        match self {
            PumpMethod::Buffer(pump) => pump.relay(client).await,
            #[cfg(target_os = "linux")]
            PumpMethod::Splice(pump) => pump.relay(client).await,
        }
    }
}

/// Connection task body: drives `client` to completion and tears it down.
pub async fn serve(mut client: Client) {
    let env = client.env().clone();
    match run(&mut client, env.pump()).await {
        Ok(()) => debug!(id = ?client.id(), "Connection closed"),
        Err(TransocksError::Timeout(kind)) => {
            info!(id = ?client.id(), dst = ?client.dest_addr(), "{} timeout, closing", kind)
        }
        Err(err) => warn!(
            id = ?client.id(),
            dst = ?client.dest_addr(),
            state = %client.state(),
            error = %err,
            "Connection failed"
        ),
    }
    client.teardown();
}

/// Connects to the relay, performs the SOCKS5 handshake for the client's
/// original destination, then hands the client to `pump`.
#[instrument(skip_all, fields(id = ?client.id(), src = ?client.client_addr()))]
pub async fn run<P: Pump>(client: &mut Client, pump: &P) -> crate::Result<()> {
    let config = client.env().config();
    let relay_addr = config.relay_addr;
    let handshake_timeout = config.handshake_timeout;
    let destination: SocksSocketAddr = client
        .dest_addr()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "client has no destination"))?
        .into();

    client.set_timeout(handshake_timeout, TimeoutKind::Handshake)?;

    let relay = timer::race(&mut client.timer, TcpStream::connect(relay_addr))
        .await
        .map_err(TransocksError::Timeout)??;
    relay.set_nodelay(true)?;
    client.attach_relay(relay);
    client.set_state(ClientState::RelayConnected);
    debug!(%relay_addr, "Connected to relay");

    {
        let Client {
            relay_io, timer, ..
        } = &mut *client;
        let relay_io = relay_io
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "relay socket is closed"))?;
        timer::race(timer, Socks5Connector::new(relay_io).connect(&destination))
            .await
            .map_err(TransocksError::Timeout)??;
    }
    client.set_state(ClientState::HandshakeFinished);
    client.cancel_timeout();

    client.set_state(ClientState::Pumping);
    debug!(%destination, pump = pump.name(), "Pumping");
    pump.relay(client).await
}

/// Per-direction transfer state owned by a pump strategy.
///
/// A channel takes bytes from one socket and holds them until they are
/// written to the other. It is only read from while it has room, which is
/// what throttles a fast sender when its peer is slow.
pub(crate) trait Channel {
    fn has_room(&self) -> bool;

    fn has_pending(&self) -> bool;

    /// Moves bytes from `from` into the channel. `Ok(0)` is end of stream.
    fn fill(&mut self, from: &TcpStream) -> io::Result<usize>;

    /// Moves pending bytes out to `to`.
    fn drain(&mut self, to: &TcpStream) -> io::Result<usize>;
}

enum Event {
    Readable(Side, io::Result<()>),
    Writable(Side, io::Result<()>),
    Timeout(TimeoutKind),
}

/// Readiness loop shared by every strategy. `upstream` carries client to
/// relay bytes, `downstream` relay to client.
pub(crate) async fn pump_channels<C: Channel>(
    client: &mut Client,
    mut upstream: C,
    mut downstream: C,
) -> crate::Result<()> {
    let idle_timeout = client.env().config().idle_timeout;
    if let Some(idle) = idle_timeout {
        client.set_timeout(idle, TimeoutKind::Idle)?;
    }

    loop {
        let half_close = client.half_close();
        if half_close.client_write && half_close.relay_write {
            return Ok(());
        }

        let event = {
            let Client {
                client_io,
                relay_io,
                timer,
                ..
            } = &mut *client;
            let (Some(client_io), Some(relay_io)) = (client_io.as_ref(), relay_io.as_ref()) else {
                return Err(io::Error::from(io::ErrorKind::NotConnected).into());
            };

            tokio::select! {
                ready = client_io.readable(), if !half_close.client_read && upstream.has_room() => {
                    Event::Readable(Side::Client, ready)
                }
                ready = relay_io.writable(), if upstream.has_pending() => {
                    Event::Writable(Side::Relay, ready)
                }
                ready = relay_io.readable(), if !half_close.relay_read && downstream.has_room() => {
                    Event::Readable(Side::Relay, ready)
                }
                ready = client_io.writable(), if downstream.has_pending() => {
                    Event::Writable(Side::Client, ready)
                }
                kind = timer::fired(timer) => Event::Timeout(kind),
            }
        };

        let transferred = match event {
            Event::Timeout(kind) => return Err(TransocksError::Timeout(kind)),
            Event::Readable(side, ready) => {
                ready?;
                let channel = match side {
                    Side::Client => &mut upstream,
                    Side::Relay => &mut downstream,
                };
                match channel.fill(client.stream(side)?) {
                    Ok(0) => {
                        client.mark_read_shutdown(side);
                        false
                    }
                    Ok(_) => true,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => false,
                    Err(err) => return Err(err.into()),
                }
            }
            Event::Writable(side, ready) => {
                ready?;
                let channel = match side {
                    Side::Relay => &mut upstream,
                    Side::Client => &mut downstream,
                };
                match channel.drain(client.stream(side)?) {
                    Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                    Ok(_) => true,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => false,
                    Err(err) => return Err(err.into()),
                }
            }
        };

        if transferred {
            if let Some(idle) = idle_timeout {
                client.set_timeout(idle, TimeoutKind::Idle)?;
            }
        }

        // A finished read side is passed on once everything it sent is out.
        let half_close = client.half_close();
        if half_close.client_read && !upstream.has_pending() {
            client.shutdown_write(Side::Relay)?;
        }
        if half_close.relay_read && !downstream.has_pending() {
            client.shutdown_write(Side::Client)?;
        }
    }
}
