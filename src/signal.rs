use std::io;

use tokio::signal::unix::{signal, Signal, SignalKind};

/// What the process was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// `SIGINT` or `SIGTERM`.
    Shutdown,
    /// `SIGUSR1`: print every live connection.
    Dump,
}

pub struct Signals {
    interrupt: Signal,
    terminate: Signal,
    dump: Signal,
}

impl Signals {
    /// Installs the handlers. Must be called from inside the runtime.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            dump: signal(SignalKind::user_defined1())?,
        })
    }

    pub async fn recv(&mut self) -> SignalEvent {
        tokio::select! {
            _ = self.interrupt.recv() => SignalEvent::Shutdown,
            _ = self.terminate.recv() => SignalEvent::Shutdown,
            _ = self.dump.recv() => SignalEvent::Dump,
        }
    }
}
