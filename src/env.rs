use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt::Write as _,
    future::Future,
    io,
    rc::Rc,
};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    runtime::{Builder, Runtime},
    task::{JoinHandle, LocalSet},
};
use tracing::{debug, info, warn};

use crate::{
    client::{Client, ClientId, ClientInfo, ClientState, ClientStatus},
    config::Config,
    listener::Listener,
    pump::{self, Pump, PumpMethod},
    signal::{SignalEvent, Signals},
    transparent::TransparentMethod,
};

/// Process-wide state: the event loop plus everything the connection tasks
/// share through an [`EnvHandle`].
///
/// Dropping the environment drops every remaining connection task (each of
/// which tears its client down) before the runtime goes away.
pub struct Environment {
    local: LocalSet,
    runtime: Runtime,
    handle: EnvHandle,
}

impl Environment {
    /// Resolves the configured methods and builds the event loop.
    pub fn create(config: Config) -> crate::Result<Self> {
        let pump = PumpMethod::from_name(&config.pump_method)?;
        let transparent = TransparentMethod::from_name(&config.transparent_method)?;
        let runtime = Builder::new_current_thread().enable_all().build()?;

        Ok(Self {
            local: LocalSet::new(),
            runtime,
            handle: EnvHandle::new(config, pump, transparent),
        })
    }

    pub fn handle(&self) -> &EnvHandle {
        &self.handle
    }

    /// Drives `future` on the event loop. Connection tasks spawned from
    /// inside make progress while it runs.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.local.block_on(&self.runtime, future)
    }

    /// Serves redirected connections until a shutdown signal arrives, then
    /// tears every live connection down.
    pub fn run(&self) -> crate::Result<()> {
        let env = self.handle.clone();
        self.block_on(async move {
            let listener = Listener::bind(env.config(), env.transparent())?;
            let mut signals = Signals::new()?;

            let tcp = listener.tcp_addr()?;
            let udp = listener.udp_addr()?;

            info!("transocks started");
            info!(
                %tcp,
                %udp,
                relay = %env.config().relay_addr,
                "listening"
            );
            info!("using pump method: {}", env.pump().name());
            info!("using transparent method: {}", env.transparent().name());

            let serve = listener.run(env.clone());
            tokio::pin!(serve);
            loop {
                tokio::select! {
                    result = &mut serve => {
                        result?;
                        break;
                    }
                    event = signals.recv() => match event {
                        SignalEvent::Shutdown => {
                            info!("exited event loop, shutting down..");
                            break;
                        }
                        SignalEvent::Dump => {
                            if let Err(err) = env.write_dump(&mut tokio::io::stdout()).await {
                                warn!(error = %err, "Failed to write connection dump");
                            }
                        }
                    }
                }
            }

            let dropped = env.drop_all().await;
            info!(connections = dropped, "all connections closed");
            Ok(())
        })
    }
}

/// Shared, cheaply clonable view of the environment used by the listener,
/// the pump and every [`Client`].
#[derive(Clone)]
pub struct EnvHandle {
    inner: Rc<Inner>,
}

struct Inner {
    config: Config,
    pump: PumpMethod,
    transparent: TransparentMethod,
    next_id: Cell<u64>,
    registry: RefCell<HashMap<ClientId, Entry>>,
}

struct Entry {
    status: Rc<ClientStatus>,
    task: Option<JoinHandle<()>>,
}

impl EnvHandle {
    pub fn new(config: Config, pump: PumpMethod, transparent: TransparentMethod) -> Self {
        Self {
            inner: Rc::new(Inner {
                config,
                pump,
                transparent,
                next_id: Cell::new(0),
                registry: RefCell::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn pump(&self) -> &PumpMethod {
        &self.inner.pump
    }

    pub fn transparent(&self) -> TransparentMethod {
        self.inner.transparent
    }

    /// Adds `client` to the registry. Registering twice returns the existing
    /// id; a torn down client is refused.
    pub fn register(&self, client: &mut Client) -> Option<ClientId> {
        if client.state() == ClientState::Invalid {
            return None;
        }
        if let Some(id) = client.id {
            return Some(id);
        }

        let id = ClientId(self.inner.next_id.get());
        self.inner.next_id.set(id.0 + 1);

        self.inner.registry.borrow_mut().insert(
            id,
            Entry {
                status: Rc::clone(&client.status),
                task: None,
            },
        );
        client.id = Some(id);
        Some(id)
    }

    /// Removes `client` from the registry if it is still there.
    pub fn unregister(&self, client: &mut Client) {
        if let Some(id) = client.id.take() {
            self.inner.registry.borrow_mut().remove(&id);
        }
    }

    /// Registers `client` and spawns its connection task on the loop.
    ///
    /// Must be called from inside [`Environment::block_on`].
    pub fn launch(&self, mut client: Client) -> Option<ClientId> {
        let id = self.register(&mut client)?;
        let task = tokio::task::spawn_local(pump::serve(client));
        if let Some(entry) = self.inner.registry.borrow_mut().get_mut(&id) {
            entry.task = Some(task);
        }
        Some(id)
    }

    pub fn len(&self) -> usize {
        self.inner.registry.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.inner.registry.borrow().contains_key(&id)
    }

    pub fn client_info(&self, id: ClientId) -> Option<ClientInfo> {
        self.inner
            .registry
            .borrow()
            .get(&id)
            .map(|entry| entry.status.info())
    }

    /// Snapshot of every registered client, ordered by id.
    pub fn clients(&self) -> Vec<(ClientId, ClientInfo)> {
        let mut clients: Vec<_> = self
            .inner
            .registry
            .borrow()
            .iter()
            .map(|(id, entry)| (*id, entry.status.info()))
            .collect();
        clients.sort_by_key(|(id, _)| *id);
        clients
    }

    /// Human readable listing of all live connections.
    pub fn dump_all(&self) -> String {
        let mut dump = String::from("transocks connection info:\n");
        for (i, (id, info)) in self.clients().into_iter().enumerate() {
            let _ = writeln!(dump, "conn #{} ({})\n{}\n----------", i, id, info);
        }
        dump
    }

    /// Writes [`EnvHandle::dump_all`] to `out` and flushes it.
    pub async fn write_dump<W: AsyncWrite + Unpin>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(self.dump_all().as_bytes()).await?;
        out.flush().await
    }

    /// Tears down every registered client and waits until each one is gone.
    ///
    /// The registry is emptied up front, so teardowns running while this
    /// awaits never see a stale entry. Returns how many clients were dropped.
    pub async fn drop_all(&self) -> usize {
        let entries: Vec<(ClientId, Entry)> =
            self.inner.registry.borrow_mut().drain().collect();
        let count = entries.len();

        let mut tasks = Vec::with_capacity(count);
        for (id, entry) in entries {
            let info = entry.status.info();
            info!(
                %id,
                src = ?info.client_addr,
                dst = ?info.dest_addr,
                state = %info.state,
                "close connection"
            );
            match entry.task {
                Some(task) => {
                    task.abort();
                    tasks.push(task);
                }
                None => debug!(%id, "registered client has no task"),
            }
        }

        for task in tasks {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    warn!(error = %err, "connection task failed");
                }
            }
        }
        count
    }
}
