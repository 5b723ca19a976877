//! Listening socket, connection registry and idle sweep

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::connection::{ConnectionHandle, LineConnection};
use crate::error::{Error, Result};
use crate::processor::CommandProcessor;
use crate::store::{MessageStore, ReceivedMessage};
use crate::utils::resident_memory_kb;

const DEFAULT_PORT: u16 = 25;
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);
const MIN_TICK: Duration = Duration::from_millis(1);

struct Task {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Task {
    async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

struct ListenerTask {
    local_addr: SocketAddr,
    task: Task,
}

struct Inner {
    config: ServerConfig,
    processor: Arc<CommandProcessor>,
    endpoint: Mutex<SocketAddr>,
    connections: Mutex<HashMap<u64, ConnectionHandle>>,
    next_id: AtomicU64,
    accepted: AtomicU64,
    should_run: AtomicBool,
    listener: Mutex<Option<ListenerTask>>,
    sweep: Mutex<Option<Task>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// SMTP listener that owns every accepted connection.
///
/// Connections are tracked by id until they close, and a background sweep
/// closes the ones that stay idle for longer than
/// [`ServerConfig::idle_timeout`].
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    pub fn new(config: ServerConfig, store: Arc<dyn MessageStore>) -> Self {
        let processor = Arc::new(CommandProcessor::new(config.hostname.clone(), store));
        Self {
            inner: Arc::new(Inner {
                config,
                processor,
                endpoint: Mutex::new(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::LOCALHOST),
                    DEFAULT_PORT,
                )),
                connections: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                accepted: AtomicU64::new(0),
                should_run: AtomicBool::new(false),
                listener: Mutex::new(None),
                sweep: Mutex::new(None),
            }),
        }
    }

    /// Sets the address to listen on. A running server moves to the new
    /// address straight away.
    pub async fn bind(&self, address: &str, port: u16) -> Result<()> {
        let ip: IpAddr = address
            .parse()
            .map_err(|_| Error::InvalidAddress(address.to_string()))?;
        *lock(&self.inner.endpoint) = SocketAddr::new(ip, port);

        let previous = lock(&self.inner.listener).take();
        if let Some(previous) = previous {
            previous.task.stop().await;
        }
        if self.inner.should_run.load(Ordering::Acquire) {
            self.inner.listen()?;
        }
        Ok(())
    }

    /// Starts accepting connections and the idle sweep.
    pub async fn start(&self) -> Result<()> {
        self.inner.should_run.store(true, Ordering::Release);

        {
            let mut sweep = lock(&self.inner.sweep);
            if sweep.is_none() {
                let (shutdown, receiver) = watch::channel(false);
                let handle = tokio::spawn(self.inner.clone().sweep_loop(receiver));
                *sweep = Some(Task { shutdown, handle });
            }
        }

        self.inner.listen()
    }

    /// Stops listening, waits for the sweep to finish and closes every
    /// connection.
    pub async fn stop(&self) {
        // Cleared under the listener lock so a concurrent restart cannot slip in
        let listener = {
            let mut slot = lock(&self.inner.listener);
            self.inner.should_run.store(false, Ordering::Release);
            slot.take()
        };
        if let Some(listener) = listener {
            listener.task.stop().await;
        }

        let sweep = lock(&self.inner.sweep).take();
        if let Some(sweep) = sweep {
            sweep.stop().await;
        }

        let connections: Vec<ConnectionHandle> = lock(&self.inner.connections)
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in &connections {
            handle.suppress_notification();
            handle.close();
        }

        info!(closed = connections.len(), "Server stopped");
    }

    /// Address actually bound, once listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.listener).as_ref().map(|l| l.local_addr)
    }

    pub fn is_listening(&self) -> bool {
        self.inner.is_listening()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.inner.connections).len()
    }

    pub fn processor(&self) -> &Arc<CommandProcessor> {
        &self.inner.processor
    }

    /// Notifications for every message received from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ReceivedMessage> {
        self.inner.processor.subscribe()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.inner.should_run.store(false, Ordering::Release);
        if let Some(listener) = lock(&self.inner.listener).take() {
            let _ = listener.task.shutdown.send(true);
        }
        if let Some(sweep) = lock(&self.inner.sweep).take() {
            let _ = sweep.shutdown.send(true);
        }
    }
}

impl Inner {
    fn is_listening(&self) -> bool {
        lock(&self.listener)
            .as_ref()
            .map_or(false, |l| !l.task.handle.is_finished())
    }

    fn listen(self: &Arc<Self>) -> Result<()> {
        let mut slot = lock(&self.listener);
        if !self.should_run.load(Ordering::Acquire)
            || slot
                .as_ref()
                .map_or(false, |l| !l.task.handle.is_finished())
        {
            return Ok(());
        }

        let addr = *lock(&self.endpoint);
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket
            .bind(addr)
            .map_err(|source| Error::Bind { addr, source })?;
        let listener = socket
            .listen(self.config.backlog)
            .map_err(|source| Error::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let (shutdown, receiver) = watch::channel(false);
        let handle = tokio::spawn(self.clone().accept_loop(listener, receiver));
        *slot = Some(ListenerTask {
            local_addr,
            task: Task { shutdown, handle },
        });

        info!(address = %local_addr, "Listening");
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.register(stream, peer),
                    Err(e) => {
                        if !self.should_run.load(Ordering::Acquire) {
                            break;
                        }
                        error!(error = %e, "Accept failed");
                        time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
            }
        }
        debug!("Accept loop stopped");
    }

    fn register(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.accepted.fetch_add(1, Ordering::Relaxed);

        let (mut connection, handle) =
            LineConnection::new(id, stream, Some(peer), self.config.drop_nul_flood);
        let registry: Weak<Inner> = Arc::downgrade(self);
        connection.set_on_closed(Box::new(move |id| {
            if let Some(registry) = registry.upgrade() {
                lock(&registry.connections).remove(&id);
            }
        }));

        lock(&self.connections).insert(id, handle);
        info!(connection = id, peer = %peer, "Connection accepted");

        tokio::spawn(connection.run(self.processor.clone()));
    }

    async fn sweep_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(self.config.tick.max(MIN_TICK));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_sweep = Instant::now();
        let mut last_status = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            if self.should_run.load(Ordering::Acquire) && !self.is_listening() {
                match self.listen() {
                    Ok(()) => info!("Listener restarted"),
                    Err(e) => warn!(error = %e, "Listener restart failed"),
                }
            }

            if last_sweep.elapsed() >= self.config.sweep_interval {
                last_sweep = Instant::now();
                self.reap_idle();
            }

            if last_status.elapsed() >= self.config.status_interval {
                last_status = Instant::now();
                info!(
                    connections = lock(&self.connections).len(),
                    accepted = self.accepted.load(Ordering::Relaxed),
                    messages = self.processor.received_count(),
                    memory_kb = resident_memory_kb(),
                    "Status"
                );
            }
        }
        debug!("Sweep loop stopped");
    }

    /// Closes idle connections and forgets closed ones.
    fn reap_idle(&self) {
        let snapshot: Vec<ConnectionHandle> = lock(&self.connections).values().cloned().collect();

        for handle in snapshot {
            if handle.is_connected() {
                let idle = handle.idle_for();
                if idle <= self.config.idle_timeout {
                    continue;
                }
                info!(
                    connection = handle.id(),
                    idle_secs = idle.as_secs(),
                    "Closing idle connection"
                );
                handle.close();
            }
            lock(&self.connections).remove(&handle.id());
        }
    }
}
