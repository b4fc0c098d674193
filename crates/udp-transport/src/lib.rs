//! The one UDP socket every battery endpoint shares.
//!
//! [`Transport`] is a cheap clonable handle. It binds lazily, sends unicast
//! and subnet-broadcast datagrams, and fans every valid inbound reply out to
//! the registered handlers.

mod endpoints;

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use protocol::{parse_reply, ReplyFrame, DEFAULT_DEVICE_PORT};

pub use endpoints::EndpointTable;

#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "config", serde(default))]
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Local port replies arrive on. Devices answer to the port they were queried from.
    pub bind_port: u16,
    /// Port the devices listen on.
    pub device_port: u16,
    /// Overrides the broadcast address derived from the first IPv4 interface.
    pub broadcast_address: Option<Ipv4Addr>,
    /// Overrides the host addresses used for self-echo suppression.
    pub local_addresses: Option<Vec<IpAddr>>,
    pub recv_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_port: DEFAULT_DEVICE_PORT,
            device_port: DEFAULT_DEVICE_PORT,
            broadcast_address: None,
            local_addresses: None,
            recv_buffer_size: 4_096,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind udp port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("udp send to {addr} failed: {source}")]
    Send {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("transport is not connected")]
    NotConnected,
}

/// How long a live socket trusts its view of the host interfaces.
pub const INTERFACE_REFRESH: Duration = Duration::from_secs(60);

pub type HandlerId = u64;

type Handler = Arc<dyn Fn(&ReplyFrame, SocketAddr) + Send + Sync>;

#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

struct Inner {
    config: TransportConfig,
    connection: Mutex<Option<Connection>>,
    handlers: Arc<HandlerRegistry>,
}

struct Connection {
    socket: Arc<UdpSocket>,
    broadcast: Ipv4Addr,
    local_ips: Arc<RwLock<Vec<IpAddr>>>,
    refreshed_at: Instant,
    healthy: Arc<AtomicBool>,
    receiver: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connection: Mutex::new(None),
                handlers: Arc::new(HandlerRegistry::default()),
            }),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Binds the socket and starts the receive loop. A healthy binding is reused.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) -> Result<(), TransportError> {
        self.handles().map(|_| ())
    }

    pub fn is_connected(&self) -> bool {
        self.lock_connection()
            .as_ref()
            .map(|connection| connection.healthy.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn local_port(&self) -> Option<u16> {
        self.lock_connection()
            .as_ref()
            .and_then(|connection| connection.socket.local_addr().ok())
            .map(|addr| addr.port())
    }

    pub fn broadcast_address(&self) -> Option<Ipv4Addr> {
        self.lock_connection()
            .as_ref()
            .map(|connection| connection.broadcast)
    }

    pub async fn send(&self, message: &[u8], ip: IpAddr, port: u16) -> Result<(), TransportError> {
        self.send_to(message, SocketAddr::new(ip, port)).await
    }

    pub async fn send_to(&self, message: &[u8], addr: SocketAddr) -> Result<(), TransportError> {
        let (socket, _) = self.handles()?;
        socket
            .send_to(message, addr)
            .await
            .map_err(|source| TransportError::Send { addr, source })?;
        trace!(%addr, bytes = message.len(), "udp unicast sent");
        Ok(())
    }

    /// Sends to the subnet broadcast address, on `port` or the configured device port.
    pub async fn broadcast(&self, message: &[u8], port: Option<u16>) -> Result<(), TransportError> {
        let (socket, broadcast) = self.handles()?;
        let addr = SocketAddr::new(
            IpAddr::V4(broadcast),
            port.unwrap_or(self.inner.config.device_port),
        );
        socket
            .send_to(message, addr)
            .await
            .map_err(|source| TransportError::Send { addr, source })?;
        trace!(%addr, bytes = message.len(), "udp broadcast sent");
        Ok(())
    }

    pub fn on<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&ReplyFrame, SocketAddr) + Send + Sync + 'static,
    {
        self.inner.handlers.insert(Arc::new(handler))
    }

    pub fn off(&self, id: HandlerId) -> bool {
        self.inner.handlers.remove(id)
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.len()
    }

    pub fn disconnect(&self) {
        if self.lock_connection().take().is_some() {
            info!("udp transport disconnected");
        }
    }

    /// Re-reads the host interfaces for the live socket: the self-echo list and
    /// the derived broadcast address. Configured overrides are kept. Returns
    /// false when nothing is bound.
    pub fn refresh_interfaces(&self) -> bool {
        let mut guard = self.lock_connection();
        let Some(connection) = guard.as_mut() else {
            return false;
        };
        self.refresh(connection);
        true
    }

    /// Host addresses whose datagrams are currently discarded as self-echo.
    pub fn local_addresses(&self) -> Vec<IpAddr> {
        self.lock_connection()
            .as_ref()
            .map(|connection| {
                connection
                    .local_ips
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
            })
            .unwrap_or_default()
    }

    /// Disconnects and forgets every handler.
    pub fn destroy(&self) {
        self.disconnect();
        self.inner.handlers.clear();
    }

    fn handles(&self) -> Result<(Arc<UdpSocket>, Ipv4Addr), TransportError> {
        let mut guard = self.lock_connection();
        if let Some(connection) = guard.as_mut() {
            if connection.healthy.load(Ordering::Acquire) {
                if connection.refreshed_at.elapsed() >= INTERFACE_REFRESH {
                    self.refresh(connection);
                }
                return Ok((connection.socket.clone(), connection.broadcast));
            }
            debug!("replacing unhealthy udp socket");
            // Release the port before rebinding it.
            *guard = None;
        }

        let connection = self.open()?;
        let handles = (connection.socket.clone(), connection.broadcast);
        *guard = Some(connection);
        Ok(handles)
    }

    fn open(&self) -> Result<Connection, TransportError> {
        let config = &self.inner.config;
        let port = config.bind_port;
        let std_socket = bind_socket(port).map_err(|source| TransportError::Bind { port, source })?;
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|source| TransportError::Bind { port, source })?;
        let socket = Arc::new(socket);

        let (local_ips, broadcast) = resolve_addresses(config);
        let local_ips = Arc::new(RwLock::new(local_ips));

        let healthy = Arc::new(AtomicBool::new(true));
        let receiver = tokio::spawn(receive_loop(
            socket.clone(),
            self.inner.handlers.clone(),
            local_ips.clone(),
            healthy.clone(),
            config.recv_buffer_size.max(512),
        ));

        info!(
            port = socket.local_addr().map(|addr| addr.port()).unwrap_or(port),
            %broadcast,
            "udp transport bound"
        );

        Ok(Connection {
            socket,
            broadcast,
            local_ips,
            refreshed_at: Instant::now(),
            healthy,
            receiver,
        })
    }

    fn refresh(&self, connection: &mut Connection) {
        let (local_ips, broadcast) = resolve_addresses(&self.inner.config);
        if broadcast != connection.broadcast {
            info!(old = %connection.broadcast, new = %broadcast, "broadcast address changed");
            connection.broadcast = broadcast;
        }
        let mut current = connection
            .local_ips
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if *current != local_ips {
            debug!(addresses = ?local_ips, "host addresses changed");
            *current = local_ips;
        }
        connection.refreshed_at = Instant::now();
    }

    fn lock_connection(&self) -> std::sync::MutexGuard<'_, Option<Connection>> {
        self.inner
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Subnet-directed broadcast address for an interface.
pub fn broadcast_for(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(netmask))
}

/// True when a datagram came from one of this host's own addresses.
pub fn is_self_echo(remote: IpAddr, local_ips: &[IpAddr]) -> bool {
    local_ips.contains(&remote)
}

fn bind_socket(port: u16) -> Result<std::net::UdpSocket, io::Error> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_broadcast(true)?;
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Self-echo addresses and broadcast target, honouring configured overrides.
fn resolve_addresses(config: &TransportConfig) -> (Vec<IpAddr>, Ipv4Addr) {
    let interfaces = host_ipv4_interfaces();
    let local_ips = match &config.local_addresses {
        Some(addresses) => addresses.clone(),
        None => interfaces.iter().map(|(ip, _)| IpAddr::V4(*ip)).collect(),
    };
    let broadcast = config.broadcast_address.unwrap_or_else(|| {
        interfaces
            .first()
            .map(|(ip, netmask)| broadcast_for(*ip, *netmask))
            .unwrap_or(Ipv4Addr::BROADCAST)
    });
    (local_ips, broadcast)
}

fn host_ipv4_interfaces() -> Vec<(Ipv4Addr, Ipv4Addr)> {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces
            .into_iter()
            .filter(|iface| !iface.is_loopback())
            .filter_map(|iface| match iface.addr {
                if_addrs::IfAddr::V4(v4) => Some((v4.ip, v4.netmask)),
                _ => None,
            })
            .collect(),
        Err(err) => {
            warn!(error = %err, "interface enumeration failed");
            Vec::new()
        }
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    handlers: Arc<HandlerRegistry>,
    local_ips: Arc<RwLock<Vec<IpAddr>>>,
    healthy: Arc<AtomicBool>,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, remote)) => {
                let echo = is_self_echo(
                    remote.ip(),
                    &local_ips.read().unwrap_or_else(PoisonError::into_inner),
                );
                if echo {
                    trace!(%remote, "ignoring own datagram");
                    continue;
                }
                match parse_reply(&buf[..len]) {
                    Ok(frame) => handlers.dispatch(&frame, remote),
                    Err(err) => debug!(%remote, error = %err, "dropping malformed datagram"),
                }
            }
            Err(err) if is_transient(&err) => {
                debug!(error = %err, "transient udp receive error");
            }
            Err(err) => {
                warn!(error = %err, "udp receive failed, transport marked disconnected");
                healthy.store(false, Ordering::Release);
                break;
            }
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

#[derive(Default)]
struct HandlerRegistry {
    handlers: RwLock<HashMap<HandlerId, Handler>>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    fn insert(&self, handler: Handler) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.write().insert(id, handler);
        id
    }

    fn remove(&self, id: HandlerId) -> bool {
        self.write().remove(&id).is_some()
    }

    fn clear(&self) {
        self.write().clear();
    }

    fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Runs a snapshot of the handlers so they can register or deregister freely.
    fn dispatch(&self, frame: &ReplyFrame, remote: SocketAddr) {
        let snapshot: Vec<(HandlerId, Handler)> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, handler)| (*id, handler.clone()))
            .collect();

        for (id, handler) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(frame, remote))).is_err() {
                warn!(handler = id, src = %frame.src, "inbound handler panicked");
            }
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<HandlerId, Handler>> {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner)
    }
}
