//! Accept loop: turns incoming TCP connections into [`DualConnection`]s
//! bound to the server's shared UDP socket.

use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tether_pool::ShutdownToken;

use crate::connection::{ConnectionParams, DualConnection, IdGenerator};

/// How often the accept loop polls for cancellation.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address the stream listener binds to. Default: `0.0.0.0:3802`.
    pub tcp_addr: SocketAddr,
    /// Address the shared datagram socket binds to. Default: `0.0.0.0:3802`.
    pub udp_addr: SocketAddr,
    /// Maximum concurrent connections. Default: 256.
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            tcp_addr: SocketAddr::from(([0, 0, 0, 0], 3802)),
            udp_addr: SocketAddr::from(([0, 0, 0, 0], 3802)),
            max_connections: 256,
        }
    }
}

/// Accepts peer connections and tracks how many are alive.
pub struct RelayListener {
    tcp: TcpListener,
    udp: Arc<UdpSocket>,
    max_connections: usize,
    id_gen: IdGenerator,
    params: ConnectionParams,
    connections: Mutex<Vec<Weak<DualConnection>>>,
}

impl RelayListener {
    /// Bind both sockets from a config.
    pub fn bind(config: ListenerConfig, params: ConnectionParams) -> std::io::Result<Self> {
        let udp = Arc::new(UdpSocket::bind(config.udp_addr)?);
        Self::with_udp(config.tcp_addr, udp, config.max_connections, params)
    }

    /// Bind the stream listener around an already-bound shared UDP socket
    /// (the sender role usually wants its address first).
    pub fn with_udp(
        tcp_addr: SocketAddr,
        udp: Arc<UdpSocket>,
        max_connections: usize,
        params: ConnectionParams,
    ) -> std::io::Result<Self> {
        let tcp = TcpListener::bind(tcp_addr)?;
        tcp.set_nonblocking(true)?;
        tracing::info!(
            "Relay listening on tcp {} / udp {}",
            tcp.local_addr()?,
            udp.local_addr()?
        );
        Ok(Self {
            tcp,
            udp,
            max_connections,
            id_gen: IdGenerator::new(),
            params,
            connections: Mutex::new(Vec::new()),
        })
    }

    /// The stream listener's bound address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    /// The shared datagram socket.
    pub fn udp_socket(&self) -> &Arc<UdpSocket> {
        &self.udp
    }

    /// Number of connections still alive.
    pub fn active_connections(&self) -> usize {
        let mut conns = self.lock_connections();
        conns.retain(|w| w.upgrade().is_some_and(|c| c.is_alive()));
        conns.len()
    }

    /// Run the accept loop until the token stops it. Each accepted stream
    /// becomes a [`DualConnection`] handed to `on_accept` (which typically
    /// starts the receive loops and the handshake).
    pub fn run(
        &self,
        token: &ShutdownToken,
        on_accept: impl Fn(Arc<DualConnection>),
    ) -> std::io::Result<()> {
        loop {
            if token.is_stopped() {
                tracing::info!("Listener shutting down");
                return Ok(());
            }
            match self.tcp.accept() {
                Ok((stream, peer_addr)) => {
                    if let Err(e) = self.accept_one(stream, peer_addr, &on_accept) {
                        tracing::warn!("Failed to set up connection from {peer_addr}: {e}");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn accept_one(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        on_accept: &impl Fn(Arc<DualConnection>),
    ) -> std::io::Result<()> {
        {
            let mut conns = self.lock_connections();
            conns.retain(|w| w.upgrade().is_some_and(|c| c.is_alive()));
            if conns.len() >= self.max_connections {
                tracing::warn!("Connection limit reached, rejecting {peer_addr}");
                return Ok(());
            }
        }

        stream.set_nodelay(true)?;
        let id = self.id_gen.next_id();
        let con = DualConnection::open(
            id,
            stream,
            Arc::clone(&self.udp),
            false,
            self.params.clone(),
        )?;
        self.lock_connections().push(Arc::downgrade(&con));
        tracing::info!("Accepted connection {id:?} from {peer_addr}");
        on_accept(con);
        Ok(())
    }

    fn lock_connections(&self) -> std::sync::MutexGuard<'_, Vec<Weak<DualConnection>>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }
}
