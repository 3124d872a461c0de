//! The dual-transport connection: one reliable TCP stream and one (possibly
//! shared) unreliable UDP socket presented as a single logical peer link.
//!
//! Each connection runs up to two independent receive threads and exposes a
//! synchronized send primitive that picks the channel from the record's
//! flags. Teardown is idempotent and safe from any thread, including a
//! receive loop that just detected its own connection died.

use std::fmt;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::codec::{CodecContext, CodecError, RecordCodec};
use crate::frame::{self, FrameConfig, FrameError};
use crate::queue::{ChannelKind, FlushScheduler, SendQueue};
use crate::rate::RateMetrics;
use crate::record::Record;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Unique identifier for a connection within a server run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`ConnectionId`].
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Transport-level settings for a connection.
#[derive(Debug, Clone)]
pub struct NetSettings {
    /// Staging buffer size for batched reliable writes, in bytes.
    pub tcp_buffer_size: usize,
    /// Maximum serialized size of a single record, in bytes.
    pub max_record_size: u16,
    /// Maximum UDP datagram (container) size, in bytes.
    pub udp_max_datagram_size: usize,
    /// Socket receive timeout; doubles as the receive loops' cancellation
    /// poll interval.
    pub receive_timeout: Duration,
    /// Canned response for plaintext HTTP probes on the reliable channel.
    pub decoy_response: String,
}

impl Default for NetSettings {
    fn default() -> Self {
        Self {
            tcp_buffer_size: 65536,
            max_record_size: 2048,
            udp_max_datagram_size: 1100,
            receive_timeout: Duration::from_secs(6),
            decoy_response: "HTTP/1.1 418 I'm a teapot\r\nConnection: close\r\nContent-Type: text/plain\r\n\r\nThis is not an HTTP server.\r\n".to_string(),
        }
    }
}

impl NetSettings {
    /// Framing configuration matching the record size limit.
    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            max_payload_size: self.max_record_size,
        }
    }
}

/// Per-peer uplink caps, declared per server tick. A zero value disables
/// that cap.
#[derive(Debug, Clone)]
pub struct UplinkLimits {
    /// Reliable-channel cap in bytes per tick.
    pub reliable_bytes_per_tick: u32,
    /// Reliable-channel cap in packets per tick.
    pub reliable_packets_per_tick: u32,
    /// Unreliable-channel cap in bytes per tick.
    pub unreliable_bytes_per_tick: u32,
    /// Unreliable-channel cap in packets per tick.
    pub unreliable_packets_per_tick: u32,
    /// Delay before a capped reliable queue is retried.
    pub cap_cooldown: Duration,
}

impl Default for UplinkLimits {
    fn default() -> Self {
        Self {
            reliable_bytes_per_tick: 4096,
            reliable_packets_per_tick: 64,
            unreliable_bytes_per_tick: 2048,
            unreliable_packets_per_tick: 64,
            cap_cooldown: Duration::from_millis(100),
        }
    }
}

/// The server's current tick rate, shared so caps scale with runtime
/// changes.
#[derive(Clone)]
pub struct SharedTickRate(Arc<AtomicU64>);

impl SharedTickRate {
    /// Create a tick-rate handle.
    pub fn new(ticks_per_second: u32) -> Self {
        Self(Arc::new(AtomicU64::new(ticks_per_second as u64)))
    }

    /// Current ticks per second.
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed) as u32
    }

    /// Change the tick rate.
    pub fn set(&self, ticks_per_second: u32) {
        self.0.store(ticks_per_second as u64, Ordering::Relaxed);
    }
}

impl Default for SharedTickRate {
    fn default() -> Self {
        Self::new(60)
    }
}

/// Everything a connection needs besides its sockets.
#[derive(Clone)]
pub struct ConnectionParams {
    /// Record codec (opaque boundary).
    pub codec: Arc<dyn RecordCodec>,
    /// Flush scheduler for the send queues (normally the sender role).
    pub scheduler: Arc<dyn FlushScheduler>,
    /// Transport settings.
    pub settings: NetSettings,
    /// Per-peer uplink caps.
    pub limits: UplinkLimits,
    /// Shared server tick rate.
    pub tick_rate: SharedTickRate,
}

// ---------------------------------------------------------------------------
// Dispatch boundary
// ---------------------------------------------------------------------------

/// Collaborator invoked for every decoded inbound record.
pub trait RecordHandler: Send + Sync {
    /// Process one record received on `con`.
    fn handle(&self, con: &Arc<DualConnection>, record: Record);
}

/// Blanket implementation for closures.
impl<F> RecordHandler for F
where
    F: Fn(&Arc<DualConnection>, Record) + Send + Sync,
{
    fn handle(&self, con: &Arc<DualConnection>, record: Record) {
        self(con, record)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by connection operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Codec-level failure (malformed record bytes).
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Framing-level failure.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

fn is_io_disconnect(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::UnexpectedEof
    )
}

impl ConnectionError {
    /// Whether this error means the peer is simply gone (normal lifecycle
    /// end) rather than a failure worth logging.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ConnectionError::Io(e) => is_io_disconnect(e),
            ConnectionError::Frame(FrameError::ConnectionClosed) => true,
            ConnectionError::Frame(FrameError::Io(e)) => is_io_disconnect(e),
            ConnectionError::Codec(CodecError::Io(e)) => is_io_disconnect(e),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// DualConnection
// ---------------------------------------------------------------------------

struct SendState {
    stream: TcpStream,
    scratch: Vec<u8>,
    wire: Vec<u8>,
}

type TeardownHook = Box<dyn FnOnce(&Arc<DualConnection>) + Send>;

/// One logical peer connection over two physically distinct channels.
pub struct DualConnection {
    id: ConnectionId,
    tcp_local: SocketAddr,
    tcp_remote: SocketAddr,
    udp_local: Option<SocketAddr>,
    udp_remote: SocketAddr,
    udp_connected: bool,
    tcp: TcpStream,
    udp: Arc<UdpSocket>,
    owns_udp: bool,
    alive: AtomicBool,

    codec: Arc<dyn RecordCodec>,
    ctx: CodecContext,
    settings: NetSettings,
    limits: UplinkLimits,
    tick_rate: SharedTickRate,

    send_state: Mutex<SendState>,
    reliable_queue: Arc<SendQueue>,
    unreliable_queue: Arc<SendQueue>,

    reliable_send: RateMetrics,
    unreliable_send: RateMetrics,
    reliable_recv: RateMetrics,
    unreliable_recv: RateMetrics,

    container_seq: AtomicU8,
    last_container_seen: Mutex<Option<u8>>,
    containers_lost: AtomicU64,

    recv_reliable: Mutex<Option<JoinHandle<()>>>,
    recv_unreliable: Mutex<Option<JoinHandle<()>>>,
    on_teardown: Mutex<Option<TeardownHook>>,
}

impl DualConnection {
    /// Wrap an established TCP stream and UDP socket.
    ///
    /// `owns_udp` declares whether this connection may run a receive loop on
    /// the UDP socket; a server shares one socket across all connections and
    /// passes `false`. Endpoints derive from the stream; a UDP socket with
    /// no fixed peer falls back to the stream's remote endpoint.
    pub fn open(
        id: ConnectionId,
        tcp: TcpStream,
        udp: Arc<UdpSocket>,
        owns_udp: bool,
        params: ConnectionParams,
    ) -> std::io::Result<Arc<Self>> {
        let tcp_local = tcp.local_addr()?;
        let tcp_remote = tcp.peer_addr()?;
        let udp_local = udp.local_addr().ok();
        let udp_peer = udp.peer_addr().ok();
        let write_half = tcp.try_clone()?;

        let ConnectionParams {
            codec,
            scheduler,
            settings,
            limits,
            tick_rate,
        } = params;

        let max_record = settings.max_record_size as usize;
        Ok(Arc::new_cyclic(|weak: &Weak<DualConnection>| Self {
            id,
            tcp_local,
            tcp_remote,
            udp_local,
            udp_remote: udp_peer.unwrap_or(tcp_remote),
            udp_connected: udp_peer.is_some(),
            tcp,
            udp,
            owns_udp,
            alive: AtomicBool::new(true),
            codec,
            ctx: CodecContext::new(),
            limits,
            tick_rate,
            send_state: Mutex::new(SendState {
                stream: write_half,
                scratch: Vec::with_capacity(max_record),
                wire: Vec::with_capacity(max_record + 2),
            }),
            reliable_queue: SendQueue::new(
                ChannelKind::Reliable,
                weak.clone(),
                Arc::clone(&scheduler),
            ),
            unreliable_queue: SendQueue::new(ChannelKind::Unreliable, weak.clone(), scheduler),
            reliable_send: RateMetrics::new(),
            unreliable_send: RateMetrics::new(),
            reliable_recv: RateMetrics::new(),
            unreliable_recv: RateMetrics::new(),
            container_seq: AtomicU8::new(0),
            last_container_seen: Mutex::new(None),
            containers_lost: AtomicU64::new(0),
            recv_reliable: Mutex::new(None),
            recv_unreliable: Mutex::new(None),
            on_teardown: Mutex::new(None),
            settings,
        }))
    }

    /// Client-style constructor: connect the stream and bind an owned
    /// ephemeral UDP socket.
    pub fn connect(
        addr: SocketAddr,
        id: ConnectionId,
        params: ConnectionParams,
    ) -> std::io::Result<Arc<Self>> {
        let tcp = TcpStream::connect(addr)?;
        tcp.set_nodelay(true)?;
        let bind_ip: IpAddr = if addr.is_ipv4() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        };
        let udp = UdpSocket::bind(SocketAddr::new(bind_ip, 0))?;
        Self::open(id, tcp, Arc::new(udp), true, params)
    }

    // -- accessors ----------------------------------------------------------

    /// This connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether teardown has not begun yet.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Remote endpoint of the reliable channel.
    pub fn remote_addr(&self) -> SocketAddr {
        self.tcp_remote
    }

    /// Remote endpoint datagrams are sent to and accepted from.
    pub fn udp_remote_addr(&self) -> SocketAddr {
        self.udp_remote
    }

    /// The send queue feeding the given channel.
    pub fn queue(&self, kind: ChannelKind) -> &Arc<SendQueue> {
        match kind {
            ChannelKind::Reliable => &self.reliable_queue,
            ChannelKind::Unreliable => &self.unreliable_queue,
        }
    }

    /// Transport settings this connection was built with.
    pub fn settings(&self) -> &NetSettings {
        &self.settings
    }

    /// Delay before a capped queue should be retried.
    pub fn cap_cooldown(&self) -> Duration {
        self.limits.cap_cooldown
    }

    /// Next unreliable container sequence id (wraps at 255).
    pub fn next_container_seq(&self) -> u8 {
        self.container_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Containers the receive side observed as missing (diagnostic).
    pub fn containers_lost(&self) -> u64 {
        self.containers_lost.load(Ordering::Relaxed)
    }

    // -- sending ------------------------------------------------------------

    /// Send one record immediately, choosing the channel from its flags.
    ///
    /// Update-flagged records go out as one self-contained datagram; all
    /// others as a length-prefixed frame on the stream. One critical section
    /// covers channel selection and the write. No-op once teardown began.
    pub fn send(self: &Arc<Self>, record: &Record) -> Result<(), ConnectionError> {
        if !self.is_alive() {
            return Ok(());
        }
        let mut st = self.lock_send();

        // Have some fun with naive port sniffers.
        if matches!(record, Record::HttpProbe) {
            st.stream.write_all(self.settings.decoy_response.as_bytes())?;
            st.stream.flush()?;
            return Ok(());
        }

        let SendState {
            stream,
            scratch,
            wire,
        } = &mut *st;
        scratch.clear();
        self.codec.encode(record, &self.ctx, scratch)?;

        if record.is_update() {
            wire.clear();
            wire.push(self.next_container_seq());
            wire.extend_from_slice(scratch);
            self.send_datagram(wire)?;
            self.unreliable_send.observe(wire.len() as f32, 1.0);
        } else {
            wire.clear();
            let framed = frame::append_frame(wire, scratch, &self.settings.frame_config())?;
            stream.write_all(wire)?;
            stream.flush()?;
            self.reliable_send.observe(framed as f32, 1.0);
        }
        Ok(())
    }

    /// Drain a plaintext HTTP probe's request headers from the stream (up
    /// to the blank line), so the decoy response goes out on a clean
    /// boundary.
    pub fn drain_probe_request(&self) -> Result<(), ConnectionError> {
        let reader = self.tcp.try_clone()?;
        let mut reader = std::io::BufReader::new(reader);
        let mut line = String::new();
        loop {
            line.clear();
            let n = std::io::BufRead::read_line(&mut reader, &mut line)?;
            if n == 0 || line.trim().is_empty() {
                return Ok(());
            }
        }
    }

    /// Put one record on the matching send queue for a worker to flush.
    /// No-op once teardown began.
    pub fn enqueue(self: &Arc<Self>, record: Record) {
        if !self.is_alive() {
            return;
        }
        if record.is_update() {
            self.unreliable_queue.enqueue(record);
        } else {
            self.reliable_queue.enqueue(record);
        }
    }

    /// Send one already-packed datagram to the bound remote endpoint.
    pub(crate) fn send_datagram(&self, datagram: &[u8]) -> std::io::Result<()> {
        if self.udp_connected {
            self.udp.send(datagram)?;
        } else {
            self.udp.send_to(datagram, self.udp_remote)?;
        }
        Ok(())
    }

    /// Write pre-framed bytes to the stream under the send lock.
    pub(crate) fn write_reliable(&self, buf: &[u8]) -> Result<(), ConnectionError> {
        let mut st = self.lock_send();
        st.stream.write_all(buf)?;
        st.stream.flush()?;
        Ok(())
    }

    /// Encode a record with this connection's codec and context.
    pub(crate) fn encode_record(
        &self,
        record: &Record,
        buf: &mut Vec<u8>,
    ) -> Result<(), CodecError> {
        self.codec.encode(record, &self.ctx, buf)
    }

    fn lock_send(&self) -> std::sync::MutexGuard<'_, SendState> {
        self.send_state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -- rate metrics and caps ----------------------------------------------

    fn send_metrics(&self, kind: ChannelKind) -> &RateMetrics {
        match kind {
            ChannelKind::Reliable => &self.reliable_send,
            ChannelKind::Unreliable => &self.unreliable_send,
        }
    }

    /// Fold a send event into the channel's metrics; returns whether the
    /// connection is now capped on that channel.
    pub fn update_send_metrics(&self, kind: ChannelKind, bytes: f32, packets: f32) -> bool {
        self.send_metrics(kind).observe(bytes, packets);
        self.is_send_capped(kind)
    }

    /// Whether the channel's send rate exceeds its per-peer cap, scaled by
    /// the current tick rate.
    pub fn is_send_capped(&self, kind: ChannelKind) -> bool {
        let (byte_rate, packet_rate) = self.send_metrics(kind).current();
        let tick = self.tick_rate.get() as f32;
        let (bytes_per_tick, packets_per_tick) = match kind {
            ChannelKind::Reliable => (
                self.limits.reliable_bytes_per_tick,
                self.limits.reliable_packets_per_tick,
            ),
            ChannelKind::Unreliable => (
                self.limits.unreliable_bytes_per_tick,
                self.limits.unreliable_packets_per_tick,
            ),
        };
        (bytes_per_tick > 0 && byte_rate >= bytes_per_tick as f32 * tick)
            || (packets_per_tick > 0 && packet_rate >= packets_per_tick as f32 * tick)
    }

    /// Current send rate `(bytes/sec, packets/sec)` for diagnostics.
    pub fn send_rate(&self, kind: ChannelKind) -> (f32, f32) {
        self.send_metrics(kind).current()
    }

    /// Current receive rate `(bytes/sec, packets/sec)` for diagnostics.
    pub fn recv_rate(&self, kind: ChannelKind) -> (f32, f32) {
        match kind {
            ChannelKind::Reliable => self.reliable_recv.current(),
            ChannelKind::Unreliable => self.unreliable_recv.current(),
        }
    }

    // -- receive loops ------------------------------------------------------

    /// Spawn the reliable receive loop. Idempotent; no-op if already
    /// started or teardown began.
    pub fn start_receive_reliable(
        self: &Arc<Self>,
        handler: Arc<dyn RecordHandler>,
    ) -> std::io::Result<()> {
        let mut guard = self.recv_reliable.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() || !self.is_alive() {
            return Ok(());
        }
        let reader = self.tcp.try_clone()?;
        reader.set_read_timeout(Some(self.settings.receive_timeout))?;
        let con = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("recv-reliable-{}", self.id.0))
            .spawn(move || con.run_reliable_loop(reader, handler))?;
        *guard = Some(handle);
        Ok(())
    }

    /// Spawn the unreliable receive loop. Idempotent; no-op if already
    /// started, teardown began, or this connection does not own the socket.
    pub fn start_receive_unreliable(
        self: &Arc<Self>,
        handler: Arc<dyn RecordHandler>,
    ) -> std::io::Result<()> {
        if !self.owns_udp {
            return Ok(());
        }
        let mut guard = self
            .recv_unreliable
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if guard.is_some() || !self.is_alive() {
            return Ok(());
        }
        self.udp
            .set_read_timeout(Some(self.settings.receive_timeout))?;
        let con = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("recv-unreliable-{}", self.id.0))
            .spawn(move || con.run_unreliable_loop(handler))?;
        *guard = Some(handle);
        Ok(())
    }

    fn run_reliable_loop(self: Arc<Self>, reader: TcpStream, handler: Arc<dyn RecordHandler>) {
        let frame_config = self.settings.frame_config();
        let mut reader = std::io::BufReader::with_capacity(self.settings.tcp_buffer_size, reader);
        let mut payload: Vec<u8> = Vec::with_capacity(frame_config.max_payload_size as usize);

        let result: Result<(), ConnectionError> = loop {
            let keep_waiting = || self.is_alive();
            match frame::read_frame_into(&mut reader, &mut payload, &frame_config, &keep_waiting) {
                Ok(framed) => {
                    self.reliable_recv.observe(framed as f32, 1.0);
                    let mut input = payload.as_slice();
                    match self.codec.decode(&mut input) {
                        Ok(record) => handler.handle(&self, record),
                        Err(e) => break Err(e.into()),
                    }
                }
                // Cooperative-cancellation exit is not an error.
                Err(FrameError::Cancelled) => break Ok(()),
                Err(e) => break Err(e.into()),
            }
        };

        self.finish_loop(&self.recv_reliable, "reliable", result);
    }

    fn run_unreliable_loop(self: Arc<Self>, handler: Arc<dyn RecordHandler>) {
        let mut buf = vec![0u8; self.settings.udp_max_datagram_size.max(1)];

        let result: Result<(), ConnectionError> = loop {
            if !self.is_alive() {
                break Ok(());
            }
            match self.udp.recv_from(&mut buf) {
                Ok((n, src)) => {
                    // Datagrams from anyone but the bound peer are dropped
                    // silently.
                    if src != self.udp_remote || n == 0 {
                        continue;
                    }
                    self.observe_container(buf[0]);
                    self.unreliable_recv.observe(n as f32, 1.0);

                    let mut input = &buf[1..n];
                    let mut failure = None;
                    while !input.is_empty() {
                        match self.codec.decode(&mut input) {
                            Ok(record) => handler.handle(&self, record),
                            Err(e) => {
                                failure = Some(e);
                                break;
                            }
                        }
                    }
                    if let Some(e) = failure {
                        break Err(e.into());
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(e) => break Err(e.into()),
            }
        };

        self.finish_loop(&self.recv_unreliable, "unreliable", result);
    }

    /// Common receive-loop epilogue: errors observed after teardown already
    /// began are swallowed; anything else is fatal to this connection only.
    fn finish_loop(
        self: &Arc<Self>,
        handle_slot: &Mutex<Option<JoinHandle<()>>>,
        channel: &str,
        result: Result<(), ConnectionError>,
    ) {
        match result {
            Ok(()) => {}
            Err(_) if !self.is_alive() => {}
            Err(e) if e.is_disconnect() => {
                tracing::info!("Peer closed {channel} channel of {}", self);
                handle_slot.lock().unwrap_or_else(|g| g.into_inner()).take();
                self.dispose();
            }
            Err(e) => {
                tracing::error!("{channel} receive loop error on {}: {e}", self);
                handle_slot.lock().unwrap_or_else(|g| g.into_inner()).take();
                self.dispose();
            }
        }
    }

    fn observe_container(&self, seq: u8) {
        let mut last = self
            .last_container_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(prev) = *last {
            let gap = seq.wrapping_sub(prev.wrapping_add(1));
            // Reordered or duplicated datagrams show up as huge wrapped
            // gaps; only small forward gaps count as losses.
            if gap > 0 && gap < 0x40 {
                self.containers_lost.fetch_add(gap as u64, Ordering::Relaxed);
            }
        }
        *last = Some(seq);
    }

    // -- lifecycle ----------------------------------------------------------

    /// Install a hook invoked exactly once when teardown begins, before the
    /// sockets are shut down.
    pub fn set_on_teardown(&self, hook: impl FnOnce(&Arc<DualConnection>) + Send + 'static) {
        *self.on_teardown.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(hook));
    }

    /// Tear the connection down. Idempotent and safe from any thread.
    pub fn dispose(self: &Arc<Self>) {
        if self.alive.swap(false, Ordering::SeqCst) == false {
            return;
        }
        tracing::info!("Closing connection {}", self);

        let hook = self
            .on_teardown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(hook) = hook {
            hook(self);
        }

        // Clear timeouts, then drop the link without lingering. Shutting the
        // stream down also wakes a reader blocked past its timeout.
        let _ = self.tcp.set_read_timeout(None);
        let _ = self.tcp.shutdown(std::net::Shutdown::Both);

        // The UDP socket may be shared server-wide; only a connection whose
        // receive loop owns it lets it close (by dropping the Arc once the
        // loop observes the cleared liveness flag and exits).

        self.reliable_queue.clear_backlog();
        self.unreliable_queue.clear_backlog();

        // Release buffers; the loops detach and exit on their next poll.
        {
            let mut st = self.lock_send();
            st.scratch = Vec::new();
            st.wire = Vec::new();
        }
        self.recv_reliable
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.recv_unreliable
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }
}

impl fmt::Display for DualConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp/udp {} <-> {}", self.tcp_local, self.tcp_remote)?;
        if let Some(udp_local) = self.udp_local {
            write!(f, " / {udp_local} <-> {}", self.udp_remote)?;
        }
        Ok(())
    }
}

impl Drop for DualConnection {
    fn drop(&mut self) {
        // Arc::new_cyclic means dispose() cannot run here (it needs the
        // Arc); make sure the socket still goes down if nobody called it.
        self.alive.store(false, Ordering::SeqCst);
        let _ = self.tcp.shutdown(std::net::Shutdown::Both);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PostcardCodec;
    use crate::queue::FlushRequest;
    use crate::record::{PlayerFrame, PlayerIdentity, PlayerState};
    use std::net::TcpListener;
    use std::sync::mpsc;

    /// Scheduler that drops every request (direct-send tests don't flush).
    struct NullScheduler;

    impl FlushScheduler for NullScheduler {
        fn request_flush(&self, _req: FlushRequest) {}
        fn request_flush_delayed(&self, _req: FlushRequest, _delay: Duration) {}
    }

    fn test_params() -> ConnectionParams {
        ConnectionParams {
            codec: Arc::new(PostcardCodec),
            scheduler: Arc::new(NullScheduler),
            settings: NetSettings {
                receive_timeout: Duration::from_millis(50),
                ..NetSettings::default()
            },
            limits: UplinkLimits::default(),
            tick_rate: SharedTickRate::default(),
        }
    }

    /// One relay-side connection plus the raw peer sockets driving it.
    struct Harness {
        con: Arc<DualConnection>,
        peer_tcp: TcpStream,
        peer_udp: UdpSocket,
    }

    /// Build a loopback connection whose UDP socket is connected to the
    /// peer's UDP socket (fixed remote endpoint).
    fn loopback(params: ConnectionParams) -> Harness {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer_tcp = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (tcp, _) = listener.accept().unwrap();

        let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer_udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        udp.connect(peer_udp.local_addr().unwrap()).unwrap();
        peer_udp.connect(udp.local_addr().unwrap()).unwrap();
        peer_udp
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        peer_tcp
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let con =
            DualConnection::open(ConnectionId(1), tcp, Arc::new(udp), true, params).unwrap();
        Harness {
            con,
            peer_tcp,
            peer_udp,
        }
    }

    fn state_record() -> Record {
        Record::PlayerState(PlayerState {
            player_id: 1,
            channel: 0,
            level: "1A".into(),
            mode: 0,
        })
    }

    fn frame_record(seq: u32) -> Record {
        Record::PlayerFrame(PlayerFrame {
            player: PlayerIdentity {
                id: 1,
                name: "Ada".into(),
                full_name: "Ada".into(),
            },
            sequence: seq,
            payload: vec![7; 16],
        })
    }

    #[test]
    fn test_non_update_records_go_over_the_stream() {
        let h = loopback(test_params());
        let record = state_record();
        h.con.send(&record).unwrap();

        let mut payload = Vec::new();
        let config = FrameConfig::default();
        let mut reader = h.peer_tcp.try_clone().unwrap();
        frame::read_frame_into(&mut reader, &mut payload, &config, &|| true).unwrap();

        let decoded = PostcardCodec.decode(&mut payload.as_slice()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_update_records_go_over_datagrams() {
        let h = loopback(test_params());
        let record = frame_record(4);
        h.con.send(&record).unwrap();

        let mut buf = [0u8; 2048];
        let n = h.peer_udp.recv(&mut buf).unwrap();
        assert!(n > 1, "datagram must carry a sequence byte plus payload");
        // First byte is the container sequence id.
        assert_eq!(buf[0], 0);
        let decoded = PostcardCodec.decode(&mut &buf[1..n]).unwrap();
        assert_eq!(decoded, record);

        // A second datagram increments the sequence id.
        h.con.send(&frame_record(5)).unwrap();
        let n2 = h.peer_udp.recv(&mut buf).unwrap();
        assert!(n2 > 1);
        assert_eq!(buf[0], 1);
    }

    #[test]
    fn test_reliable_sends_concatenate_in_order() {
        let h = loopback(test_params());
        let records: Vec<Record> = (0..4u32)
            .map(|i| {
                Record::PlayerIdentity(PlayerIdentity {
                    id: i,
                    name: format!("p{i}"),
                    full_name: format!("p{i}"),
                })
            })
            .collect();
        for record in &records {
            h.con.send(record).unwrap();
        }

        let config = FrameConfig::default();
        let mut reader = h.peer_tcp.try_clone().unwrap();
        let mut payload = Vec::new();
        for expected in &records {
            frame::read_frame_into(&mut reader, &mut payload, &config, &|| true).unwrap();
            let decoded = PostcardCodec.decode(&mut payload.as_slice()).unwrap();
            assert_eq!(&decoded, expected);
        }
    }

    #[test]
    fn test_http_probe_gets_the_decoy_response() {
        let h = loopback(test_params());
        h.con.send(&Record::HttpProbe).unwrap();

        let expected = h.con.settings().decoy_response.clone();
        let mut got = vec![0u8; expected.len()];
        let mut reader = h.peer_tcp.try_clone().unwrap();
        std::io::Read::read_exact(&mut reader, &mut got).unwrap();
        assert_eq!(got, expected.as_bytes());
    }

    #[test]
    fn test_reliable_receive_loop_dispatches_records() {
        let h = loopback(test_params());
        let (tx, rx) = mpsc::channel();
        let handler: Arc<dyn RecordHandler> = Arc::new(move |_con: &Arc<DualConnection>, rec| {
            tx.send(rec).unwrap();
        });
        h.con.start_receive_reliable(handler).unwrap();

        // Peer writes one framed record.
        let record = state_record();
        let mut payload = Vec::new();
        PostcardCodec
            .encode(&record, &CodecContext::new(), &mut payload)
            .unwrap();
        let mut wire = Vec::new();
        frame::write_frame(&mut wire, &payload, &FrameConfig::default()).unwrap();
        let mut writer = h.peer_tcp.try_clone().unwrap();
        writer.write_all(&wire).unwrap();

        let received = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(received, record);
        let (byte_rate, packet_rate) = h.con.recv_rate(ChannelKind::Reliable);
        assert!(byte_rate > 0.0, "receive metrics must reflect the frame");
        assert!(packet_rate > 0.0);
        h.con.dispose();
    }

    #[test]
    fn test_unreliable_receive_loop_dispatches_container_records() {
        let h = loopback(test_params());
        let (tx, rx) = mpsc::channel();
        let handler: Arc<dyn RecordHandler> = Arc::new(move |_con: &Arc<DualConnection>, rec| {
            tx.send(rec).unwrap();
        });
        h.con.start_receive_unreliable(handler).unwrap();

        // Peer packs two records into one container.
        let ctx = CodecContext::new();
        let mut datagram = vec![9u8];
        PostcardCodec
            .encode(&frame_record(1), &ctx, &mut datagram)
            .unwrap();
        PostcardCodec
            .encode(&frame_record(2), &ctx, &mut datagram)
            .unwrap();
        h.peer_udp.send(&datagram).unwrap();

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first, frame_record(1));
        assert_eq!(second, frame_record(2));
        h.con.dispose();
    }

    #[test]
    fn test_container_gap_detection() {
        let h = loopback(test_params());
        let (tx, rx) = mpsc::channel();
        let handler: Arc<dyn RecordHandler> = Arc::new(move |_con: &Arc<DualConnection>, rec| {
            tx.send(rec).unwrap();
        });
        h.con.start_receive_unreliable(handler).unwrap();

        let ctx = CodecContext::new();
        for seq in [0u8, 1, 4] {
            let mut datagram = vec![seq];
            PostcardCodec
                .encode(&frame_record(seq as u32), &ctx, &mut datagram)
                .unwrap();
            h.peer_udp.send(&datagram).unwrap();
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        // Sequence 0, 1, 4: containers 2 and 3 went missing.
        assert_eq!(h.con.containers_lost(), 2);
        h.con.dispose();
    }

    #[test]
    fn test_foreign_datagrams_are_dropped_silently() {
        let h = loopback(test_params());
        let (tx, rx) = mpsc::channel::<Record>();
        let handler: Arc<dyn RecordHandler> = Arc::new(move |_con: &Arc<DualConnection>, rec| {
            tx.send(rec).unwrap();
        });
        h.con.start_receive_unreliable(handler).unwrap();

        // A third party sends a datagram to the connection's socket. A
        // connected UDP socket filters it at the OS level; the loop's
        // endpoint check covers unconnected (server-shared) sockets too.
        let stranger = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = h.con.udp.local_addr().unwrap();
        let mut datagram = vec![0u8];
        PostcardCodec
            .encode(&frame_record(1), &CodecContext::new(), &mut datagram)
            .unwrap();
        let _ = stranger.send_to(&datagram, target);

        assert!(
            rx.recv_timeout(Duration::from_millis(300)).is_err(),
            "foreign datagram must not be dispatched"
        );
        h.con.dispose();
    }

    #[test]
    fn test_udp_remote_falls_back_to_stream_remote() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let _peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (tcp, _) = listener.accept().unwrap();
        let tcp_remote = tcp.peer_addr().unwrap();

        // Unconnected UDP socket: no fixed peer.
        let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        let con =
            DualConnection::open(ConnectionId(2), tcp, Arc::new(udp), false, test_params())
                .unwrap();
        assert_eq!(con.udp_remote_addr(), tcp_remote);
    }

    #[test]
    fn test_start_receive_is_idempotent() {
        let h = loopback(test_params());
        let handler: Arc<dyn RecordHandler> =
            Arc::new(|_con: &Arc<DualConnection>, _rec: Record| {});
        h.con.start_receive_reliable(Arc::clone(&handler)).unwrap();
        h.con.start_receive_reliable(Arc::clone(&handler)).unwrap();
        h.con.start_receive_unreliable(Arc::clone(&handler)).unwrap();
        h.con.start_receive_unreliable(handler).unwrap();
        h.con.dispose();
    }

    #[test]
    fn test_unowned_udp_never_starts_a_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let _peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (tcp, _) = listener.accept().unwrap();
        let udp = UdpSocket::bind("127.0.0.1:0").unwrap();

        let con =
            DualConnection::open(ConnectionId(3), tcp, Arc::new(udp), false, test_params())
                .unwrap();
        let handler: Arc<dyn RecordHandler> =
            Arc::new(|_con: &Arc<DualConnection>, _rec: Record| {});
        con.start_receive_unreliable(handler).unwrap();
        assert!(
            con.recv_unreliable
                .lock()
                .unwrap()
                .is_none(),
            "shared UDP socket must not get a receive loop"
        );
    }

    #[test]
    fn test_dispose_is_idempotent_and_fires_hook_once() {
        let h = loopback(test_params());
        let fired = Arc::new(AtomicU64::new(0));
        let fired_clone = Arc::clone(&fired);
        h.con.set_on_teardown(move |_con| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        h.con.dispose();
        h.con.dispose();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!h.con.is_alive());
    }

    #[test]
    fn test_send_after_dispose_is_a_noop() {
        let h = loopback(test_params());
        h.con.dispose();
        assert!(h.con.send(&state_record()).is_ok());
        h.con.enqueue(state_record());
        assert!(h.con.queue(ChannelKind::Reliable).is_empty());
    }

    #[test]
    fn test_peer_close_tears_the_connection_down() {
        let h = loopback(test_params());
        let handler: Arc<dyn RecordHandler> =
            Arc::new(|_con: &Arc<DualConnection>, _rec: Record| {});
        h.con.start_receive_reliable(handler).unwrap();

        drop(h.peer_tcp);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while h.con.is_alive() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!h.con.is_alive(), "peer close must dispose the connection");
    }

    #[test]
    fn test_cap_engages_under_load() {
        let mut params = test_params();
        params.limits = UplinkLimits {
            reliable_bytes_per_tick: 1,
            reliable_packets_per_tick: 0,
            unreliable_bytes_per_tick: 0,
            unreliable_packets_per_tick: 0,
            cap_cooldown: Duration::from_millis(50),
        };
        params.tick_rate = SharedTickRate::new(1);
        let h = loopback(params);

        assert!(!h.con.is_send_capped(ChannelKind::Reliable));
        // One big burst blows straight through a 1 byte/tick cap.
        let capped = h
            .con
            .update_send_metrics(ChannelKind::Reliable, 10_000.0, 1.0);
        assert!(capped, "burst must trip the cap");
        // The unreliable channel's caps are disabled (zero).
        assert!(!h.con.is_send_capped(ChannelKind::Unreliable));
    }

    #[test]
    fn test_cap_scales_with_the_current_tick_rate() {
        let mut params = test_params();
        params.limits = UplinkLimits {
            reliable_bytes_per_tick: 100,
            reliable_packets_per_tick: 0,
            unreliable_bytes_per_tick: 0,
            unreliable_packets_per_tick: 0,
            cap_cooldown: Duration::from_millis(50),
        };
        let tick_rate = SharedTickRate::new(1);
        params.tick_rate = tick_rate.clone();
        let h = loopback(params);

        // 5000 B/s against a 100 B/s cap: capped.
        assert!(h.con.update_send_metrics(ChannelKind::Reliable, 5_000.0, 1.0));

        // Raising the tick rate raises the effective cap past the estimate.
        tick_rate.set(1_000);
        assert!(!h.con.is_send_capped(ChannelKind::Reliable));
    }

    #[test]
    fn test_probe_headers_are_drained_before_the_decoy() {
        let mut h = loopback(test_params());
        h.peer_tcp
            .write_all(b"GET / HTTP/1.1\r\nHost: relay\r\nAccept: */*\r\n\r\n")
            .unwrap();
        h.con.drain_probe_request().unwrap();
        h.con.send(&Record::HttpProbe).unwrap();

        let expected = h.con.settings().decoy_response.clone();
        let mut got = vec![0u8; expected.len()];
        let mut reader = h.peer_tcp.try_clone().unwrap();
        std::io::Read::read_exact(&mut reader, &mut got).unwrap();
        assert_eq!(got, expected.as_bytes());
    }

    #[test]
    fn test_display_includes_both_endpoint_pairs() {
        let h = loopback(test_params());
        let shown = format!("{}", h.con);
        assert!(shown.starts_with("tcp/udp"));
        assert!(shown.contains("<->"));
        assert!(shown.contains('/'), "UDP endpoints should be shown");
    }
}
