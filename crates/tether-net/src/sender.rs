//! The sender role: a bounded, elastic worker pool flushing backlogged send
//! queues onto sockets fairly across many connections.
//!
//! All flush requests go through one shared blocking work queue ("queue of
//! queues"); each worker takes one `(channel, queue)` item at a time, drains
//! that queue with reusable buffers, applies per-connection uplink caps, and
//! either signals the queue flushed or reschedules it. Capped reliable data
//! is retried later through a deadline-ordered timer thread; capped
//! unreliable data is dropped.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use tether_pool::{Role, RoleWorker, ThreadBounds, WorkerContext};

use crate::connection::{ConnectionError, DualConnection, NetSettings};
use crate::frame;
use crate::queue::{ChannelKind, FlushRequest, FlushScheduler, SendQueue};
use crate::rate::RateMetrics;

// ---------------------------------------------------------------------------
// Delayed retries
// ---------------------------------------------------------------------------

struct RetryEntry {
    due: Instant,
    seq: u64,
    req: FlushRequest,
}

impl PartialEq for RetryEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for RetryEntry {}

impl PartialOrd for RetryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RetryEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due).then(self.seq.cmp(&other.seq))
    }
}

/// Deadline loop: holds deferred flush requests and feeds them back into the
/// work queue when their cooldown elapses.
fn run_retry_timer(retry_rx: Receiver<RetryEntry>, work_tx: Sender<FlushRequest>) {
    let mut pending: BinaryHeap<Reverse<RetryEntry>> = BinaryHeap::new();
    loop {
        let now = Instant::now();
        while pending.peek().is_some_and(|entry| entry.0.due <= now) {
            if let Some(Reverse(entry)) = pending.pop() {
                let _ = work_tx.send(entry.req);
            }
        }

        let next_due = pending
            .peek()
            .map(|entry| entry.0.due.saturating_duration_since(now));
        match next_due {
            Some(timeout) => match retry_rx.recv_timeout(timeout) {
                Ok(entry) => pending.push(Reverse(entry)),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match retry_rx.recv() {
                Ok(entry) => pending.push(Reverse(entry)),
                Err(_) => break,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// SenderRole
// ---------------------------------------------------------------------------

/// Per-worker aggregate rate heuristics, one group per channel.
#[derive(Default)]
struct WorkerMetrics {
    reliable: RateMetrics,
    unreliable: RateMetrics,
}

/// The sender role. Implements [`FlushScheduler`] for the connections it
/// serves and [`Role`] for the thread pool that runs its workers.
pub struct SenderRole {
    work_tx: Sender<FlushRequest>,
    work_rx: Receiver<FlushRequest>,
    retry_tx: Mutex<Option<Sender<RetryEntry>>>,
    retry_seq: AtomicU64,
    timer: Mutex<Option<JoinHandle<()>>>,
    udp_bind: SocketAddr,
    settings: NetSettings,
    bounds: ThreadBounds,
    worker_metrics: Mutex<Vec<Arc<WorkerMetrics>>>,
}

impl SenderRole {
    /// Create a sender role whose workers bind UDP sockets at `udp_bind`
    /// (endpoint reuse lets every worker share the server's datagram port).
    pub fn new(udp_bind: SocketAddr, settings: NetSettings) -> Self {
        let (work_tx, work_rx) = unbounded();
        let (retry_tx, retry_rx) = unbounded();
        let timer_tx = work_tx.clone();
        let timer = std::thread::Builder::new()
            .name("sender-retry".to_string())
            .spawn(move || run_retry_timer(retry_rx, timer_tx))
            .ok();
        if timer.is_none() {
            tracing::error!("Failed to spawn the sender retry timer; delayed flushes degrade to immediate");
        }

        Self {
            work_tx,
            work_rx,
            retry_tx: Mutex::new(Some(retry_tx)),
            retry_seq: AtomicU64::new(0),
            timer: Mutex::new(timer),
            udp_bind,
            settings,
            bounds: ThreadBounds { min: 1, max: 64 },
            worker_metrics: Mutex::new(Vec::new()),
        }
    }

    /// Override the declared worker bounds.
    pub fn with_bounds(mut self, bounds: ThreadBounds) -> Self {
        self.bounds = bounds;
        self
    }

    /// Flush requests currently waiting for a worker.
    pub fn pending_flushes(&self) -> usize {
        self.work_rx.len()
    }

    /// Aggregate send byte rate across all workers for one channel.
    pub fn byte_rate(&self, kind: ChannelKind) -> f32 {
        self.lock_metrics()
            .iter()
            .map(|m| match kind {
                ChannelKind::Reliable => m.reliable.byte_rate(),
                ChannelKind::Unreliable => m.unreliable.byte_rate(),
            })
            .sum()
    }

    /// Aggregate send packet rate across all workers for one channel.
    pub fn packet_rate(&self, kind: ChannelKind) -> f32 {
        self.lock_metrics()
            .iter()
            .map(|m| match kind {
                ChannelKind::Reliable => m.reliable.packet_rate(),
                ChannelKind::Unreliable => m.unreliable.packet_rate(),
            })
            .sum()
    }

    /// Stop the retry timer. Idempotent; called automatically on drop.
    pub fn dispose(&self) {
        self.retry_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let timer = self.timer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = timer {
            let _ = handle.join();
        }
    }

    fn lock_metrics(&self) -> std::sync::MutexGuard<'_, Vec<Arc<WorkerMetrics>>> {
        self.worker_metrics.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for SenderRole {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl FlushScheduler for SenderRole {
    fn request_flush(&self, req: FlushRequest) {
        let _ = self.work_tx.send(req);
    }

    fn request_flush_delayed(&self, req: FlushRequest, delay: Duration) {
        let entry = RetryEntry {
            due: Instant::now() + delay,
            seq: self.retry_seq.fetch_add(1, Ordering::Relaxed),
            req,
        };
        let guard = self.retry_tx.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => {
                let _ = tx.send(entry);
            }
            // Timer gone (disposal in progress): degrade to an immediate
            // retry rather than dropping reliable data.
            None => {
                let _ = self.work_tx.send(entry.req);
            }
        }
    }
}

impl Role for SenderRole {
    fn name(&self) -> &str {
        "sender"
    }

    fn thread_bounds(&self) -> ThreadBounds {
        self.bounds
    }

    fn create_worker(&self) -> Box<dyn RoleWorker> {
        let metrics = Arc::new(WorkerMetrics::default());
        self.lock_metrics().push(Arc::clone(&metrics));

        let udp = match build_worker_socket(self.udp_bind) {
            Ok(socket) => Some(socket),
            Err(e) => {
                tracing::warn!(
                    "Sender worker could not bind its own UDP socket at {}: {e}; \
                     falling back to per-connection sockets",
                    self.udp_bind
                );
                None
            }
        };

        let max_record = self.settings.max_record_size as usize;
        Box::new(SenderWorker {
            work_rx: self.work_rx.clone(),
            metrics,
            settings: self.settings.clone(),
            udp,
            scratch: Vec::with_capacity(max_record),
            staging: Vec::with_capacity(self.settings.tcp_buffer_size),
            dgram: Vec::with_capacity(self.settings.udp_max_datagram_size),
        })
    }
}

/// Build a worker's UDP socket with endpoint reuse so several workers can
/// share the server's datagram port.
fn build_worker_socket(bind: SocketAddr) -> std::io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.bind(&bind.into())?;
    Ok(socket.into())
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct SenderWorker {
    work_rx: Receiver<FlushRequest>,
    metrics: Arc<WorkerMetrics>,
    settings: NetSettings,
    udp: Option<UdpSocket>,
    scratch: Vec<u8>,
    staging: Vec<u8>,
    dgram: Vec<u8>,
}

impl RoleWorker for SenderWorker {
    fn run(&mut self, ctx: &WorkerContext) {
        loop {
            if ctx.token().is_stopped() {
                return;
            }
            crossbeam_channel::select! {
                recv(self.work_rx) -> msg => match msg {
                    Ok(req) => self.handle_request(ctx, req),
                    Err(_) => return,
                },
                recv(ctx.token().wake_channel()) -> _ => return,
            }
        }
    }
}

impl SenderWorker {
    fn handle_request(&mut self, ctx: &WorkerContext, req: FlushRequest) {
        let FlushRequest { kind, queue } = req;
        let _zone = ctx.active_zone();

        // Exclusive claim; a stale or already-draining queue is skipped.
        if !queue.begin_drain() {
            return;
        }
        let Some(con) = queue.connection() else {
            return;
        };
        if !con.is_alive() {
            queue.clear_backlog();
            queue.signal_flushed();
            return;
        }

        let result = match kind {
            ChannelKind::Reliable => self.flush_reliable(&con, &queue),
            ChannelKind::Unreliable => self.flush_unreliable(&con, &queue),
        };

        match result {
            Ok(()) => {}
            Err(e) if e.is_disconnect() => {
                tracing::info!("Peer of {} disconnected during flush", con);
                con.dispose();
            }
            Err(e) => {
                tracing::warn!("Error flushing {} queue of {}: {e}", queue.kind(), con);
                con.dispose();
            }
        }
    }

    /// Drain one reliable queue. Capped connections are deferred, never
    /// shortened: reliable data is never dropped.
    fn flush_reliable(
        &mut self,
        con: &Arc<DualConnection>,
        queue: &Arc<SendQueue>,
    ) -> Result<(), ConnectionError> {
        if con.is_send_capped(ChannelKind::Reliable) {
            let (byte_rate, packet_rate) = con.send_rate(ChannelKind::Reliable);
            tracing::warn!(
                "Connection {} hit reliable uplink cap: {byte_rate:.0} B/s {packet_rate:.0} P/s",
                con
            );
            queue.delay_flush(con.cap_cooldown());
            return Ok(());
        }

        let frame_config = self.settings.frame_config();
        self.staging.clear();
        let mut bytes = 0f32;
        let mut packets = 0f32;

        while let Some(record) = queue.pop() {
            self.scratch.clear();
            con.encode_record(&record, &mut self.scratch)?;
            let framed = frame::append_frame(&mut self.staging, &self.scratch, &frame_config)?;
            bytes += framed as f32;
            packets += 1.0;

            if self.staging.len() >= self.settings.tcp_buffer_size {
                con.write_reliable(&self.staging)?;
                self.staging.clear();
            }

            // Stop early once this flush tips the connection over its cap;
            // whatever is left stays queued for the delayed retry.
            if con.update_send_metrics(ChannelKind::Reliable, framed as f32, 1.0) {
                break;
            }
        }

        if !self.staging.is_empty() {
            con.write_reliable(&self.staging)?;
            self.staging.clear();
        }

        if queue.is_empty() {
            queue.signal_flushed();
        } else {
            queue.delay_flush(con.cap_cooldown());
        }

        self.metrics.reliable.observe(bytes, packets);
        Ok(())
    }

    /// Drain one unreliable queue into fixed-size containers. Capped
    /// connections discard their backlog: stale updates are worthless.
    fn flush_unreliable(
        &mut self,
        con: &Arc<DualConnection>,
        queue: &Arc<SendQueue>,
    ) -> Result<(), ConnectionError> {
        if con.is_send_capped(ChannelKind::Unreliable) {
            let (byte_rate, packet_rate) = con.send_rate(ChannelKind::Unreliable);
            tracing::warn!(
                "Connection {} hit unreliable uplink cap: {byte_rate:.0} B/s {packet_rate:.0} P/s",
                con
            );
            queue.clear_backlog();
            queue.signal_flushed();
            return Ok(());
        }

        let max = self.settings.udp_max_datagram_size;
        self.dgram.clear();
        self.dgram.push(con.next_container_seq());
        let mut bytes = 0f32;
        let mut packets = 0f32;
        let mut capped = false;

        while let Some(record) = queue.pop() {
            self.scratch.clear();
            con.encode_record(&record, &mut self.scratch)?;
            if 1 + self.scratch.len() > max {
                tracing::warn!(
                    "Dropping unreliable record of {} bytes (container limit {max}) for {}",
                    self.scratch.len(),
                    con
                );
                continue;
            }

            if self.dgram.len() + self.scratch.len() > max {
                // Container full: ship it and start the next one.
                let sent = self.dgram.len();
                self.send_container(con)?;
                if con.update_send_metrics(ChannelKind::Unreliable, sent as f32, 1.0) {
                    capped = true;
                    break;
                }
                self.dgram.clear();
                self.dgram.push(con.next_container_seq());
            }

            self.dgram.extend_from_slice(&self.scratch);
            bytes += self.scratch.len() as f32;
            packets += 1.0;
        }

        if capped {
            // What was already packed went out; the rest is dropped.
            queue.clear_backlog();
        } else if self.dgram.len() > 1 {
            let sent = self.dgram.len();
            self.send_container(con)?;
            con.update_send_metrics(ChannelKind::Unreliable, sent as f32, 1.0);
        }

        queue.signal_flushed();
        self.metrics.unreliable.observe(bytes, packets);
        Ok(())
    }

    fn send_container(&self, con: &Arc<DualConnection>) -> std::io::Result<()> {
        match &self.udp {
            Some(socket) => {
                socket.send_to(&self.dgram, con.udp_remote_addr())?;
            }
            None => con.send_datagram(&self.dgram)?,
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{PostcardCodec, RecordCodec};
    use crate::connection::{
        ConnectionId, ConnectionParams, SharedTickRate, UplinkLimits,
    };
    use crate::frame::FrameConfig;
    use crate::record::{PlayerFrame, PlayerIdentity, Record};
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use tether_pool::{FixedSize, Pool};

    struct Harness {
        con: Arc<DualConnection>,
        peer_tcp: TcpStream,
        peer_udp: UdpSocket,
        role: Arc<SenderRole>,
        pool: Pool,
    }

    fn settings() -> NetSettings {
        NetSettings {
            receive_timeout: Duration::from_millis(50),
            ..NetSettings::default()
        }
    }

    fn harness_with(limits: UplinkLimits, tick_rate: SharedTickRate, s: NetSettings) -> Harness {
        let role = Arc::new(SenderRole::new(
            "127.0.0.1:0".parse().unwrap(),
            s.clone(),
        ));
        let pool = Pool::new();
        pool.add_role(
            Arc::clone(&role) as Arc<dyn Role>,
            Box::new(FixedSize(2)),
        )
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer_tcp = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (tcp, _) = listener.accept().unwrap();

        let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        // The peer socket stays unconnected: worker sockets send from their
        // own endpoints.
        let peer_udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        udp.connect(peer_udp.local_addr().unwrap()).unwrap();
        peer_udp
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        peer_tcp
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();

        let params = ConnectionParams {
            codec: Arc::new(PostcardCodec),
            scheduler: Arc::clone(&role) as Arc<dyn FlushScheduler>,
            settings: s,
            limits,
            tick_rate,
        };
        let con =
            DualConnection::open(ConnectionId(1), tcp, Arc::new(udp), true, params).unwrap();
        Harness {
            con,
            peer_tcp,
            peer_udp,
            role,
            pool,
        }
    }

    fn harness() -> Harness {
        harness_with(
            UplinkLimits::default(),
            SharedTickRate::default(),
            settings(),
        )
    }

    fn identity(i: u32) -> Record {
        Record::PlayerIdentity(PlayerIdentity {
            id: i,
            name: format!("p{i}"),
            full_name: format!("p{i}"),
        })
    }

    fn frame_record(seq: u32, payload_len: usize) -> Record {
        Record::PlayerFrame(PlayerFrame {
            player: PlayerIdentity {
                id: 1,
                name: "Ada".into(),
                full_name: "Ada".into(),
            },
            sequence: seq,
            payload: vec![0xEE; payload_len],
        })
    }

    fn read_frames(stream: &mut TcpStream, count: usize) -> Vec<Record> {
        let config = FrameConfig::default();
        let mut payload = Vec::new();
        let mut out = Vec::new();
        for _ in 0..count {
            frame::read_frame_into(stream, &mut payload, &config, &|| true).unwrap();
            out.push(PostcardCodec.decode(&mut payload.as_slice()).unwrap());
        }
        out
    }

    #[test]
    fn test_enqueued_reliable_records_reach_the_wire_in_order() {
        let mut h = harness();
        for i in 0..5 {
            h.con.enqueue(identity(i));
        }

        h.peer_tcp
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let got = read_frames(&mut h.peer_tcp, 5);
        for (i, record) in got.iter().enumerate() {
            assert_eq!(record, &identity(i as u32), "frame {i} out of order");
        }
        h.pool.shutdown();
    }

    #[test]
    fn test_unreliable_records_pack_into_sequenced_containers() {
        let mut s = settings();
        // Sized so two encoded frames fit one container but three do not.
        s.udp_max_datagram_size = 120;

        let role = Arc::new(SenderRole::new("127.0.0.1:0".parse().unwrap(), s.clone()));
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let _peer_tcp = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (tcp, _) = listener.accept().unwrap();
        let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer_udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        udp.connect(peer_udp.local_addr().unwrap()).unwrap();
        peer_udp
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let params = ConnectionParams {
            codec: Arc::new(PostcardCodec),
            scheduler: Arc::clone(&role) as Arc<dyn FlushScheduler>,
            settings: s,
            limits: UplinkLimits::default(),
            tick_rate: SharedTickRate::default(),
        };
        let con =
            DualConnection::open(ConnectionId(1), tcp, Arc::new(udp), true, params).unwrap();

        // Queue all three records before any worker exists, so one drain
        // packs them deterministically.
        let records: Vec<Record> = (0..3).map(|i| frame_record(i, 40)).collect();
        for r in records.clone() {
            con.queue(ChannelKind::Unreliable).enqueue(r);
        }

        let pool = Pool::new();
        pool.add_role(Arc::clone(&role) as Arc<dyn Role>, Box::new(FixedSize(1)))
            .unwrap();

        let mut buf = [0u8; 2048];
        let mut received: Vec<(u8, Vec<Record>)> = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while received.iter().map(|(_, r)| r.len()).sum::<usize>() < 3 {
            assert!(Instant::now() < deadline, "timed out waiting for containers");
            let (n, _src) = peer_udp.recv_from(&mut buf).unwrap();
            let mut input = &buf[1..n];
            let mut records_in = Vec::new();
            while !input.is_empty() {
                records_in.push(PostcardCodec.decode(&mut input).unwrap());
            }
            received.push((buf[0], records_in));
        }

        // [a, b] then [c], with distinct sequence ids.
        assert_eq!(received.len(), 2, "expected exactly two containers");
        assert_eq!(received[0].1.len(), 2);
        assert_eq!(received[1].1.len(), 1);
        assert_ne!(received[0].0, received[1].0);
        let flat: Vec<&Record> = received.iter().flat_map(|(_, r)| r).collect();
        for (i, record) in flat.iter().enumerate() {
            assert_eq!(**record, records[i]);
        }
        pool.shutdown();
    }

    #[test]
    fn test_capped_reliable_flush_preserves_backlog_and_defers() {
        let limits = UplinkLimits {
            reliable_bytes_per_tick: 1,
            reliable_packets_per_tick: 0,
            unreliable_bytes_per_tick: 0,
            unreliable_packets_per_tick: 0,
            cap_cooldown: Duration::from_millis(50),
        };
        let h = harness_with(limits, SharedTickRate::new(1), settings());

        // Saturate the estimate far beyond the cap; it will not decay below
        // 1 B/s within this test.
        h.con
            .update_send_metrics(ChannelKind::Reliable, 1_000_000.0, 1.0);
        assert!(h.con.is_send_capped(ChannelKind::Reliable));

        h.con.enqueue(identity(1));
        std::thread::sleep(Duration::from_millis(200));

        // The backlog must not shrink, and nothing may reach the peer.
        assert_eq!(h.con.queue(ChannelKind::Reliable).len(), 1);
        let mut probe = [0u8; 1];
        let mut reader = h.peer_tcp.try_clone().unwrap();
        assert!(
            reader.read_exact(&mut probe).is_err(),
            "capped reliable data must stay queued"
        );

        h.con.dispose();
        h.pool.shutdown();
    }

    #[test]
    fn test_capped_unreliable_flush_discards_backlog() {
        let limits = UplinkLimits {
            reliable_bytes_per_tick: 0,
            reliable_packets_per_tick: 0,
            unreliable_bytes_per_tick: 1,
            unreliable_packets_per_tick: 0,
            cap_cooldown: Duration::from_millis(50),
        };
        let h = harness_with(limits, SharedTickRate::new(1), settings());

        h.con
            .update_send_metrics(ChannelKind::Unreliable, 1_000_000.0, 1.0);
        assert!(h.con.is_send_capped(ChannelKind::Unreliable));

        for i in 0..4 {
            h.con.queue(ChannelKind::Unreliable).enqueue(frame_record(i, 16));
        }

        // The drain must fully discard the backlog and settle back to idle.
        let deadline = Instant::now() + Duration::from_secs(5);
        while !h.con.queue(ChannelKind::Unreliable).is_empty() {
            assert!(Instant::now() < deadline, "backlog should be discarded");
            std::thread::sleep(Duration::from_millis(10));
        }

        let mut buf = [0u8; 2048];
        h.peer_udp
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        assert!(
            h.peer_udp.recv_from(&mut buf).is_err(),
            "capped unreliable data must be dropped, not sent"
        );
        h.pool.shutdown();
    }

    #[test]
    fn test_delayed_retry_flushes_once_the_cap_decays() {
        let limits = UplinkLimits {
            // 100 bytes/tick at 10 ticks/sec: cap at 1000 B/s.
            reliable_bytes_per_tick: 100,
            reliable_packets_per_tick: 0,
            unreliable_bytes_per_tick: 0,
            unreliable_packets_per_tick: 0,
            cap_cooldown: Duration::from_millis(50),
        };
        let mut h = harness_with(limits, SharedTickRate::new(10), settings());

        // Seed the estimate just above the cap; it decays below within a
        // couple hundred milliseconds.
        h.con
            .update_send_metrics(ChannelKind::Reliable, 2_000.0, 1.0);
        assert!(h.con.is_send_capped(ChannelKind::Reliable));

        h.con.enqueue(identity(7));

        // The retry timer must eventually re-deliver the flush request.
        h.peer_tcp
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let got = read_frames(&mut h.peer_tcp, 1);
        assert_eq!(got[0], identity(7));
        h.pool.shutdown();
    }

    #[test]
    fn test_worker_aggregate_rates_rise_after_flushing() {
        let mut h = harness();
        for i in 0..10 {
            h.con.enqueue(identity(i));
        }
        h.peer_tcp
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let _ = read_frames(&mut h.peer_tcp, 10);

        assert!(
            h.role.byte_rate(ChannelKind::Reliable) > 0.0,
            "aggregate byte rate must reflect the flush"
        );
        assert!(h.role.packet_rate(ChannelKind::Reliable) > 0.0);
        h.pool.shutdown();
    }

    #[test]
    fn test_flushing_a_dead_connection_settles_the_queue() {
        let h = harness();
        let queue = Arc::clone(h.con.queue(ChannelKind::Reliable));
        h.con.dispose();

        // A request for a dead connection must settle without wedging the
        // worker or the queue.
        h.role.request_flush(FlushRequest {
            kind: ChannelKind::Reliable,
            queue: Arc::clone(&queue),
        });
        std::thread::sleep(Duration::from_millis(100));
        assert!(queue.is_empty());
        h.pool.shutdown();
    }

    #[test]
    fn test_role_dispose_is_idempotent() {
        let h = harness();
        h.role.dispose();
        h.role.dispose();
        h.pool.shutdown();
    }

    #[test]
    fn test_oversized_unreliable_record_is_dropped_not_fatal() {
        let mut s = settings();
        s.udp_max_datagram_size = 64;
        let h = harness_with(UplinkLimits::default(), SharedTickRate::default(), s);

        // Too big for any container; must be skipped without killing the
        // connection.
        h.con.queue(ChannelKind::Unreliable).enqueue(frame_record(1, 256));
        h.con.queue(ChannelKind::Unreliable).enqueue(frame_record(2, 8));

        let mut buf = [0u8; 2048];
        let (n, _src) = h.peer_udp.recv_from(&mut buf).unwrap();
        let record = PostcardCodec.decode(&mut &buf[1..n]).unwrap();
        assert_eq!(record, frame_record(2, 8));
        assert!(h.con.is_alive());
        h.pool.shutdown();
    }
}
