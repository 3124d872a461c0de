//! Per-connection send queues and the flush-scheduling contract.
//!
//! Each connection owns one [`SendQueue`] per channel. A queue moves through
//! Idle → Queued → Draining and back; the flush request is handed to the
//! [`FlushScheduler`] only on the Idle→Queued transition, which is what
//! guarantees that at most one sender worker ever drains a given queue.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::connection::DualConnection;
use crate::record::Record;

// ---------------------------------------------------------------------------
// Channel kinds
// ---------------------------------------------------------------------------

/// The two transport channels of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Ordered, lossless stream channel.
    Reliable,
    /// Best-effort, unordered datagram channel.
    Unreliable,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Reliable => write!(f, "reliable"),
            ChannelKind::Unreliable => write!(f, "unreliable"),
        }
    }
}

// ---------------------------------------------------------------------------
// Flush scheduling contract
// ---------------------------------------------------------------------------

/// A request to flush one queue, put on the sender role's shared work queue.
#[derive(Clone)]
pub struct FlushRequest {
    /// Which channel the queue feeds.
    pub kind: ChannelKind,
    /// The queue to flush.
    pub queue: Arc<SendQueue>,
}

/// Collaborator that turns flush requests into worker wakeups.
pub trait FlushScheduler: Send + Sync {
    /// Schedule a flush as soon as a worker is free.
    fn request_flush(&self, req: FlushRequest);

    /// Schedule a flush after `delay` (capped-connection retry).
    fn request_flush_delayed(&self, req: FlushRequest, delay: Duration);
}

// ---------------------------------------------------------------------------
// SendQueue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Idle,
    Queued,
    Draining,
}

struct QueueInner {
    backlog: VecDeque<Record>,
    state: QueueState,
}

/// FIFO backlog for one channel of one connection.
pub struct SendQueue {
    kind: ChannelKind,
    con: Weak<DualConnection>,
    scheduler: Arc<dyn FlushScheduler>,
    inner: Mutex<QueueInner>,
}

impl SendQueue {
    /// Create an idle queue for one channel of `con`.
    pub fn new(
        kind: ChannelKind,
        con: Weak<DualConnection>,
        scheduler: Arc<dyn FlushScheduler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            con,
            scheduler,
            inner: Mutex::new(QueueInner {
                backlog: VecDeque::new(),
                state: QueueState::Idle,
            }),
        })
    }

    /// The channel this queue feeds.
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// The owning connection, while it is still around.
    pub fn connection(&self) -> Option<Arc<DualConnection>> {
        self.con.upgrade()
    }

    /// Queue identity for error logs.
    pub fn label(&self) -> String {
        match self.connection() {
            Some(con) => format!("{} {con}", self.kind),
            None => format!("{} <gone>", self.kind),
        }
    }

    /// Append a record and request a flush if the queue was idle.
    pub fn enqueue(self: &Arc<Self>, record: Record) {
        let request = {
            let mut inner = self.lock();
            inner.backlog.push_back(record);
            if inner.state == QueueState::Idle {
                inner.state = QueueState::Queued;
                true
            } else {
                false
            }
        };
        if request {
            self.scheduler.request_flush(FlushRequest {
                kind: self.kind,
                queue: Arc::clone(self),
            });
        }
    }

    /// Claim the queue for draining. Returns `false` if another worker
    /// already owns it or it is not scheduled (stale request).
    pub fn begin_drain(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == QueueState::Queued {
            inner.state = QueueState::Draining;
            true
        } else {
            false
        }
    }

    /// Pop the next backlog record, oldest first.
    pub fn pop(&self) -> Option<Record> {
        self.lock().backlog.pop_front()
    }

    /// Current backlog length.
    pub fn len(&self) -> usize {
        self.lock().backlog.len()
    }

    /// Whether the backlog is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().backlog.is_empty()
    }

    /// Discard the whole backlog (capped unreliable data is dropped).
    pub fn clear_backlog(&self) {
        self.lock().backlog.clear();
    }

    /// Mark the drain finished. Draining → Idle when the backlog stayed
    /// empty, otherwise → Queued with a fresh flush request (records arrived
    /// while the worker was draining).
    pub fn signal_flushed(self: &Arc<Self>) {
        let request = {
            let mut inner = self.lock();
            debug_assert_eq!(inner.state, QueueState::Draining);
            if inner.backlog.is_empty() {
                inner.state = QueueState::Idle;
                false
            } else {
                inner.state = QueueState::Queued;
                true
            }
        };
        if request {
            self.scheduler.request_flush(FlushRequest {
                kind: self.kind,
                queue: Arc::clone(self),
            });
        }
    }

    /// Mark the drain deferred. Draining → Queued-Delayed: the scheduler
    /// re-enqueues the request after `delay`.
    pub fn delay_flush(self: &Arc<Self>, delay: Duration) {
        {
            let mut inner = self.lock();
            debug_assert_eq!(inner.state, QueueState::Draining);
            inner.state = QueueState::Queued;
        }
        self.scheduler.request_flush_delayed(
            FlushRequest {
                kind: self.kind,
                queue: Arc::clone(self),
            },
            delay,
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
