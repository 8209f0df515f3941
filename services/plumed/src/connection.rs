// Per-peer connection plumbing shared by clients and routes.
//
// Every connection owns exactly one reader (the protocol loop) and one
// writer task. All outbound frames funnel through an unbounded queue drained
// by the writer, so a complete frame is never interleaved with another and a
// publisher is never blocked by a slow peer. A pending-byte gauge enforces
// the slow-consumer cap at enqueue time.
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, watch};

use crate::account::Account;

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    Client,
    Route,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    AwaitConnect,
    Active,
    Draining,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    ClientClosed,
    ProtocolError,
    AuthViolation,
    SlowConsumer,
    WriteDeadline,
    StaleConnection,
    MaxPayload,
    MaxSubscriptions,
    MaxConnections,
    ServerShutdown,
    RouteClosed,
    ClusterNameMismatch,
    DuplicateRoute,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "ClientClosed",
            CloseReason::ProtocolError => "ProtocolError",
            CloseReason::AuthViolation => "AuthViolation",
            CloseReason::SlowConsumer => "SlowConsumer",
            CloseReason::WriteDeadline => "WriteDeadline",
            CloseReason::StaleConnection => "StaleConnection",
            CloseReason::MaxPayload => "MaxPayload",
            CloseReason::MaxSubscriptions => "MaxSubscriptions",
            CloseReason::MaxConnections => "MaxConnections",
            CloseReason::ServerShutdown => "ServerShutdown",
            CloseReason::RouteClosed => "RouteClosed",
            CloseReason::ClusterNameMismatch => "ClusterNameMismatch",
            CloseReason::DuplicateRoute => "DuplicateRoute",
        }
    }
}

#[derive(Debug)]
pub enum Outbound {
    Frame(Bytes),
    /// Flush whatever is queued ahead of this marker, then hang up.
    Drain,
}

/// Route-only connection state.
#[derive(Debug, Default)]
pub struct RouteContext {
    pub remote_server_id: Mutex<Option<String>>,
    pub remote_cluster: Mutex<Option<String>>,
    /// Inbound remote interest keyed by the peer's rsid.
    pub rsid_to_sub: Mutex<HashMap<String, (Arc<Account>, Arc<Subscription>)>>,
    /// The URL we dialed, for reconnect bookkeeping; None on accepted routes.
    pub dialed_url: Option<String>,
}

#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub kind: ConnKind,
    pub peer_addr: SocketAddr,
    out_tx: mpsc::UnboundedSender<Outbound>,
    pending_bytes: AtomicUsize,
    max_pending: usize,
    closed: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
    stop_tx: watch::Sender<bool>,
    abort_tx: watch::Sender<bool>,
    state: Mutex<ConnState>,
    pub verbose: AtomicBool,
    pub outstanding_pings: AtomicU32,
    pub subs: Mutex<HashMap<String, Arc<Subscription>>>,
    pub route: Option<RouteContext>,
}

/// Receiver ends handed to the writer task at spawn time.
pub struct WriterHandles {
    pub out_rx: mpsc::UnboundedReceiver<Outbound>,
    pub abort_rx: watch::Receiver<bool>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        kind: ConnKind,
        peer_addr: SocketAddr,
        max_pending: usize,
        route: Option<RouteContext>,
    ) -> (Arc<Self>, WriterHandles) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);
        let (abort_tx, abort_rx) = watch::channel(false);
        let state = match kind {
            ConnKind::Client => ConnState::AwaitConnect,
            ConnKind::Route => ConnState::Active,
        };
        let conn = Arc::new(Self {
            id,
            kind,
            peer_addr,
            out_tx,
            pending_bytes: AtomicUsize::new(0),
            max_pending,
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            stop_tx,
            abort_tx,
            state: Mutex::new(state),
            verbose: AtomicBool::new(false),
            outstanding_pings: AtomicU32::new(0),
            subs: Mutex::new(HashMap::new()),
            route,
        });
        (conn, WriterHandles { out_rx, abort_rx })
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock().expect("state lock")
    }

    pub fn set_state(&self, state: ConnState) {
        *self.state.lock().expect("state lock") = state;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock().expect("reason lock")
    }

    /// Watch that fires when the reader should stop.
    pub fn stopped(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes.load(Ordering::Relaxed)
    }

    /// Queue a frame for the writer. Returns false when the connection is
    /// closed or the frame pushed it over the slow-consumer cap.
    pub fn enqueue(&self, frame: Bytes) -> bool {
        if self.is_closed() {
            return false;
        }
        let pending = self.pending_bytes.fetch_add(frame.len(), Ordering::AcqRel) + frame.len();
        if pending > self.max_pending {
            // Slow consumer: drop everything buffered and cut the peer off.
            // The publisher carries on untouched.
            self.close_now(CloseReason::SlowConsumer);
            return false;
        }
        self.out_tx.send(Outbound::Frame(frame)).is_ok()
    }

    pub fn send_err(&self, reason: &str) {
        let _ = self.enqueue(plume_proto::encode_err(reason));
    }

    /// Graceful close: the writer flushes queued frames, then hangs up.
    pub fn close(&self, reason: CloseReason) {
        self.record_reason(reason);
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(ConnState::Draining);
        let _ = self.out_tx.send(Outbound::Drain);
        let _ = self.stop_tx.send(true);
    }

    /// Hard close: buffered frames are discarded and the writer exits
    /// immediately.
    pub fn close_now(&self, reason: CloseReason) {
        self.record_reason(reason);
        self.closed.store(true, Ordering::Release);
        self.set_state(ConnState::Closed);
        let _ = self.abort_tx.send(true);
        let _ = self.stop_tx.send(true);
    }

    /// Send a final error line and drain out.
    pub fn close_with_err(&self, message: &str, reason: CloseReason) {
        self.send_err(message);
        self.close(reason);
    }

    fn record_reason(&self, reason: CloseReason) {
        let mut slot = self.close_reason.lock().expect("reason lock");
        slot.get_or_insert(reason);
    }

    fn consumed(&self, bytes: usize) {
        self.pending_bytes.fetch_sub(bytes, Ordering::AcqRel);
    }
}

/// Drain the outbound queue into the socket. Sole writer for this peer, so
/// frames are never interleaved; an INFO push queued between two MSG frames
/// lands between them on the wire.
pub async fn run_writer(
    conn: Arc<Connection>,
    mut socket: OwnedWriteHalf,
    handles: WriterHandles,
    write_deadline: Duration,
) {
    let WriterHandles {
        mut out_rx,
        mut abort_rx,
    } = handles;
    loop {
        tokio::select! {
            // Abort wins over queued frames; a hard close discards them.
            biased;
            changed = abort_rx.changed() => {
                if changed.is_err() || *abort_rx.borrow() {
                    break;
                }
            }
            outbound = out_rx.recv() => {
                match outbound {
                    Some(Outbound::Frame(frame)) => {
                        conn.consumed(frame.len());
                        let write = tokio::time::timeout(write_deadline, socket.write_all(&frame));
                        match write.await {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => {
                                tracing::debug!(conn = conn.id, error = %err, "write failed");
                                conn.close_now(CloseReason::ClientClosed);
                                break;
                            }
                            Err(_) => {
                                tracing::warn!(conn = conn.id, "write deadline exceeded");
                                conn.close_now(CloseReason::WriteDeadline);
                                break;
                            }
                        }
                    }
                    Some(Outbound::Drain) | None => break,
                }
            }
        }
    }
    conn.set_state(ConnState::Closed);
    let _ = socket.shutdown().await;
}

/// A single expression of interest. Shared between the owning connection and
/// the account matcher; it points back at its owner weakly so the
/// account/subscription/connection cycle never leaks.
#[derive(Debug)]
pub struct Subscription {
    /// Matcher identity, unique for the server lifetime.
    pub key: u64,
    /// Client-assigned sid, or the peer's rsid on synthetic route subs.
    pub sid: String,
    pub subject: String,
    pub queue: Option<String>,
    pub account: String,
    pub owner: Weak<Connection>,
    pub owner_id: ConnectionId,
    pub owner_kind: ConnKind,
    /// Auto-unsubscribe cap; delivery stops once `delivered` reaches it.
    pub max_deliveries: Mutex<Option<u64>>,
    pub delivered: AtomicU64,
    /// Peer-reported group cardinality; synthetic queue route subs only.
    pub queue_weight: AtomicU32,
}

impl Subscription {
    pub fn new(
        key: u64,
        sid: impl Into<String>,
        subject: impl Into<String>,
        queue: Option<String>,
        account: impl Into<String>,
        owner: &Arc<Connection>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            sid: sid.into(),
            subject: subject.into(),
            queue,
            account: account.into(),
            owner: Arc::downgrade(owner),
            owner_id: owner.id,
            owner_kind: owner.kind,
            max_deliveries: Mutex::new(None),
            delivered: AtomicU64::new(0),
            queue_weight: AtomicU32::new(0),
        })
    }
}

impl plume_subject::Interest for Subscription {
    fn pattern(&self) -> &str {
        &self.subject
    }

    fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    fn key(&self) -> u64 {
        self.key
    }
}
