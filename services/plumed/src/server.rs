// Server core: account registry, connection tables, publish fanout, queue
// distribution, lame-duck orchestration, and shutdown.
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};

use plume_proto::ServerInfo;

use crate::account::{Account, DEFAULT_ACCOUNT, Propagation};
use crate::config::{ServerConfig, parse_route_url};
use crate::connection::{CloseReason, ConnKind, Connection, ConnectionId, Subscription};
use crate::{client, cluster};

const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Counts live worker tasks so shutdown can join them all before reporting
/// completion.
#[derive(Debug, Default)]
pub(crate) struct WorkerTracker {
    active: AtomicUsize,
    notify: Notify,
}

pub(crate) struct WorkerGuard(Arc<WorkerTracker>);

impl WorkerTracker {
    fn guard(self: &Arc<Self>) -> WorkerGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        WorkerGuard(Arc::clone(self))
    }

    pub(crate) async fn wait_idle(&self) {
        loop {
            // Register interest before checking so a racing drop cannot be
            // missed.
            let notified = self.notify.notified();
            if self.active.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    #[cfg(test)]
    fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.notify.notify_waiters();
        }
    }
}

/// Process-wide counters, read-only to the outside.
#[derive(Debug, Default)]
pub struct ServerStats {
    msgs_in: AtomicU64,
    msgs_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    slow_consumers: AtomicU64,
}

#[derive(Debug, Clone)]
pub(crate) struct PeerEntry {
    pub conn_id: ConnectionId,
    pub client_url: String,
    pub route_url: Option<String>,
}

#[derive(Debug)]
pub struct Server {
    pub(crate) config: ServerConfig,
    id: String,
    cluster_name: RwLock<String>,
    /// True when the name came from configuration; only explicit names can
    /// conflict, dynamic ones converge by adoption.
    cluster_explicit: bool,
    accounts: RwLock<HashMap<String, Arc<Account>>>,
    clients: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    /// Copy-on-write snapshot so fanout iterates without holding a lock.
    routes: RwLock<Arc<HashMap<ConnectionId, Arc<Connection>>>>,
    peers: Mutex<HashMap<String, PeerEntry>>,
    dialing: Mutex<HashSet<SocketAddr>>,
    next_conn_id: AtomicU64,
    next_rsid: AtomicU64,
    next_sub_key: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    lame_duck: AtomicBool,
    pub(crate) workers: Arc<WorkerTracker>,
    stats: ServerStats,
    close_reasons: Mutex<HashMap<CloseReason, u64>>,
    client_addr: RwLock<Option<SocketAddr>>,
    route_addr: RwLock<Option<SocketAddr>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> crate::config::Result<Arc<Self>> {
        config.validate()?;
        let id = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
        let (cluster_name, cluster_explicit) = match &config.cluster_name {
            Some(name) => (name.clone(), true),
            // Ephemeral name; negotiation may replace it.
            None => (format!("plume-{}", &id[..10].to_lowercase()), false),
        };
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            id,
            cluster_name: RwLock::new(cluster_name),
            cluster_explicit,
            accounts: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            routes: RwLock::new(Arc::new(HashMap::new())),
            peers: Mutex::new(HashMap::new()),
            dialing: Mutex::new(HashSet::new()),
            next_conn_id: AtomicU64::new(1),
            next_rsid: AtomicU64::new(1),
            next_sub_key: AtomicU64::new(1),
            shutdown_tx,
            lame_duck: AtomicBool::new(false),
            workers: Arc::new(WorkerTracker::default()),
            stats: ServerStats::default(),
            close_reasons: Mutex::new(HashMap::new()),
            client_addr: RwLock::new(None),
            route_addr: RwLock::new(None),
        }))
    }

    /// Bind listeners, dial seed routes, and start background workers.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let client_listener = TcpListener::bind(self.config.addr)
            .await
            .with_context(|| format!("bind client listener {}", self.config.addr))?;
        let bound = client_listener.local_addr().context("client local addr")?;
        *self.client_addr.write().expect("addr lock") = Some(bound);
        tracing::info!(addr = %bound, server_id = %self.id, "client listener started");

        if let Some(cluster_addr) = self.config.cluster_addr {
            let route_listener = TcpListener::bind(cluster_addr)
                .await
                .with_context(|| format!("bind route listener {cluster_addr}"))?;
            let bound = route_listener.local_addr().context("route local addr")?;
            *self.route_addr.write().expect("addr lock") = Some(bound);
            tracing::info!(addr = %bound, cluster = %self.cluster_name(), "route listener started");
            let server = Arc::clone(self);
            self.spawn_worker(async move {
                cluster::serve_routes(server, route_listener).await;
            });
        }

        let server = Arc::clone(self);
        self.spawn_worker(async move {
            client::serve_clients(server, client_listener).await;
        });

        for url in self.config.routes.clone() {
            match parse_route_url(&url) {
                Ok(addr) => self.dial_route(addr),
                Err(err) => tracing::error!(url = %url, error = %err, "invalid seed route"),
            }
        }

        let server = Arc::clone(self);
        self.spawn_worker(async move {
            server.run_account_sweeper().await;
        });
        Ok(())
    }

    pub(crate) fn spawn_worker<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.workers.guard();
        tokio::spawn(async move {
            let _guard = guard;
            task.await;
        });
    }

    // Identity ------------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> String {
        self.config
            .server_name
            .clone()
            .unwrap_or_else(|| self.id.clone())
    }

    pub fn cluster_name(&self) -> String {
        self.cluster_name.read().expect("name lock").clone()
    }

    pub fn cluster_name_is_explicit(&self) -> bool {
        self.cluster_explicit
    }

    /// Adopt a peer's cluster name during negotiation.
    pub(crate) fn adopt_cluster_name(&self, name: &str) {
        let mut current = self.cluster_name.write().expect("name lock");
        if *current != name {
            tracing::info!(from = %current, to = %name, "adopting cluster name");
            *current = name.to_string();
        }
    }

    pub fn client_addr(&self) -> Option<SocketAddr> {
        *self.client_addr.read().expect("addr lock")
    }

    pub fn route_addr(&self) -> Option<SocketAddr> {
        *self.route_addr.read().expect("addr lock")
    }

    fn advertised(addr: SocketAddr) -> SocketAddr {
        if addr.ip().is_unspecified() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        } else {
            addr
        }
    }

    pub(crate) fn advertised_client_url(&self) -> String {
        self.client_addr()
            .map(|addr| Self::advertised(addr).to_string())
            .unwrap_or_default()
    }

    pub(crate) fn advertised_route_url(&self) -> Option<String> {
        self.route_addr().map(|addr| Self::advertised(addr).to_string())
    }

    /// INFO payload for clients: topology discovery plus lame-duck signal.
    /// In lame-duck mode our own URL drops out of `connect_urls` so clients
    /// migrate elsewhere.
    pub(crate) fn client_info(&self) -> ServerInfo {
        let advertised = self.advertised_client_url();
        let lame_duck = self.is_lame_duck();
        let mut connect_urls = Vec::new();
        if !lame_duck && !advertised.is_empty() {
            connect_urls.push(advertised.clone());
        }
        let peers = self.peers.lock().expect("peers lock");
        for peer in peers.values() {
            if !peer.client_url.is_empty() {
                connect_urls.push(peer.client_url.clone());
            }
        }
        let (host, port) = match self.client_addr().map(Self::advertised) {
            Some(addr) => (addr.ip().to_string(), addr.port()),
            None => (String::new(), 0),
        };
        ServerInfo {
            server_id: self.id.clone(),
            server_name: self.name(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            host,
            port,
            cluster: self.cluster_name(),
            connect_urls,
            lame_duck_mode: lame_duck,
            cluster_dynamic: !self.cluster_explicit,
            route_url: None,
            route_urls: Vec::new(),
        }
    }

    /// INFO payload exchanged on routes; carries our route address and the
    /// route addresses of known peers for mesh discovery.
    pub(crate) fn route_info(&self) -> ServerInfo {
        let mut info = self.client_info();
        info.route_url = self.advertised_route_url();
        let peers = self.peers.lock().expect("peers lock");
        info.route_urls = peers
            .values()
            .filter_map(|peer| peer.route_url.clone())
            .collect();
        info
    }

    // Accounts ------------------------------------------------------------

    /// Fetch an account, creating it on first reference.
    pub fn account(&self, name: &str) -> Arc<Account> {
        if let Some(account) = self.accounts.read().expect("accounts lock").get(name) {
            return Arc::clone(account);
        }
        let mut accounts = self.accounts.write().expect("accounts lock");
        Arc::clone(
            accounts
                .entry(name.to_string())
                .or_insert_with(|| Account::new(name)),
        )
    }

    pub fn account_names(&self) -> Vec<String> {
        self.accounts.read().expect("accounts lock").keys().cloned().collect()
    }

    async fn run_account_sweeper(self: Arc<Self>) {
        let period = self.config.account_grace.max(Duration::from_secs(2)) / 2;
        let mut interval = tokio::time::interval(period);
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = interval.tick() => self.sweep_accounts(),
                _ = shutdown.changed() => break,
            }
        }
    }

    fn sweep_accounts(&self) {
        let grace = self.config.account_grace;
        let expired: Vec<String> = {
            let accounts = self.accounts.read().expect("accounts lock");
            accounts
                .iter()
                .filter(|(name, account)| *name != DEFAULT_ACCOUNT && account.sweep(grace))
                .map(|(name, _)| name.clone())
                .collect()
        };
        if expired.is_empty() {
            return;
        }
        let mut accounts = self.accounts.write().expect("accounts lock");
        for name in expired {
            // Removal is refused if the account picked up state again.
            if accounts.get(&name).is_some_and(|account| account.is_empty()) {
                tracing::debug!(account = %name, "removing idle account");
                accounts.remove(&name);
            }
        }
    }

    // Connection tables ---------------------------------------------------

    pub(crate) fn next_conn_id(&self) -> ConnectionId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_sub_key(&self) -> u64 {
        self.next_sub_key.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn rsid_counter(&self) -> &AtomicU64 {
        &self.next_rsid
    }

    pub(crate) fn register_client(&self, conn: &Arc<Connection>) {
        self.clients
            .write()
            .expect("clients lock")
            .insert(conn.id, Arc::clone(conn));
    }

    pub(crate) fn unregister_client(&self, conn: &Arc<Connection>) {
        self.clients.write().expect("clients lock").remove(&conn.id);
        let reason = conn.close_reason().unwrap_or(CloseReason::ClientClosed);
        if reason == CloseReason::SlowConsumer {
            self.stats.slow_consumers.fetch_add(1, Ordering::Relaxed);
        }
        *self
            .close_reasons
            .lock()
            .expect("reasons lock")
            .entry(reason)
            .or_insert(0) += 1;
    }

    pub(crate) fn register_route(&self, conn: &Arc<Connection>) {
        let mut routes = self.routes.write().expect("routes lock");
        let mut map = (**routes).clone();
        map.insert(conn.id, Arc::clone(conn));
        *routes = Arc::new(map);
    }

    pub(crate) fn unregister_route(&self, conn: &Arc<Connection>) {
        let mut routes = self.routes.write().expect("routes lock");
        if !routes.contains_key(&conn.id) {
            return;
        }
        let mut map = (**routes).clone();
        map.remove(&conn.id);
        *routes = Arc::new(map);
    }

    pub(crate) fn routes_snapshot(&self) -> Arc<HashMap<ConnectionId, Arc<Connection>>> {
        Arc::clone(&self.routes.read().expect("routes lock"))
    }

    pub(crate) fn clients_snapshot(&self) -> Vec<Arc<Connection>> {
        self.clients
            .read()
            .expect("clients lock")
            .values()
            .cloned()
            .collect()
    }

    // Peer table ----------------------------------------------------------

    /// Record a negotiated peer. Returns false when a route to this server
    /// already exists (duplicate route, caller drops the connection).
    pub(crate) fn add_peer(&self, server_id: &str, entry: PeerEntry) -> bool {
        if server_id == self.id {
            return false;
        }
        let mut peers = self.peers.lock().expect("peers lock");
        if peers.contains_key(server_id) {
            return false;
        }
        peers.insert(server_id.to_string(), entry);
        true
    }

    pub(crate) fn remove_peer_by_conn(&self, conn_id: ConnectionId) {
        let mut peers = self.peers.lock().expect("peers lock");
        peers.retain(|_, entry| entry.conn_id != conn_id);
    }

    /// Route addresses we should be dialing but are not yet.
    pub(crate) fn dial_route(self: &Arc<Self>, addr: SocketAddr) {
        if Some(addr) == self.route_addr().map(Self::advertised) {
            return;
        }
        if !self.dialing.lock().expect("dialing lock").insert(addr) {
            return;
        }
        let server = Arc::clone(self);
        self.spawn_worker(async move {
            cluster::maintain_route(server, addr).await;
        });
    }

    /// Forget a dial target so discovery may re-add it later.
    pub(crate) fn stop_dialing(&self, addr: SocketAddr) {
        self.dialing.lock().expect("dialing lock").remove(&addr);
    }

    // Interest propagation ------------------------------------------------

    pub(crate) fn broadcast_propagation(&self, account: &str, action: &Propagation) {
        let frame = match action {
            Propagation::None => return,
            Propagation::Sub {
                subject,
                queue,
                weight,
                rsid,
            } => plume_proto::encode_rs_plus(account, subject, queue.as_deref(), *weight, rsid),
            Propagation::Unsub {
                subject,
                queue,
                rsid,
            } => plume_proto::encode_rs_minus(account, subject, queue.as_deref(), rsid),
        };
        for route in self.routes_snapshot().values() {
            route.enqueue(frame.clone());
        }
    }

    /// Replay the full coalesced interest of every account to one route.
    /// Used on route establishment; duplicates on the peer are idempotent.
    pub(crate) fn replay_interest(&self, route: &Arc<Connection>) {
        let accounts: Vec<Arc<Account>> = self
            .accounts
            .read()
            .expect("accounts lock")
            .values()
            .cloned()
            .collect();
        for account in accounts {
            for action in account.interest_snapshot() {
                if let Propagation::Sub {
                    subject,
                    queue,
                    weight,
                    rsid,
                } = action
                {
                    route.enqueue(plume_proto::encode_rs_plus(
                        &account.name,
                        &subject,
                        queue.as_deref(),
                        weight,
                        &rsid,
                    ));
                }
            }
        }
    }

    // Publish pipeline ----------------------------------------------------

    /// Fan out a client publish: all local plain subscribers, one member per
    /// queue group (possibly remote), and at most one RMSG per interested
    /// route.
    pub(crate) fn publish_from_client(
        &self,
        account: &Arc<Account>,
        subject: &str,
        reply: Option<&str>,
        payload: &Bytes,
    ) {
        self.stats.msgs_in.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_in
            .fetch_add(payload.len() as u64, Ordering::Relaxed);

        let result = account.match_subject(subject);
        if result.is_empty() {
            return;
        }
        let routes = self.routes_snapshot();
        let mut route_queues: HashMap<ConnectionId, Vec<String>> = HashMap::new();

        for sub in &result.plain {
            match sub.owner_kind {
                ConnKind::Client => self.deliver_to_client_sub(account, sub, subject, reply, payload),
                ConnKind::Route => {
                    route_queues.entry(sub.owner_id).or_default();
                }
            }
        }

        for group in &result.queues {
            match pick_queue_member(&group.members, &routes) {
                Some(QueueTarget::Local(sub)) => {
                    self.deliver_to_client_sub(account, &sub, subject, reply, payload);
                }
                Some(QueueTarget::Route(conn_id)) => {
                    route_queues
                        .entry(conn_id)
                        .or_default()
                        .push(group.name.clone());
                }
                None => {}
            }
        }

        for (conn_id, queues) in route_queues {
            let Some(route) = routes.get(&conn_id) else {
                continue;
            };
            if route.is_closed() {
                continue;
            }
            let frame = plume_proto::encode_rmsg(&account.name, subject, reply, &queues, payload);
            if route.enqueue(frame) {
                self.stats.msgs_out.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_out
                    .fetch_add(payload.len() as u64, Ordering::Relaxed);
            }
        }
    }

    /// Deliver a message that arrived over a route. Local clients only; a
    /// routed message is never written back to any route (single hop).
    pub(crate) fn deliver_route_msg(
        &self,
        account: &Arc<Account>,
        subject: &str,
        reply: Option<&str>,
        queue_names: &[String],
        payload: &Bytes,
    ) {
        self.stats.msgs_in.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_in
            .fetch_add(payload.len() as u64, Ordering::Relaxed);

        let result = account.match_subject(subject);
        for sub in &result.plain {
            if sub.owner_kind == ConnKind::Client {
                self.deliver_to_client_sub(account, sub, subject, reply, payload);
            }
        }
        for name in queue_names {
            let Some(group) = result.queues.iter().find(|group| &group.name == name) else {
                continue;
            };
            let local: Vec<&Arc<Subscription>> = group
                .members
                .iter()
                .filter(|sub| {
                    sub.owner_kind == ConnKind::Client
                        && sub.owner.upgrade().is_some_and(|conn| !conn.is_closed())
                })
                .collect();
            if local.is_empty() {
                continue;
            }
            let pick = rand::thread_rng().gen_range(0..local.len());
            self.deliver_to_client_sub(account, local[pick], subject, reply, payload);
        }
    }

    fn deliver_to_client_sub(
        &self,
        account: &Arc<Account>,
        sub: &Arc<Subscription>,
        subject: &str,
        reply: Option<&str>,
        payload: &Bytes,
    ) {
        let Some(conn) = sub.owner.upgrade() else {
            return;
        };
        if conn.is_closed() {
            return;
        }
        let max = *sub.max_deliveries.lock().expect("max lock");
        let delivered = sub.delivered.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(max) = max
            && delivered > max
        {
            // Past the auto-unsubscribe cap; make sure the entry is gone.
            self.remove_client_sub(account, &conn, sub);
            return;
        }
        let frame = plume_proto::encode_msg(subject, &sub.sid, reply, payload);
        if conn.enqueue(frame) {
            self.stats.msgs_out.fetch_add(1, Ordering::Relaxed);
            self.stats
                .bytes_out
                .fetch_add(payload.len() as u64, Ordering::Relaxed);
        }
        if max == Some(delivered) {
            // Final permitted delivery just went out.
            self.remove_client_sub(account, &conn, sub);
        }
    }

    /// Remove a client subscription from both owner tables atomically with
    /// respect to the account state, then propagate the interest change.
    pub(crate) fn remove_client_sub(
        &self,
        account: &Arc<Account>,
        conn: &Arc<Connection>,
        sub: &Arc<Subscription>,
    ) {
        conn.subs.lock().expect("subs lock").remove(&sub.sid);
        let action = account.remove_client_sub(sub);
        self.broadcast_propagation(&account.name, &action);
    }

    // Lame duck -----------------------------------------------------------

    pub fn is_lame_duck(&self) -> bool {
        self.lame_duck.load(Ordering::Acquire)
    }

    /// Enter lame-duck mode: stop accepting clients, tell existing ones to
    /// migrate, wait out the grace period, then evict evenly over the
    /// configured duration. Routes stay up throughout. Repeat triggers are
    /// no-ops.
    pub fn lame_duck_begin(self: &Arc<Self>) {
        if self.lame_duck.swap(true, Ordering::AcqRel) {
            return;
        }
        // Deliberately untracked: this task is the one that later joins the
        // tracked workers during shutdown.
        let server = Arc::clone(self);
        tokio::spawn(server.run_lame_duck());
    }

    async fn run_lame_duck(self: Arc<Self>) {
        let grace = self.config.lame_duck_grace;
        let duration = self.config.lame_duck_duration;
        tracing::warn!(?grace, ?duration, "entering lame duck mode");

        // Push the updated INFO (lame_duck_mode, own URL removed) so clients
        // can migrate before eviction begins.
        self.broadcast_client_info();
        tokio::time::sleep(grace).await;

        let clients = self.clients_snapshot();
        if !clients.is_empty() {
            let spacing = duration / clients.len() as u32;
            for conn in clients {
                tokio::time::sleep(spacing).await;
                conn.close(CloseReason::ServerShutdown);
            }
        }
        tracing::warn!("lame duck eviction complete, shutting down");
        self.shutdown().await;
    }

    /// Push a fresh INFO to every connected client. Discovery is push-based;
    /// the frame rides each client's ordered outbound queue so it can never
    /// interleave with a partially written MSG.
    pub(crate) fn broadcast_client_info(&self) {
        let frame = plume_proto::encode_info(&self.client_info());
        for conn in self.clients_snapshot() {
            conn.enqueue(frame.clone());
        }
    }

    // Shutdown ------------------------------------------------------------

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Stop listeners, close every connection, and join all workers before
    /// returning.
    pub async fn shutdown(&self) {
        if !self.shutdown_tx.send_replace(true) {
            tracing::info!("server shutting down");
            for conn in self.clients_snapshot() {
                conn.close(CloseReason::ServerShutdown);
            }
            for route in self.routes_snapshot().values() {
                route.close(CloseReason::ServerShutdown);
            }
        }
        // Every caller waits for the workers, so "shutdown returned" always
        // means "all per-connection tasks have terminated".
        if tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, self.workers.wait_idle())
            .await
            .is_err()
        {
            tracing::warn!("shutdown timed out waiting for workers");
        } else {
            tracing::info!("shutdown complete");
        }
    }

    // Stats ---------------------------------------------------------------

    pub fn num_clients(&self) -> usize {
        self.clients.read().expect("clients lock").len()
    }

    pub fn num_routes(&self) -> usize {
        self.routes.read().expect("routes lock").len()
    }

    /// Total subscriptions across all accounts, remote interest included.
    pub fn num_subscriptions(&self) -> usize {
        self.accounts
            .read()
            .expect("accounts lock")
            .values()
            .map(|account| account.sub_count())
            .sum()
    }

    pub fn messages_in(&self) -> u64 {
        self.stats.msgs_in.load(Ordering::Relaxed)
    }

    pub fn messages_out(&self) -> u64 {
        self.stats.msgs_out.load(Ordering::Relaxed)
    }

    pub fn bytes_in(&self) -> u64 {
        self.stats.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.stats.bytes_out.load(Ordering::Relaxed)
    }

    pub fn slow_consumers(&self) -> u64 {
        self.stats.slow_consumers.load(Ordering::Relaxed)
    }

    pub fn close_reason_counts(&self) -> HashMap<CloseReason, u64> {
        self.close_reasons.lock().expect("reasons lock").clone()
    }
}

enum QueueTarget {
    Local(Arc<Subscription>),
    Route(ConnectionId),
}

/// Choose one recipient for a queue group: one slot per live local member,
/// `weight` slots per advertising route, a uniformly random walk start, and
/// forward wrap past unavailable slots. Locals are pre-filtered live, so a
/// walk that skips dead remotes always ends at a local slot if one exists.
fn pick_queue_member(
    members: &[Arc<Subscription>],
    routes: &HashMap<ConnectionId, Arc<Connection>>,
) -> Option<QueueTarget> {
    let mut slots: Vec<QueueTarget> = Vec::with_capacity(members.len());
    for sub in members {
        match sub.owner_kind {
            ConnKind::Client => {
                if sub.owner.upgrade().is_some_and(|conn| !conn.is_closed()) {
                    slots.push(QueueTarget::Local(Arc::clone(sub)));
                }
            }
            ConnKind::Route => {
                let weight = sub.queue_weight.load(Ordering::Relaxed).max(1);
                for _ in 0..weight {
                    slots.push(QueueTarget::Route(sub.owner_id));
                }
            }
        }
    }
    if slots.is_empty() {
        return None;
    }
    let start = rand::thread_rng().gen_range(0..slots.len());
    for offset in 0..slots.len() {
        match &slots[(start + offset) % slots.len()] {
            QueueTarget::Local(sub) => return Some(QueueTarget::Local(Arc::clone(sub))),
            QueueTarget::Route(conn_id) => {
                if routes.get(conn_id).is_some_and(|route| !route.is_closed()) {
                    return Some(QueueTarget::Route(*conn_id));
                }
            }
        }
    }
    None
}
