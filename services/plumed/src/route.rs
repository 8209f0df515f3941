// Route connections: the server-to-server leg of the cluster.
//
// The first frame in both directions is INFO. Cluster names are negotiated
// there: two explicit names that differ reject the route, an ephemeral name
// adopts the peer's. After registration the peer's coalesced interest
// arrives as RS+/RS- and is indexed as synthetic subscriptions owned by this
// connection; RMSG fans into local clients only and is never re-forwarded.
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, tcp::OwnedReadHalf};

use plume_proto::{Command, Parser, ServerInfo};
use plume_subject::validate_literal;

use crate::config::parse_route_url;
use crate::connection::{
    CloseReason, ConnKind, Connection, RouteContext, Subscription, run_writer,
};
use crate::server::{PeerEntry, Server};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RouteOutcome {
    /// The route ended; the dialer should reconnect.
    Closed,
    /// The peer was refused (name mismatch, duplicate); do not redial.
    Rejected,
}

pub(crate) async fn run_route(
    server: Arc<Server>,
    stream: TcpStream,
    peer: SocketAddr,
    dialed: Option<SocketAddr>,
) -> RouteOutcome {
    let _ = stream.set_nodelay(true);
    let id = server.next_conn_id();
    let (read_half, write_half) = stream.into_split();
    let context = RouteContext {
        dialed_url: dialed.map(|addr| addr.to_string()),
        ..Default::default()
    };
    let (conn, writer_handles) = Connection::new(
        id,
        ConnKind::Route,
        peer,
        server.config.max_pending,
        Some(context),
    );
    {
        let conn = Arc::clone(&conn);
        let deadline = server.config.write_deadline;
        server.spawn_worker(async move {
            run_writer(conn, write_half, writer_handles, deadline).await;
        });
    }

    // Both sides lead with INFO; nothing else is valid before it.
    conn.enqueue(plume_proto::encode_info(&server.route_info()));

    let mut session = RouteSession {
        server: Arc::clone(&server),
        conn: Arc::clone(&conn),
        registered: false,
        outcome: RouteOutcome::Closed,
    };
    run_read_loop(&server, &conn, read_half, &mut session).await;
    session.teardown();
    session.outcome
}

async fn run_read_loop(
    server: &Arc<Server>,
    conn: &Arc<Connection>,
    mut socket: OwnedReadHalf,
    session: &mut RouteSession,
) {
    let mut parser = Parser::new(server.config.max_control_line, server.config.max_payload);
    let mut stop = conn.stopped();
    let ping_every = server.config.ping_interval;
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_every, ping_every);
    let mut buf = vec![0u8; 32 * 1024];

    'outer: loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = ping.tick() => {
                let outstanding = conn.outstanding_pings.fetch_add(1, Ordering::AcqRel) + 1;
                if outstanding > server.config.ping_max {
                    tracing::warn!(conn = conn.id, "route went stale");
                    conn.close_now(CloseReason::StaleConnection);
                    break;
                }
                conn.enqueue(Bytes::from_static(plume_proto::PING_LINE));
            }
            read = socket.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        conn.close(CloseReason::RouteClosed);
                        break;
                    }
                    Ok(n) => match parser.feed(&buf[..n]) {
                        Ok(commands) => {
                            for command in commands {
                                if !session.dispatch(command) {
                                    break 'outer;
                                }
                            }
                        }
                        Err(err) => {
                            tracing::error!(conn = conn.id, error = %err, "route protocol error");
                            conn.close_with_err(err.reason(), CloseReason::ProtocolError);
                            break;
                        }
                    },
                    Err(err) => {
                        tracing::debug!(conn = conn.id, error = %err, "route read failed");
                        conn.close(CloseReason::RouteClosed);
                        break;
                    }
                }
            }
        }
    }
}

struct RouteSession {
    server: Arc<Server>,
    conn: Arc<Connection>,
    registered: bool,
    outcome: RouteOutcome,
}

impl RouteSession {
    fn dispatch(&mut self, command: Command) -> bool {
        match command {
            Command::Ping => {
                self.conn.enqueue(Bytes::from_static(plume_proto::PONG_LINE));
                true
            }
            Command::Pong => {
                self.conn.outstanding_pings.store(0, Ordering::Release);
                true
            }
            Command::Info(info) => self.on_info(info),
            _ if !self.registered => {
                // Interest or messages before the INFO exchange finished.
                self.conn
                    .close_with_err(plume_proto::ERR_UNKNOWN_OP, CloseReason::ProtocolError);
                false
            }
            Command::RouteSub {
                account,
                subject,
                queue,
                weight,
                rsid,
            } => self.on_remote_sub(account, subject, queue, weight, rsid),
            Command::RouteUnsub { rsid, .. } => self.on_remote_unsub(&rsid),
            Command::RouteMsg {
                account,
                subject,
                reply,
                queues,
                payload,
            } => self.on_route_msg(&account, &subject, reply.as_deref(), &queues, payload),
            Command::Ok => true,
            Command::Err(message) => {
                tracing::warn!(conn = self.conn.id, %message, "route peer reported error");
                true
            }
            Command::Connect(_)
            | Command::Sub { .. }
            | Command::Unsub { .. }
            | Command::Pub { .. }
            | Command::Msg { .. } => {
                self.conn
                    .close_with_err(plume_proto::ERR_UNKNOWN_OP, CloseReason::ProtocolError);
                false
            }
        }
    }

    fn on_info(&mut self, info: ServerInfo) -> bool {
        if self.registered {
            // Topology refresh from an established peer.
            self.dial_discovered(&info);
            return true;
        }
        let ours = self.server.cluster_name();
        let ours_dynamic = !self.server.cluster_name_is_explicit();
        if info.cluster != ours {
            match (ours_dynamic, info.cluster_dynamic) {
                (false, false) => {
                    tracing::error!(
                        peer = %self.conn.peer_addr,
                        remote_cluster = %info.cluster,
                        local_cluster = %ours,
                        "Rejecting connection: cluster name {:?} does not match {:?}",
                        info.cluster,
                        ours,
                    );
                    self.conn.close_now(CloseReason::ClusterNameMismatch);
                    self.outcome = RouteOutcome::Rejected;
                    return false;
                }
                (true, false) => {
                    self.server.adopt_cluster_name(&info.cluster);
                    self.server.broadcast_client_info();
                }
                (false, true) => {
                    // The peer adopts our explicit name.
                }
                (true, true) => {
                    // Both ephemeral: everyone converges on the smaller name.
                    if info.cluster < ours {
                        self.server.adopt_cluster_name(&info.cluster);
                        self.server.broadcast_client_info();
                    }
                }
            }
        }

        let client_url = if info.host.is_empty() {
            String::new()
        } else {
            format!("{}:{}", info.host, info.port)
        };
        let entry = PeerEntry {
            conn_id: self.conn.id,
            client_url,
            route_url: info.route_url.clone(),
        };
        if !self.server.add_peer(&info.server_id, entry) {
            tracing::debug!(
                conn = self.conn.id,
                peer_server = %info.server_id,
                "dropping duplicate route"
            );
            self.conn.close_now(CloseReason::DuplicateRoute);
            self.outcome = RouteOutcome::Rejected;
            return false;
        }

        if let Some(route) = &self.conn.route {
            *route.remote_server_id.lock().expect("peer lock") = Some(info.server_id.clone());
            *route.remote_cluster.lock().expect("peer lock") = Some(info.cluster.clone());
        }
        self.server.register_route(&self.conn);
        self.registered = true;
        tracing::info!(
            conn = self.conn.id,
            peer = %self.conn.peer_addr,
            peer_server = %info.server_id,
            cluster = %self.server.cluster_name(),
            "route established"
        );

        // Replay our coalesced interest, tell clients about the new
        // topology, and chase any peers we have not met yet.
        self.server.replay_interest(&self.conn);
        self.server.broadcast_client_info();
        self.dial_discovered(&info);
        true
    }

    fn dial_discovered(&self, info: &ServerInfo) {
        for url in &info.route_urls {
            match parse_route_url(url) {
                Ok(addr) => self.server.dial_route(addr),
                Err(err) => {
                    tracing::debug!(url = %url, error = %err, "ignoring bad discovered route")
                }
            }
        }
    }

    fn on_remote_sub(
        &mut self,
        account_name: String,
        subject: String,
        queue: Option<String>,
        weight: u32,
        rsid: String,
    ) -> bool {
        let route = self.conn.route.as_ref().expect("route context");
        let account = self.server.account(&account_name);
        {
            let rsids = route.rsid_to_sub.lock().expect("rsid lock");
            if let Some((_, existing)) = rsids.get(&rsid) {
                // Replay or weight refresh for interest we already hold.
                existing.queue_weight.store(weight, Ordering::Release);
                return true;
            }
        }
        let sub = Subscription::new(
            self.server.next_sub_key(),
            rsid.clone(),
            subject,
            queue,
            account_name,
            &self.conn,
        );
        sub.queue_weight.store(weight, Ordering::Release);
        match account.insert_route_sub(Arc::clone(&sub)) {
            Ok(()) => {
                route
                    .rsid_to_sub
                    .lock()
                    .expect("rsid lock")
                    .insert(rsid, (account, sub));
                true
            }
            Err(err) => {
                tracing::error!(conn = self.conn.id, error = %err, "bad remote subscription");
                self.conn
                    .close_with_err(plume_proto::ERR_INVALID_SUBJECT, CloseReason::ProtocolError);
                false
            }
        }
    }

    fn on_remote_unsub(&mut self, rsid: &str) -> bool {
        let route = self.conn.route.as_ref().expect("route context");
        let removed = route.rsid_to_sub.lock().expect("rsid lock").remove(rsid);
        if let Some((account, sub)) = removed {
            account.remove_route_sub(&sub);
        }
        true
    }

    fn on_route_msg(
        &mut self,
        account_name: &str,
        subject: &str,
        reply: Option<&str>,
        queues: &[String],
        payload: Bytes,
    ) -> bool {
        if validate_literal(subject).is_err() {
            tracing::error!(conn = self.conn.id, subject, "bad subject in route message");
            self.conn
                .close_with_err(plume_proto::ERR_INVALID_SUBJECT, CloseReason::ProtocolError);
            return false;
        }
        let account = self.server.account(account_name);
        // Cheap negative probe before walking the full match.
        if !account.has_interest(subject) {
            return true;
        }
        self.server
            .deliver_route_msg(&account, subject, reply, queues, &payload);
        true
    }

    /// Drop everything the peer advertised through this route.
    fn teardown(&mut self) {
        self.conn.close(CloseReason::RouteClosed);
        self.server.unregister_route(&self.conn);
        self.server.remove_peer_by_conn(self.conn.id);
        if let Some(route) = &self.conn.route {
            let purged: Vec<_> = {
                let mut rsids = route.rsid_to_sub.lock().expect("rsid lock");
                rsids.drain().map(|(_, entry)| entry).collect()
            };
            for (account, sub) in purged {
                account.remove_route_sub(&sub);
            }
        }
        if self.registered {
            // Topology shrank; let clients refresh their URL list.
            self.server.broadcast_client_info();
            tracing::info!(conn = self.conn.id, peer = %self.conn.peer_addr, "route closed");
        }
    }
}
