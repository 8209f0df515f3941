// Client connections: accept loop, protocol state machine, verb dispatch.
//
// Each accepted socket gets one reader (this module) and one writer task.
// The state machine is INIT -> AWAIT_CONNECT -> ACTIVE -> DRAINING -> CLOSED;
// INFO goes out immediately on accept and CONNECT must be the first verb the
// client sends other than PING/PONG.
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, tcp::OwnedReadHalf};

use plume_proto::{Command, ConnectOptions, Parser};
use plume_subject::validate_literal;

use crate::account::{Account, DEFAULT_ACCOUNT};
use crate::connection::{
    CloseReason, ConnKind, ConnState, Connection, run_writer,
};
use crate::server::Server;

pub(crate) async fn serve_clients(server: Arc<Server>, listener: TcpListener) {
    let mut shutdown = server.shutdown_signal();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let task_server = Arc::clone(&server);
                        server.spawn_worker(async move {
                            handle_client(task_server, stream, peer).await;
                        });
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "client accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }
    }
}

async fn handle_client(server: Arc<Server>, stream: TcpStream, peer: SocketAddr) {
    let _ = stream.set_nodelay(true);
    let id = server.next_conn_id();
    let (read_half, write_half) = stream.into_split();
    let (conn, writer_handles) =
        Connection::new(id, ConnKind::Client, peer, server.config.max_pending, None);
    {
        let conn = Arc::clone(&conn);
        let deadline = server.config.write_deadline;
        server.spawn_worker(async move {
            run_writer(conn, write_half, writer_handles, deadline).await;
        });
    }

    if server.is_lame_duck() {
        conn.close_with_err(plume_proto::ERR_LAME_DUCK, CloseReason::ServerShutdown);
        return;
    }
    if server.num_clients() >= server.config.max_connections {
        conn.close_with_err(plume_proto::ERR_MAX_CONNS, CloseReason::MaxConnections);
        return;
    }

    server.register_client(&conn);
    conn.enqueue(plume_proto::encode_info(&server.client_info()));
    tracing::debug!(conn = id, peer = %peer, "client connected");

    let mut session = ClientSession {
        server: Arc::clone(&server),
        conn: Arc::clone(&conn),
        account: None,
    };
    run_read_loop(&server, &conn, read_half, &mut session).await;
    session.teardown();
}

async fn run_read_loop(
    server: &Arc<Server>,
    conn: &Arc<Connection>,
    mut socket: OwnedReadHalf,
    session: &mut ClientSession,
) {
    let mut parser = Parser::new(server.config.max_control_line, server.config.max_payload);
    let mut stop = conn.stopped();
    let ping_every = server.config.ping_interval;
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_every, ping_every);
    let mut buf = vec![0u8; 16 * 1024];

    'outer: loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = ping.tick() => {
                let outstanding = conn.outstanding_pings.fetch_add(1, Ordering::AcqRel) + 1;
                if outstanding > server.config.ping_max {
                    conn.close_with_err(
                        plume_proto::ERR_STALE_CONNECTION,
                        CloseReason::StaleConnection,
                    );
                    break;
                }
                conn.enqueue(Bytes::from_static(plume_proto::PING_LINE));
            }
            read = socket.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        conn.close(CloseReason::ClientClosed);
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
                            tracing::debug!(conn = conn.id, error = %err, "client protocol error");
                            let reason = match &err {
                                plume_proto::Error::MaxPayloadExceeded { .. } => {
                                    CloseReason::MaxPayload
                                }
                                _ => CloseReason::ProtocolError,
                            };
                            conn.close_with_err(err.reason(), reason);
                            break;
                        }
                    },
                    Err(err) => {
                        tracing::debug!(conn = conn.id, error = %err, "client read failed");
                        conn.close(CloseReason::ClientClosed);
                        break;
                    }
                }
            }
        }
    }
}

struct ClientSession {
    server: Arc<Server>,
    conn: Arc<Connection>,
    account: Option<Arc<Account>>,
}

impl ClientSession {
    /// Handle one parsed command. Returns false when the connection is done.
    fn dispatch(&mut self, command: Command) -> bool {
        match command {
            // Keepalive works in every state, CONNECT included.
            Command::Ping => {
                self.conn.enqueue(Bytes::from_static(plume_proto::PONG_LINE));
                true
            }
            Command::Pong => {
                self.conn.outstanding_pings.store(0, Ordering::Release);
                true
            }
            Command::Connect(options) => self.on_connect(options),
            _ if self.conn.state() == ConnState::AwaitConnect => {
                self.conn
                    .close_with_err(plume_proto::ERR_CONNECT_REQUIRED, CloseReason::ProtocolError);
                false
            }
            Command::Sub {
                subject,
                queue,
                sid,
            } => self.on_sub(subject, queue, sid),
            Command::Unsub { sid, max } => self.on_unsub(&sid, max),
            Command::Pub {
                subject,
                reply,
                payload,
            } => self.on_pub(&subject, reply.as_deref(), payload),
            // Harmless acknowledgements from chatty clients.
            Command::Ok => true,
            Command::Err(message) => {
                tracing::debug!(conn = self.conn.id, %message, "client sent error");
                true
            }
            // Route-side verbs have no business on a client connection.
            Command::Info(_)
            | Command::Msg { .. }
            | Command::RouteSub { .. }
            | Command::RouteUnsub { .. }
            | Command::RouteMsg { .. } => {
                self.conn
                    .close_with_err(plume_proto::ERR_UNKNOWN_OP, CloseReason::ProtocolError);
                false
            }
        }
    }

    fn on_connect(&mut self, options: ConnectOptions) -> bool {
        if self.conn.state() != ConnState::AwaitConnect {
            self.conn
                .close_with_err(plume_proto::ERR_DUPLICATE_CONNECT, CloseReason::ProtocolError);
            return false;
        }
        if let Some(required) = &self.server.config.auth_token
            && options.auth_token.as_deref() != Some(required.as_str())
        {
            self.conn
                .close_with_err(plume_proto::ERR_AUTH, CloseReason::AuthViolation);
            return false;
        }
        self.conn.verbose.store(options.verbose, Ordering::Release);
        let account_name = options.account.as_deref().unwrap_or(DEFAULT_ACCOUNT);
        let account = self.server.account(account_name);
        account.add_client(self.conn.id);
        self.account = Some(account);
        self.conn.set_state(ConnState::Active);
        self.ack();
        true
    }

    fn on_sub(&mut self, subject: String, queue: Option<String>, sid: String) -> bool {
        let account = Arc::clone(self.account.as_ref().expect("active session"));
        let cap = self.server.config.max_subscriptions;
        if cap > 0 && self.conn.subs.lock().expect("subs lock").len() >= cap {
            self.conn
                .close_with_err(plume_proto::ERR_MAX_SUBS, CloseReason::MaxSubscriptions);
            return false;
        }
        if self.conn.subs.lock().expect("subs lock").contains_key(&sid) {
            self.conn.send_err(plume_proto::ERR_INVALID_SID);
            return true;
        }
        let sub = crate::connection::Subscription::new(
            self.server.next_sub_key(),
            sid.clone(),
            subject,
            queue,
            account.name.clone(),
            &self.conn,
        );
        match account.insert_client_sub(Arc::clone(&sub), self.server.rsid_counter()) {
            Ok(action) => {
                self.conn.subs.lock().expect("subs lock").insert(sid, sub);
                self.server.broadcast_propagation(&account.name, &action);
                self.ack();
                true
            }
            Err(err) => {
                tracing::debug!(conn = self.conn.id, error = %err, "rejected subscription");
                self.conn.send_err(plume_proto::ERR_INVALID_SUBJECT);
                true
            }
        }
    }

    fn on_unsub(&mut self, sid: &str, max: Option<u64>) -> bool {
        let account = Arc::clone(self.account.as_ref().expect("active session"));
        let sub = self.conn.subs.lock().expect("subs lock").get(sid).cloned();
        // Unknown sids are ignored; UNSUB is idempotent.
        let Some(sub) = sub else {
            self.ack();
            return true;
        };
        match max {
            None => self.server.remove_client_sub(&account, &self.conn, &sub),
            Some(max) => {
                if sub.delivered.load(Ordering::Acquire) >= max {
                    self.server.remove_client_sub(&account, &self.conn, &sub);
                } else {
                    // Keep delivering until the cap is reached, then drop.
                    *sub.max_deliveries.lock().expect("max lock") = Some(max);
                }
            }
        }
        self.ack();
        true
    }

    fn on_pub(&mut self, subject: &str, reply: Option<&str>, payload: Bytes) -> bool {
        let account = Arc::clone(self.account.as_ref().expect("active session"));
        if validate_literal(subject).is_err() {
            self.conn.send_err(plume_proto::ERR_INVALID_SUBJECT);
            return true;
        }
        if let Some(reply) = reply
            && validate_literal(reply).is_err()
        {
            self.conn.send_err(plume_proto::ERR_INVALID_SUBJECT);
            return true;
        }
        self.server
            .publish_from_client(&account, subject, reply, &payload);
        self.ack();
        true
    }

    /// `+OK` when the client asked for verbose acknowledgements.
    fn ack(&self) {
        if self.conn.verbose.load(Ordering::Acquire) {
            self.conn.enqueue(Bytes::from_static(plume_proto::OK_LINE));
        }
    }

    /// Unwind everything this connection owned: registry entry, account
    /// membership, and every subscription (with interest withdrawal to the
    /// cluster where refcounts hit zero).
    fn teardown(&mut self) {
        self.conn.close(CloseReason::ClientClosed);
        self.server.unregister_client(&self.conn);
        if let Some(account) = self.account.take() {
            account.remove_client(self.conn.id);
            let subs: Vec<_> = {
                let mut subs = self.conn.subs.lock().expect("subs lock");
                subs.drain().map(|(_, sub)| sub).collect()
            };
            for sub in subs {
                let action = account.remove_client_sub(&sub);
                self.server.broadcast_propagation(&account.name, &action);
            }
        }
        tracing::debug!(
            conn = self.conn.id,
            reason = self.conn.close_reason().map(|r| r.as_str()).unwrap_or("unknown"),
            "client disconnected"
        );
    }
}
