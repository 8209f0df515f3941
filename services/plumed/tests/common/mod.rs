// Shared fixtures for protocol-level integration tests: server spawning and
// a raw TCP test client that speaks the wire protocol.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use plume_proto::{Command, ConnectOptions, Parser, ServerInfo};
use plumed::{Server, ServerConfig};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Config suitable for tests: ephemeral ports, clustering enabled, timers
/// long enough to stay out of the way.
pub fn base_config() -> ServerConfig {
    ServerConfig {
        addr: "127.0.0.1:0".parse().expect("addr"),
        cluster_addr: Some("127.0.0.1:0".parse().expect("addr")),
        ping_interval: Duration::from_secs(60),
        account_grace: Duration::from_secs(60),
        ..ServerConfig::default()
    }
}

pub async fn start_server(config: ServerConfig) -> Result<Arc<Server>> {
    let server = Server::new(config).context("build server")?;
    server.start().await.context("start server")?;
    Ok(server)
}

/// Two servers joined by one route, fully established.
pub async fn start_pair() -> Result<(Arc<Server>, Arc<Server>)> {
    let srv_a = start_server(base_config()).await?;
    let mut config_b = base_config();
    config_b.routes = vec![
        srv_a
            .route_addr()
            .context("server A route addr")?
            .to_string(),
    ];
    let srv_b = start_server(config_b).await?;
    let (a, b) = (Arc::clone(&srv_a), Arc::clone(&srv_b));
    wait_until("route to form", Duration::from_secs(5), move || {
        a.num_routes() == 1 && b.num_routes() == 1
    })
    .await?;
    Ok((srv_a, srv_b))
}

/// Poll `cond` until it holds or the deadline passes.
pub async fn wait_until<F>(what: &str, limit: Duration, cond: F) -> Result<()>
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("timed out waiting for {what}")
}

/// Minimal protocol client for scripting send/expect test sessions.
pub struct TestClient {
    stream: TcpStream,
    parser: Parser,
    pending: VecDeque<Command>,
    stashed: VecDeque<Command>,
}

impl TestClient {
    /// Open a socket and read the greeting INFO.
    pub async fn connect(addr: SocketAddr) -> Result<(Self, ServerInfo)> {
        let stream = TcpStream::connect(addr).await.context("connect")?;
        stream.set_nodelay(true).ok();
        let mut client = Self {
            stream,
            parser: Parser::default(),
            pending: VecDeque::new(),
            stashed: VecDeque::new(),
        };
        match client.next_command().await? {
            Command::Info(info) => Ok((client, info)),
            other => bail!("expected INFO greeting, got {other:?}"),
        }
    }

    /// Connect and complete the CONNECT handshake with default options.
    pub async fn connect_ready(addr: SocketAddr) -> Result<Self> {
        let (mut client, _info) = Self::connect(addr).await?;
        client
            .send_raw(&plume_proto::encode_connect(&ConnectOptions {
                protocol: 1,
                ..ConnectOptions::default()
            }))
            .await?;
        client.flush().await?;
        Ok(client)
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await.context("send")
    }

    /// Send one CRLF-terminated control line.
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        let mut framed = line.as_bytes().to_vec();
        framed.extend_from_slice(b"\r\n");
        self.send_raw(&framed).await
    }

    pub async fn publish(&mut self, subject: &str, payload: &[u8]) -> Result<()> {
        let frame = plume_proto::encode_pub(subject, None, payload);
        self.send_raw(&frame).await
    }

    /// Next inbound command, in arrival order.
    pub async fn next_command(&mut self) -> Result<Command> {
        loop {
            if let Some(command) = self.stashed.pop_front() {
                return Ok(command);
            }
            if let Some(command) = self.pending.pop_front() {
                return Ok(command);
            }
            let mut buf = [0u8; 16 * 1024];
            let n = timeout(RECV_TIMEOUT, self.stream.read(&mut buf))
                .await
                .context("read timeout")?
                .context("read")?;
            if n == 0 {
                bail!("connection closed by server");
            }
            self.pending.extend(self.parser.feed(&buf[..n])?);
        }
    }

    /// PING and wait for the matching PONG, keeping any frames that arrive
    /// first for later expectations.
    pub async fn flush(&mut self) -> Result<()> {
        self.send_raw(plume_proto::PING_LINE).await?;
        loop {
            match self.next_command().await? {
                Command::Pong => return Ok(()),
                Command::Err(message) => bail!("server error during flush: {message}"),
                other => self.stashed.push_back(other),
            }
        }
    }

    /// Next MSG frame; answers server pings and skips acks along the way.
    pub async fn expect_msg(&mut self) -> Result<(String, String, Option<String>, Bytes)> {
        loop {
            match self.next_command().await? {
                Command::Msg {
                    subject,
                    sid,
                    reply,
                    payload,
                } => return Ok((subject, sid, reply, payload)),
                Command::Ping => self.send_raw(plume_proto::PONG_LINE).await?,
                Command::Ok | Command::Pong | Command::Info(_) => {}
                other => bail!("expected MSG, got {other:?}"),
            }
        }
    }

    /// Collect exactly `n` MSG frames.
    pub async fn expect_msgs(&mut self, n: usize) -> Result<Vec<(String, String, Bytes)>> {
        let mut messages = Vec::with_capacity(n);
        for _ in 0..n {
            let (subject, sid, _reply, payload) = self.expect_msg().await?;
            messages.push((subject, sid, payload));
        }
        Ok(messages)
    }

    /// Assert nothing (beyond housekeeping frames) arrives within `window`.
    pub async fn expect_silence(&mut self, window: Duration) -> Result<()> {
        let outcome = timeout(window, self.next_command()).await;
        match outcome {
            Err(_) => Ok(()),
            Ok(Ok(Command::Ping)) => Ok(()),
            Ok(Ok(Command::Info(_))) => Ok(()),
            Ok(Ok(other)) => bail!("expected silence, got {other:?}"),
            Ok(Err(err)) => Err(err),
        }
    }

    /// Next -ERR line.
    pub async fn expect_err(&mut self) -> Result<String> {
        loop {
            match self.next_command().await? {
                Command::Err(message) => return Ok(message),
                Command::Ping | Command::Pong | Command::Ok | Command::Info(_) => {}
                other => bail!("expected -ERR, got {other:?}"),
            }
        }
    }

    /// Wait for the server to drop the connection.
    pub async fn expect_closed(&mut self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                bail!("connection still open");
            }
            match timeout(remaining, self.next_command()).await {
                Err(_) => bail!("connection still open"),
                Ok(Err(_)) => return Ok(()),
                // Drain whatever the server flushed before the FIN.
                Ok(Ok(_)) => {}
            }
        }
    }
}
