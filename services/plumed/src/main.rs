// plumed entry point: CLI flags, logging, signal handling.
use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use plumed::{Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "plumed")]
#[command(version, about = "Clustered subject-based pub/sub server")]
struct Args {
    /// Client listener address
    #[arg(long, default_value = "0.0.0.0:4322")]
    addr: SocketAddr,

    /// Route listener address; enables clustering
    #[arg(long)]
    cluster: Option<SocketAddr>,

    /// Explicit cluster name (ephemeral when omitted)
    #[arg(long = "cluster-name")]
    cluster_name: Option<String>,

    /// Seed routes to dial, comma separated
    #[arg(long, value_delimiter = ',')]
    routes: Vec<String>,

    /// Server name carried in INFO
    #[arg(long = "server-name")]
    server_name: Option<String>,

    /// Require this token in client CONNECT
    #[arg(long = "auth-token")]
    auth_token: Option<String>,

    /// Maximum message payload in bytes
    #[arg(long = "max-payload", default_value_t = 1024 * 1024)]
    max_payload: usize,

    /// Maximum concurrent client connections
    #[arg(long = "max-connections", default_value_t = 65_536)]
    max_connections: usize,

    /// Maximum control line length in bytes
    #[arg(long = "max-control-line", default_value_t = 4096)]
    max_control_line: usize,

    /// Maximum subscriptions per connection (0 = unlimited)
    #[arg(long = "max-subscriptions", default_value_t = 0)]
    max_subscriptions: usize,

    /// Pending-out byte cap before a connection is a slow consumer
    #[arg(long = "max-pending", default_value_t = 32 * 1024 * 1024)]
    max_pending: usize,

    /// Keepalive ping interval
    #[arg(long = "ping-interval", value_parser = humantime::parse_duration, default_value = "2m")]
    ping_interval: Duration,

    /// Unanswered pings tolerated before a connection is stale
    #[arg(long = "ping-max", default_value_t = 2)]
    ping_max: u32,

    /// Per-write deadline on every connection
    #[arg(long = "write-deadline", value_parser = humantime::parse_duration, default_value = "10s")]
    write_deadline: Duration,

    /// Window over which lame-duck mode spreads client evictions
    #[arg(long = "lame-duck-duration", value_parser = humantime::parse_duration, default_value = "2m")]
    lame_duck_duration: Duration,

    /// Migration grace before lame-duck evictions start
    #[arg(long = "lame-duck-grace", value_parser = humantime::parse_duration, default_value = "10s")]
    lame_duck_grace: Duration,

    /// How long an empty account lingers before removal
    #[arg(long = "account-grace", value_parser = humantime::parse_duration, default_value = "1m")]
    account_grace: Duration,

    /// Report route dial failures on attempt 1 and every Nth after
    #[arg(long = "route-report-attempts", default_value_t = 3)]
    route_report_attempts: u64,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            addr: args.addr,
            cluster_addr: args.cluster,
            cluster_name: args.cluster_name,
            routes: args.routes,
            server_name: args.server_name,
            auth_token: args.auth_token,
            max_payload: args.max_payload,
            max_control_line: args.max_control_line,
            max_connections: args.max_connections,
            max_subscriptions: args.max_subscriptions,
            max_pending: args.max_pending,
            ping_interval: args.ping_interval,
            ping_max: args.ping_max,
            write_deadline: args.write_deadline,
            lame_duck_duration: args.lame_duck_duration,
            lame_duck_grace: args.lame_duck_grace,
            account_grace: args.account_grace,
            route_report_attempts: args.route_report_attempts,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // RUST_LOG overrides the default level at runtime.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let server = match Server::new(args.into()) {
        Ok(server) => server,
        Err(err) => {
            tracing::error!(error = %err, "invalid configuration");
            return ExitCode::from(1);
        }
    };
    if let Err(err) = server.start().await {
        tracing::error!(error = %err, "startup failed");
        return ExitCode::from(2);
    }

    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(signal) => signal,
        Err(err) => {
            tracing::error!(error = %err, "install SIGTERM handler");
            return ExitCode::from(2);
        }
    };
    let mut sigusr2 = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined2())
    {
        Ok(signal) => signal,
        Err(err) => {
            tracing::error!(error = %err, "install SIGUSR2 handler");
            return ExitCode::from(2);
        }
    };
    let mut stopping = server.shutdown_signal();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                server.shutdown().await;
                break;
            }
            _ = sigterm.recv() => {
                server.shutdown().await;
                break;
            }
            // SIGUSR2 starts lame-duck draining; shutdown follows on its own
            // once the last client is evicted.
            _ = sigusr2.recv() => server.lame_duck_begin(),
            changed = stopping.changed() => {
                if changed.is_err() || *stopping.borrow() {
                    server.shutdown().await;
                    break;
                }
            }
        }
    }
    ExitCode::SUCCESS
}
