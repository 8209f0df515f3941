// Cluster manager: route listener and the reconnecting dialers.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use crate::route::{self, RouteOutcome};
use crate::server::Server;

const DIAL_BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const DIAL_BACKOFF_MAX: Duration = Duration::from_secs(2);

pub(crate) async fn serve_routes(server: Arc<Server>, listener: TcpListener) {
    let mut shutdown = server.shutdown_signal();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let task_server = Arc::clone(&server);
                        server.spawn_worker(async move {
                            route::run_route(task_server, stream, peer, None).await;
                        });
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "route accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }
    }
}

/// Keep one route to `addr` alive: dial, run, and redial with exponential
/// backoff. Dial failures are logged on attempt 1 and every
/// `route_report_attempts`th attempt so a down peer does not flood the log.
pub(crate) async fn maintain_route(server: Arc<Server>, addr: SocketAddr) {
    let mut shutdown = server.shutdown_signal();
    let mut attempt: u64 = 0;
    let mut backoff = DIAL_BACKOFF_INITIAL;
    loop {
        if server.is_shutting_down() {
            break;
        }
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                attempt = 0;
                backoff = DIAL_BACKOFF_INITIAL;
                let peer = stream.peer_addr().unwrap_or(addr);
                let outcome =
                    route::run_route(Arc::clone(&server), stream, peer, Some(addr)).await;
                if outcome == RouteOutcome::Rejected {
                    tracing::debug!(addr = %addr, "route refused, not redialing");
                    break;
                }
            }
            Err(err) => {
                attempt += 1;
                if should_report(attempt, server.config.route_report_attempts) {
                    tracing::error!(
                        addr = %addr,
                        attempt,
                        error = %err,
                        "route dial failed"
                    );
                }
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => break,
        }
        backoff = (backoff * 2).min(DIAL_BACKOFF_MAX);
    }
    server.stop_dialing(addr);
}

/// Attempts 1, N, 2N, 3N, ... get reported; the rest are suppressed.
pub(crate) fn should_report(attempt: u64, every: u64) -> bool {
    attempt == 1 || (every > 0 && attempt % every == 0)
}
