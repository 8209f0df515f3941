// Lame-duck mode: graceful drain of clients without breaking the cluster.
mod common;

use std::time::Duration;

use anyhow::Result;
use common::{TestClient, base_config, start_server, wait_until};
use plume_proto::Command;
use plumed::connection::CloseReason;
use plumed::{Server, ServerConfig};
use serial_test::serial;

#[tokio::test]
async fn grace_must_be_less_than_duration() {
    let mut config = ServerConfig::default();
    config.lame_duck_duration = Duration::from_secs(5);
    config.lame_duck_grace = Duration::from_secs(10);
    assert!(Server::new(config).is_err());
}

#[tokio::test]
#[serial]
async fn eviction_spreads_clients_over_the_duration() -> Result<()> {
    let mut config = base_config();
    config.cluster_addr = None;
    config.lame_duck_duration = Duration::from_millis(300);
    config.lame_duck_grace = Duration::ZERO;
    let server = start_server(config).await?;
    let addr = server.client_addr().expect("bound");

    let mut clients = Vec::new();
    for _ in 0..10 {
        clients.push(TestClient::connect_ready(addr).await?);
    }
    assert_eq!(server.num_clients(), 10);

    let started = tokio::time::Instant::now();
    server.lame_duck_begin();
    // Triggering twice is a no-op.
    server.lame_duck_begin();

    {
        let server = std::sync::Arc::clone(&server);
        wait_until("all clients evicted", Duration::from_secs(5), move || {
            server.num_clients() == 0
        })
        .await?;
    }
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(300),
        "eviction finished too quickly: {elapsed:?}"
    );

    let reasons = server.close_reason_counts();
    assert_eq!(reasons.get(&CloseReason::ServerShutdown), Some(&10));
    assert_eq!(reasons.len(), 1, "unexpected close reasons: {reasons:?}");
    Ok(())
}

#[tokio::test]
#[serial]
async fn no_client_is_evicted_during_the_grace_window() -> Result<()> {
    let mut config = base_config();
    config.cluster_addr = None;
    config.lame_duck_duration = Duration::from_millis(600);
    config.lame_duck_grace = Duration::from_millis(300);
    let server = start_server(config).await?;
    let addr = server.client_addr().expect("bound");

    let mut clients = Vec::new();
    for _ in 0..5 {
        clients.push(TestClient::connect_ready(addr).await?);
    }

    server.lame_duck_begin();
    tokio::time::sleep(Duration::from_millis(150)).await;
    // Still mid-grace: everybody is connected.
    assert_eq!(server.num_clients(), 5);

    let server_handle = std::sync::Arc::clone(&server);
    wait_until("eviction after grace", Duration::from_secs(5), move || {
        server_handle.num_clients() == 0
    })
    .await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn clients_learn_where_to_migrate() -> Result<()> {
    let mut config_a = base_config();
    config_a.lame_duck_duration = Duration::from_millis(500);
    config_a.lame_duck_grace = Duration::from_millis(100);
    let srv_a = start_server(config_a).await?;
    let mut config_b = base_config();
    config_b.routes = vec![srv_a.route_addr().expect("bound").to_string()];
    let srv_b = start_server(config_b).await?;
    {
        let (a, b) = (std::sync::Arc::clone(&srv_a), std::sync::Arc::clone(&srv_b));
        wait_until("route to form", Duration::from_secs(5), move || {
            a.num_routes() == 1 && b.num_routes() == 1
        })
        .await?;
    }
    let addr_a = srv_a.client_addr().expect("bound");
    let addr_b = srv_b.client_addr().expect("bound");

    let mut client = TestClient::connect_ready(addr_a).await?;
    srv_a.lame_duck_begin();

    // The push INFO flags lame duck and drops A's own URL, leaving B as the
    // place to go.
    let info = loop {
        match client.next_command().await? {
            Command::Info(info) if info.lame_duck_mode => break info,
            Command::Ping | Command::Info(_) => {}
            other => anyhow::bail!("expected lame-duck INFO, got {other:?}"),
        }
    };
    assert!(!info.connect_urls.contains(&addr_a.to_string()));
    assert!(info.connect_urls.contains(&addr_b.to_string()));

    // New clients are refused while draining.
    let mut refused = tokio::net::TcpStream::connect(addr_a).await?;
    let mut raw = Vec::new();
    tokio::time::timeout(
        Duration::from_secs(5),
        tokio::io::AsyncReadExt::read_to_end(&mut refused, &mut raw),
    )
    .await??;
    assert!(
        String::from_utf8_lossy(&raw).contains("Lame Duck"),
        "got {raw:?}"
    );

    {
        let a = std::sync::Arc::clone(&srv_a);
        wait_until("A drains", Duration::from_secs(10), move || {
            a.num_clients() == 0
        })
        .await?;
    }
    // B never lost its route while A was draining clients; it drops only
    // once A's post-drain shutdown completes.
    {
        let b = std::sync::Arc::clone(&srv_b);
        wait_until("route teardown after drain", Duration::from_secs(10), move || {
            b.num_routes() == 0
        })
        .await?;
    }
    srv_b.shutdown().await;
    Ok(())
}
