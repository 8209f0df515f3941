// Client wire-protocol integration tests over real TCP sessions.
mod common;

use std::time::Duration;

use anyhow::Result;
use common::{TestClient, base_config, start_server, wait_until};
use plume_proto::{Command, ConnectOptions};

#[tokio::test]
async fn info_greeting_carries_identity() -> Result<()> {
    let server = start_server(base_config()).await?;
    let addr = server.client_addr().expect("bound");
    let (_client, info) = TestClient::connect(addr).await?;
    assert_eq!(info.server_id, server.id());
    assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
    assert!(!info.cluster.is_empty());
    assert!(!info.lame_duck_mode);
    assert!(info.connect_urls.contains(&addr.to_string()));
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn connect_is_required_before_other_verbs() -> Result<()> {
    let server = start_server(base_config()).await?;
    let (mut client, _info) = TestClient::connect(server.client_addr().expect("bound")).await?;
    client.send_line("SUB foo 1").await?;
    let err = client.expect_err().await?;
    assert!(err.contains("Connect Required"), "got {err:?}");
    client.expect_closed().await?;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn ping_is_allowed_before_connect() -> Result<()> {
    let server = start_server(base_config()).await?;
    let (mut client, _info) = TestClient::connect(server.client_addr().expect("bound")).await?;
    client.flush().await?;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn duplicate_connect_is_rejected() -> Result<()> {
    let server = start_server(base_config()).await?;
    let mut client = TestClient::connect_ready(server.client_addr().expect("bound")).await?;
    client
        .send_raw(&plume_proto::encode_connect(&ConnectOptions::default()))
        .await?;
    let err = client.expect_err().await?;
    assert!(err.contains("Duplicate Connect"), "got {err:?}");
    client.expect_closed().await?;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn verbose_mode_acknowledges_operations() -> Result<()> {
    let server = start_server(base_config()).await?;
    let (mut client, _info) = TestClient::connect(server.client_addr().expect("bound")).await?;
    client
        .send_raw(&plume_proto::encode_connect(&ConnectOptions {
            verbose: true,
            protocol: 1,
            ..ConnectOptions::default()
        }))
        .await?;
    assert_eq!(client.next_command().await?, Command::Ok);
    client.send_line("SUB foo 1").await?;
    assert_eq!(client.next_command().await?, Command::Ok);
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn pub_sub_roundtrip() -> Result<()> {
    let server = start_server(base_config()).await?;
    let addr = server.client_addr().expect("bound");
    let mut subscriber = TestClient::connect_ready(addr).await?;
    let mut publisher = TestClient::connect_ready(addr).await?;

    subscriber.send_line("SUB greetings 7").await?;
    subscriber.flush().await?;

    publisher.publish("greetings", b"hello").await?;
    publisher.flush().await?;

    let (subject, sid, reply, payload) = subscriber.expect_msg().await?;
    assert_eq!(subject, "greetings");
    assert_eq!(sid, "7");
    assert_eq!(reply, None);
    assert_eq!(&payload[..], b"hello");
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn reply_subject_is_forwarded() -> Result<()> {
    let server = start_server(base_config()).await?;
    let addr = server.client_addr().expect("bound");
    let mut subscriber = TestClient::connect_ready(addr).await?;
    let mut publisher = TestClient::connect_ready(addr).await?;

    subscriber.send_line("SUB request.* 1").await?;
    subscriber.flush().await?;
    publisher
        .send_raw(&plume_proto::encode_pub("request.add", Some("inbox.42"), b"2+2"))
        .await?;
    publisher.flush().await?;

    let (_subject, _sid, reply, payload) = subscriber.expect_msg().await?;
    assert_eq!(reply.as_deref(), Some("inbox.42"));
    assert_eq!(&payload[..], b"2+2");
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn wildcards_deliver_alongside_literals() -> Result<()> {
    let server = start_server(base_config()).await?;
    let addr = server.client_addr().expect("bound");
    let mut client = TestClient::connect_ready(addr).await?;

    client.send_line("SUB foo.bar 1").await?;
    client.send_line("SUB foo.* 2").await?;
    client.send_line("SUB > 3").await?;
    client.flush().await?;

    client.publish("foo.bar", b"x").await?;
    client.flush().await?;

    let mut sids: Vec<String> = client
        .expect_msgs(3)
        .await?
        .into_iter()
        .map(|(_, sid, _)| sid)
        .collect();
    sids.sort();
    assert_eq!(sids, vec!["1", "2", "3"]);
    client.expect_silence(Duration::from_millis(100)).await?;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn queue_group_delivers_exactly_once() -> Result<()> {
    let server = start_server(base_config()).await?;
    let addr = server.client_addr().expect("bound");
    let mut worker = TestClient::connect_ready(addr).await?;
    let mut publisher = TestClient::connect_ready(addr).await?;

    for sid in 1..=3 {
        worker.send_line(&format!("SUB jobs workers {sid}")).await?;
    }
    worker.flush().await?;

    for _ in 0..10 {
        publisher.publish("jobs", b"work").await?;
    }
    publisher.flush().await?;

    let messages = worker.expect_msgs(10).await?;
    assert_eq!(messages.len(), 10);
    worker.expect_silence(Duration::from_millis(150)).await?;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn messages_arrive_in_publish_order() -> Result<()> {
    let server = start_server(base_config()).await?;
    let addr = server.client_addr().expect("bound");
    let mut subscriber = TestClient::connect_ready(addr).await?;
    let mut publisher = TestClient::connect_ready(addr).await?;

    subscriber.send_line("SUB seq 1").await?;
    subscriber.flush().await?;
    for n in 0..50 {
        publisher.publish("seq", n.to_string().as_bytes()).await?;
    }
    publisher.flush().await?;

    for n in 0..50 {
        let (_, _, _, payload) = subscriber.expect_msg().await?;
        assert_eq!(payload, n.to_string().as_bytes());
    }
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn auto_unsubscribe_caps_deliveries() -> Result<()> {
    let server = start_server(base_config()).await?;
    let addr = server.client_addr().expect("bound");
    let mut client = TestClient::connect_ready(addr).await?;

    client.send_line("SUB once 1").await?;
    client.send_line("UNSUB 1 2").await?;
    client.flush().await?;
    assert_eq!(server.num_subscriptions(), 1);

    for _ in 0..5 {
        client.publish("once", b"m").await?;
    }
    client.flush().await?;

    assert_eq!(client.expect_msgs(2).await?.len(), 2);
    client.expect_silence(Duration::from_millis(150)).await?;
    wait_until("auto-unsub removal", Duration::from_secs(2), || {
        server.num_subscriptions() == 0
    })
    .await?;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unsub_for_unknown_sid_is_ignored() -> Result<()> {
    let server = start_server(base_config()).await?;
    let mut client = TestClient::connect_ready(server.client_addr().expect("bound")).await?;
    client.send_line("UNSUB 99").await?;
    client.flush().await?;
    // Still alive and usable.
    client.send_line("SUB foo 1").await?;
    client.flush().await?;
    assert_eq!(server.num_subscriptions(), 1);
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn duplicate_sid_errors_but_keeps_connection() -> Result<()> {
    let server = start_server(base_config()).await?;
    let mut client = TestClient::connect_ready(server.client_addr().expect("bound")).await?;
    client.send_line("SUB foo 1").await?;
    client.send_line("SUB bar 1").await?;
    let err = client.expect_err().await?;
    assert!(err.contains("Invalid Subscription"), "got {err:?}");
    client.flush().await?;
    assert_eq!(server.num_subscriptions(), 1);
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn invalid_publish_subject_keeps_connection() -> Result<()> {
    let server = start_server(base_config()).await?;
    let mut client = TestClient::connect_ready(server.client_addr().expect("bound")).await?;
    // Wildcards are interest-only; publishing to one is refused.
    client.publish("foo.*", b"x").await?;
    let err = client.expect_err().await?;
    assert!(err.contains("Invalid Subject"), "got {err:?}");
    client.publish("ok.subject", b"x").await?;
    client.flush().await?;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn invalid_subscription_pattern_is_refused() -> Result<()> {
    let server = start_server(base_config()).await?;
    let mut client = TestClient::connect_ready(server.client_addr().expect("bound")).await?;
    // `>` must be the final token.
    client.send_line("SUB >.tail 1").await?;
    let err = client.expect_err().await?;
    assert!(err.contains("Invalid Subject"), "got {err:?}");
    assert_eq!(server.num_subscriptions(), 0);
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn payload_length_mismatch_closes_connection() -> Result<()> {
    let server = start_server(base_config()).await?;
    let mut client = TestClient::connect_ready(server.client_addr().expect("bound")).await?;
    client.send_raw(b"PUB foo 2\r\ntoolong\r\n").await?;
    let err = client.expect_err().await?;
    assert!(err.contains("Parser Error"), "got {err:?}");
    client.expect_closed().await?;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn max_payload_violation_closes_connection() -> Result<()> {
    let mut config = base_config();
    config.max_payload = 64;
    let server = start_server(config).await?;
    let mut client = TestClient::connect_ready(server.client_addr().expect("bound")).await?;
    client.send_line("PUB foo 65").await?;
    let err = client.expect_err().await?;
    assert!(err.contains("Maximum Payload"), "got {err:?}");
    client.expect_closed().await?;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn max_subscriptions_enforced_per_connection() -> Result<()> {
    let mut config = base_config();
    config.max_subscriptions = 2;
    let server = start_server(config).await?;
    let mut client = TestClient::connect_ready(server.client_addr().expect("bound")).await?;
    client.send_line("SUB a 1").await?;
    client.send_line("SUB b 2").await?;
    client.send_line("SUB c 3").await?;
    let err = client.expect_err().await?;
    assert!(err.contains("Maximum Subscriptions"), "got {err:?}");
    client.expect_closed().await?;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn auth_token_gates_connect() -> Result<()> {
    let mut config = base_config();
    config.auth_token = Some("sekret".into());
    let server = start_server(config).await?;
    let addr = server.client_addr().expect("bound");

    // Missing token is an authorization violation.
    let (mut bad, _info) = TestClient::connect(addr).await?;
    bad.send_raw(&plume_proto::encode_connect(&ConnectOptions::default()))
        .await?;
    let err = bad.expect_err().await?;
    assert!(err.contains("Authorization Violation"), "got {err:?}");
    bad.expect_closed().await?;

    // The right token gets through.
    let (mut good, _info) = TestClient::connect(addr).await?;
    good.send_raw(&plume_proto::encode_connect(&ConnectOptions {
        auth_token: Some("sekret".into()),
        protocol: 1,
        ..ConnectOptions::default()
    }))
    .await?;
    good.flush().await?;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn accounts_isolate_subjects() -> Result<()> {
    let server = start_server(base_config()).await?;
    let addr = server.client_addr().expect("bound");

    let (mut red, _info) = TestClient::connect(addr).await?;
    red.send_raw(&plume_proto::encode_connect(&ConnectOptions {
        account: Some("red".into()),
        protocol: 1,
        ..ConnectOptions::default()
    }))
    .await?;
    red.send_line("SUB foo 1").await?;
    red.flush().await?;

    let (mut blue, _info) = TestClient::connect(addr).await?;
    blue.send_raw(&plume_proto::encode_connect(&ConnectOptions {
        account: Some("blue".into()),
        protocol: 1,
        ..ConnectOptions::default()
    }))
    .await?;
    // Same subject, different account: must not cross.
    blue.publish("foo", b"leaked").await?;
    blue.flush().await?;
    red.expect_silence(Duration::from_millis(200)).await?;

    let (mut red2, _info) = TestClient::connect(addr).await?;
    red2.send_raw(&plume_proto::encode_connect(&ConnectOptions {
        account: Some("red".into()),
        protocol: 1,
        ..ConnectOptions::default()
    }))
    .await?;
    red2.publish("foo", b"hello red").await?;
    red2.flush().await?;
    let (_, _, _, payload) = red.expect_msg().await?;
    assert_eq!(&payload[..], b"hello red");

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn slow_consumer_is_cut_off_without_blocking_publisher() -> Result<()> {
    let mut config = base_config();
    config.max_pending = 512;
    let server = start_server(config).await?;
    let addr = server.client_addr().expect("bound");

    let mut victim = TestClient::connect_ready(addr).await?;
    victim.send_line("SUB flood 1").await?;
    victim.flush().await?;

    // The victim stops reading; the publisher keeps pushing well past the
    // victim's pending cap.
    let mut publisher = TestClient::connect_ready(addr).await?;
    let payload = vec![b'x'; 16 * 1024];
    for _ in 0..256 {
        publisher.publish("flood", &payload).await?;
    }
    publisher.flush().await?;

    wait_until("slow consumer cutoff", Duration::from_secs(5), || {
        server.slow_consumers() == 1
    })
    .await?;
    assert_eq!(server.num_clients(), 1);
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn stale_connection_is_closed_after_missed_pings() -> Result<()> {
    let mut config = base_config();
    config.ping_interval = Duration::from_millis(50);
    config.ping_max = 1;
    let server = start_server(config).await?;
    let mut client = TestClient::connect_ready(server.client_addr().expect("bound")).await?;

    // Never answer the server's pings; it gives up after ping_max misses.
    let mut saw_stale = false;
    loop {
        match client.next_command().await {
            Ok(Command::Err(message)) => {
                assert!(message.contains("Stale"), "got {message:?}");
                saw_stale = true;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    assert!(saw_stale, "expected a Stale Connection error before close");
    wait_until("client removal", Duration::from_secs(2), || {
        server.num_clients() == 0
    })
    .await?;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn max_connections_rejects_excess_clients() -> Result<()> {
    let mut config = base_config();
    config.max_connections = 1;
    let server = start_server(config).await?;
    let addr = server.client_addr().expect("bound");

    let _first = TestClient::connect_ready(addr).await?;
    // The excess client is refused before the INFO greeting; read the raw
    // error straight off the socket.
    let mut second = tokio::net::TcpStream::connect(addr).await?;
    let mut refusal = Vec::new();
    tokio::time::timeout(
        Duration::from_secs(5),
        tokio::io::AsyncReadExt::read_to_end(&mut second, &mut refusal),
    )
    .await??;
    let text = String::from_utf8_lossy(&refusal);
    assert!(text.contains("Maximum Connections"), "got {text:?}");
    assert_eq!(server.num_clients(), 1);
    server.shutdown().await;
    Ok(())
}
