//! Integration tests for the heartbeat liveness monitor.
//!
//! These run against a real server with a short heartbeat interval and a
//! hand-rolled host controller that scripts its ping replies.

mod common;

use std::time::Duration;

use common::{Slave, seeded_model, start_server, wait_until};
use domainlink::domain::DomainConfig;
use domainlink::protocol::{Frame, Request};

fn fast_config() -> DomainConfig {
    DomainConfig::with_heartbeat_interval(Duration::from_millis(200))
}

#[tokio::test]
async fn idle_host_is_probed_and_stays_registered() {
    let (controller, _server, addr) = start_server(fast_config(), seeded_model()).await;

    let mut slave = Slave::connect(addr, 0x1111).await;
    slave.register_and_commit("hc01").await;
    wait_until("hc01 registered", || controller.is_host_registered("hc01")).await;

    // Silent host: the master must probe within the next window.
    for _ in 0..3 {
        match slave.read_frame().await.expect("master closed connection") {
            Frame::Request(header, Request::Ping) => {
                slave.reply_ping(header.correlation_id).await;
            }
            other => panic!("expected ping, got {:?}", other),
        }
    }

    // Replies carried a stable connection id; the host is still in.
    assert!(controller.is_host_registered("hc01").await);
}

#[tokio::test]
async fn changed_connection_id_is_a_fatal_desync() {
    let (controller, _server, addr) = start_server(fast_config(), seeded_model()).await;

    let mut slave = Slave::connect(addr, 0x2222).await;
    slave.register_and_commit("hc02").await;
    wait_until("hc02 registered", || controller.is_host_registered("hc02")).await;

    // First probe: answer with the real id.
    match slave.read_frame().await.expect("master closed connection") {
        Frame::Request(header, Request::Ping) => slave.reply_ping(header.correlation_id).await,
        other => panic!("expected ping, got {:?}", other),
    }

    // Second probe: the "process" restarted under the same socket.
    match slave.read_frame().await.expect("master closed connection") {
        Frame::Request(header, Request::Ping) => {
            slave.reply_ping_with(header.correlation_id, 0x9999).await;
        }
        other => panic!("expected ping, got {:?}", other),
    }

    // The master closes the connection once and tears the host down; no
    // further probe can arrive on a closed socket.
    wait_until("connection closed", || async {
        !controller.is_host_registered("hc02").await
    })
    .await;
    loop {
        match slave.read_frame().await {
            None => break,
            Some(Frame::Request(_, Request::Ping)) => panic!("probe after desync close"),
            Some(_) => continue,
        }
    }
}

#[tokio::test]
async fn unanswered_probe_times_out_and_closes() {
    let (controller, _server, addr) = start_server(fast_config(), seeded_model()).await;

    let mut slave = Slave::connect(addr, 0x3333).await;
    slave.register_and_commit("hc03").await;
    wait_until("hc03 registered", || controller.is_host_registered("hc03")).await;

    // Swallow the probe without answering.
    match slave.read_frame().await.expect("master closed connection") {
        Frame::Request(_, Request::Ping) => {}
        other => panic!("expected ping, got {:?}", other),
    }

    // Unreachable host: connection closed, host implicitly unregistered.
    wait_until("hc03 unregistered", || async {
        !controller.is_host_registered("hc03").await
    })
    .await;
    loop {
        if slave.read_frame().await.is_none() {
            break;
        }
    }
}

#[tokio::test]
async fn recent_traffic_skips_the_probe() {
    let (controller, _server, addr) = start_server(fast_config(), seeded_model()).await;

    let mut slave = Slave::connect(addr, 0x4444).await;
    slave.register_and_commit("hc04").await;
    wait_until("hc04 registered", || controller.is_host_registered("hc04")).await;

    // Keep the channel chatty: the slave probes the master instead. Any
    // inbound traffic counts as liveness, so the master stays quiet.
    let deadline = std::time::Instant::now() + Duration::from_millis(700);
    while std::time::Instant::now() < deadline {
        let correlation = slave.send_ping().await;
        match slave.read_frame().await.expect("master closed connection") {
            Frame::Response(response) => {
                assert_eq!(response.correlation_id, correlation);
                assert_eq!(response.status, 0);
            }
            Frame::Request(_, Request::Ping) => {
                panic!("master probed despite recent traffic")
            }
            other => panic!("unexpected frame {:?}", other),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert!(controller.is_host_registered("hc04").await);
}
