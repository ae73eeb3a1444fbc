//! Integration tests for the registration handshake.
//!
//! These tests run a real `DomainServer` on an ephemeral port and drive it
//! with a hand-rolled host controller speaking the wire protocol.
//!
//! **Note:** They require a TCP listener on 127.0.0.1 and will fail in
//! sandboxed environments that restrict network access.

mod common;

use common::{IgnoreDecl, Slave, seeded_model, start_server, wait_until};
use domainlink::domain::DomainConfig;
use domainlink::error::MgmtErrorCode;

#[tokio::test]
async fn handshake_commit_registers_host() {
    let (controller, _server, addr) = start_server(DomainConfig::default(), seeded_model()).await;

    let mut slave = Slave::connect(addr, 1).await;
    let snapshot = slave.register("hc01").await;
    assert_eq!(snapshot.status, 0);

    // The snapshot is the serialized configuration model.
    let model: serde_json::Value = serde_json::from_slice(&snapshot.body).unwrap();
    assert!(model["children"]["profile"]["default"].is_object());
    assert!(model["children"]["server-group"]["sg1"].is_object());

    // Not registered until the host reports commit.
    assert!(!controller.is_host_registered("hc01").await);

    let done = slave.complete(true, None).await;
    assert_eq!(done.status, 0);

    wait_until("hc01 registered", || controller.is_host_registered("hc01")).await;
    assert_eq!(controller.registered_hosts().await, vec!["hc01".to_string()]);

    // The initial snapshot is not tracked via the missing-resource
    // mechanism: the known set starts empty.
    let known = controller.known_root_addresses("hc01").await.unwrap();
    assert!(known.is_empty());
}

#[tokio::test]
async fn handshake_rollback_leaves_no_state() {
    let (controller, _server, addr) = start_server(DomainConfig::default(), seeded_model()).await;

    let mut slave = Slave::connect(addr, 1).await;
    let snapshot = slave.register("hc01").await;
    assert_eq!(snapshot.status, 0);

    let done = slave.complete(false, Some("local apply failed")).await;
    assert_eq!(done.status, 0);

    // No ProxyEntry, no known addresses, no ping state.
    assert!(!controller.is_host_registered("hc01").await);
    assert!(controller.known_root_addresses("hc01").await.is_none());
    assert!(controller.registered_hosts().await.is_empty());

    // The connection stays usable; the host may retry and succeed. The
    // failed attempt releases its in-flight slot asynchronously, so the
    // retry may briefly observe the conflict.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let response = slave.register("hc01").await;
        if response.status == 0 {
            assert_eq!(slave.complete(true, None).await.status, 0);
            break;
        }
        assert_eq!(response.status, MgmtErrorCode::HostAlreadyExists as i16);
        assert!(
            std::time::Instant::now() < deadline,
            "rolled-back attempt never released its slot"
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    wait_until("hc01 registered", || controller.is_host_registered("hc01")).await;
}

#[tokio::test]
async fn duplicate_registration_fails_deterministically() {
    let (controller, _server, addr) = start_server(DomainConfig::default(), seeded_model()).await;

    let mut first = Slave::connect(addr, 1).await;
    first.register_and_commit("hc01").await;

    let mut second = Slave::connect(addr, 2).await;
    let rejected = second.register("hc01").await;
    assert_eq!(rejected.status, MgmtErrorCode::HostAlreadyExists as i16);

    // The original registration is untouched.
    assert!(controller.is_host_registered("hc01").await);
    assert_eq!(controller.registered_hosts().await.len(), 1);
}

#[tokio::test]
async fn concurrent_duplicate_observes_inflight_attempt() {
    let (controller, _server, addr) = start_server(DomainConfig::default(), seeded_model()).await;

    // First attempt is mid-handshake: snapshot received, COMPLETE not yet
    // sent.
    let mut first = Slave::connect(addr, 1).await;
    let snapshot = first.register("hc01").await;
    assert_eq!(snapshot.status, 0);

    // Concurrent duplicate fails instead of corrupting the first attempt.
    let mut second = Slave::connect(addr, 2).await;
    let rejected = second.register("hc01").await;
    assert_eq!(rejected.status, MgmtErrorCode::HostAlreadyExists as i16);

    // The first attempt still completes normally.
    let done = first.complete(true, None).await;
    assert_eq!(done.status, 0);
    wait_until("hc01 registered", || controller.is_host_registered("hc01")).await;
    assert_eq!(controller.registered_hosts().await.len(), 1);
}

#[tokio::test]
async fn unsupported_version_is_rejected() {
    let (controller, _server, addr) = start_server(DomainConfig::default(), seeded_model()).await;

    let mut slave = Slave::connect(addr, 1).await;
    let rejected = slave.register_with("hc01", (1, 7, 0), &[]).await;
    assert_eq!(rejected.status, MgmtErrorCode::UnsupportedVersion as i16);
    assert!(!controller.is_host_registered("hc01").await);
}

#[tokio::test]
async fn legacy_supported_version_registers() {
    let (controller, _server, addr) = start_server(DomainConfig::default(), seeded_model()).await;

    let mut slave = Slave::connect(addr, 1).await;
    let snapshot = slave.register_with("hc01", (2, 1, 0), &[]).await;
    assert_eq!(snapshot.status, 0);
    let done = slave.complete(true, None).await;
    assert_eq!(done.status, 0);

    wait_until("hc01 registered", || controller.is_host_registered("hc01")).await;
}

#[tokio::test]
async fn ignored_resources_are_recorded_with_registration() {
    let (controller, _server, addr) = start_server(DomainConfig::default(), seeded_model()).await;

    let mut slave = Slave::connect(addr, 1).await;
    let snapshot = slave
        .register_with(
            "hc01",
            (3, 0, 0),
            &[
                IgnoreDecl::wildcard("extension"),
                IgnoreDecl::named("server-group", "batch"),
            ],
        )
        .await;
    assert_eq!(snapshot.status, 0);
    slave.complete(true, None).await;

    wait_until("hc01 registered", || controller.is_host_registered("hc01")).await;
}

#[tokio::test]
async fn connection_loss_mid_handshake_releases_the_attempt() {
    let (controller, _server, addr) = start_server(DomainConfig::default(), seeded_model()).await;

    let mut slave = Slave::connect(addr, 1).await;
    let snapshot = slave.register("hc01").await;
    assert_eq!(snapshot.status, 0);

    // The host dies while the master is parked awaiting COMPLETE.
    drop(slave);

    // The attempt unwinds: nothing registered, and the name becomes free
    // for a new attempt.
    wait_until("hc01 attempt released", || async {
        let mut retry = Slave::connect(addr, 2).await;
        let response = retry.register("hc01").await;
        if response.status != 0 {
            return false;
        }
        retry.complete(true, None).await.status == 0
    })
    .await;

    wait_until("hc01 registered", || controller.is_host_registered("hc01")).await;
}

#[tokio::test]
async fn graceful_unregistration_clears_all_state() {
    let (controller, _server, addr) = start_server(DomainConfig::default(), seeded_model()).await;

    let mut slave = Slave::connect(addr, 1).await;
    slave.register_and_commit("hc01").await;
    wait_until("hc01 registered", || controller.is_host_registered("hc01")).await;

    let done = slave.unregister(Some("maintenance")).await;
    assert_eq!(done.status, 0);

    wait_until("hc01 unregistered", || async {
        !controller.is_host_registered("hc01").await
    })
    .await;
    assert!(controller.known_root_addresses("hc01").await.is_none());
}

#[tokio::test]
async fn connection_loss_after_registration_unregisters_host() {
    let (controller, _server, addr) = start_server(DomainConfig::default(), seeded_model()).await;

    let mut slave = Slave::connect(addr, 1).await;
    slave.register_and_commit("hc01").await;
    wait_until("hc01 registered", || controller.is_host_registered("hc01")).await;

    drop(slave);

    // Liveness failures are observed as absence from the registry.
    wait_until("hc01 unregistered", || async {
        !controller.is_host_registered("hc01").await
    })
    .await;
}
