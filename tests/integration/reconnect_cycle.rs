//! Exercises the SSH host manager's keepalive-failure -> reconnect ->
//! recovery cycle under virtual time, without any socket or RPC layer
//! involved.

use std::time::Duration;

use moleport::config::ReconnectConfig;
use moleport::events::{DomainEvent, SshEventType};
use moleport::ssh::client::mock::MockDialer;
use moleport::ssh::{HostManager, HostTarget};

fn target(alias: &str) -> HostTarget {
    HostTarget {
        alias: alias.to_string(),
        hostname: "127.0.0.1".to_string(),
        port: 22,
        user: "user".to_string(),
        identity_file: None,
        proxy_jump: Vec::new(),
    }
}

async fn next_ssh_event(rx: &mut tokio::sync::mpsc::Receiver<moleport::events::SshEvent>) -> moleport::events::SshEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event arrives before the wall-clock timeout")
        .expect("event channel stays open")
}

#[tokio::test(start_paused = true)]
async fn silent_disconnect_triggers_reconnect_then_recovery() {
    let dialer = MockDialer::new();
    let reconnect_cfg = ReconnectConfig {
        enabled: true,
        max_retries: 5,
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
    };
    let (hosts, mut events) = HostManager::new(dialer.clone(), reconnect_cfg);
    hosts.load_hosts(vec![target("prod")]).await;

    hosts.connect("prod", None).await.unwrap();
    let connected = next_ssh_event(&mut events).await;
    assert_eq!(connected.kind, SshEventType::Connected);
    assert_eq!(dialer.connects(), 1);

    // Kill the session from underneath the manager; nothing but the next
    // keepalive tick will notice.
    let conn = hosts.get_connection("prod").await.expect("connected host has a connection");
    conn.session.disconnect().await;

    // The keepalive ticker runs every 30s and skips its first tick, so
    // advancing 31s guarantees at least one failing probe has fired.
    tokio::time::advance(Duration::from_secs(31)).await;

    let reconnecting = next_ssh_event(&mut events).await;
    assert_eq!(reconnecting.kind, SshEventType::Reconnecting);
    assert!(!hosts.is_connected("prod").await);

    // Advance past the first backoff delay so the reconnect loop redials.
    tokio::time::advance(Duration::from_millis(60)).await;

    let reconnected = next_ssh_event(&mut events).await;
    assert_eq!(reconnected.kind, SshEventType::Connected);
    assert!(hosts.is_connected("prod").await);
    assert_eq!(dialer.connects(), 2);

    hosts.close().await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_disabled_goes_straight_to_disconnected() {
    let dialer = MockDialer::new();
    let reconnect_cfg = ReconnectConfig {
        enabled: false,
        max_retries: 5,
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
    };
    let (hosts, mut events) = HostManager::new(dialer.clone(), reconnect_cfg);
    hosts.load_hosts(vec![target("prod")]).await;

    hosts.connect("prod", None).await.unwrap();
    let _connected = next_ssh_event(&mut events).await;

    let conn = hosts.get_connection("prod").await.unwrap();
    conn.session.disconnect().await;

    tokio::time::advance(Duration::from_secs(31)).await;

    let disconnected = next_ssh_event(&mut events).await;
    assert_eq!(disconnected.kind, SshEventType::Disconnected);
    assert!(!hosts.is_connected("prod").await);
    assert_eq!(dialer.connects(), 1, "no redial attempt when reconnect is disabled");

    hosts.close().await;
}

#[tokio::test]
async fn ssh_domain_event_carries_the_ssh_category_tag() {
    // Guards against the Ssh/Forward match arms in `DomainEvent::category`
    // drifting apart from what the broker actually validates subscriptions
    // against.
    let ssh = DomainEvent::Ssh(moleport::events::SshEvent::new(SshEventType::Connected, "prod"));
    assert_eq!(ssh.category(), "ssh");
}
