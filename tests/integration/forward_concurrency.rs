//! Two independent component-level checks that don't need the RPC layer:
//! a concurrent delete race on `ForwardManager`, and the SOCKS5 parser's
//! claimed resilience to byte-at-a-time (fragmented) delivery.

use std::time::Duration;

use moleport::config::ReconnectConfig;
use moleport::error::DomainError;
use moleport::forward::socks5;
use moleport::forward::{ForwardManager, ForwardType};
use moleport::ssh::client::mock::MockDialer;
use moleport::ssh::{HostManager, HostTarget};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

async fn manager_with_host(alias: &str) -> ForwardManager {
    let dialer = MockDialer::new();
    let (hosts, _events) = HostManager::new(dialer, ReconnectConfig::default());
    hosts
        .load_hosts(vec![HostTarget {
            alias: alias.to_string(),
            hostname: "127.0.0.1".to_string(),
            port: 22,
            user: "user".to_string(),
            identity_file: None,
            proxy_jump: Vec::new(),
        }])
        .await;
    let (forwards, _forward_events) = ForwardManager::new(hosts);
    forwards
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_delete_on_the_same_rule_succeeds_exactly_once() {
    let forwards = manager_with_host("prod").await;
    forwards
        .add_rule(
            "web".to_string(),
            "prod".to_string(),
            ForwardType::Local,
            8080,
            None,
            Some(80),
            false,
        )
        .await
        .unwrap();

    let a = {
        let forwards = forwards.clone();
        tokio::spawn(async move { forwards.delete_rule("web").await })
    };
    let b = {
        let forwards = forwards.clone();
        tokio::spawn(async move { forwards.delete_rule("web").await })
    };

    let (r1, r2) = tokio::join!(a, b);
    let (r1, r2) = (r1.unwrap(), r2.unwrap());

    let outcomes = [r1, r2];
    let successes = outcomes.iter().filter(|r| r.is_ok()).count();
    let not_found = outcomes
        .iter()
        .filter(|r| matches!(r, Err(DomainError::RuleNotFound(name)) if name == "web"))
        .count();

    assert_eq!(successes, 1, "exactly one concurrent delete should win");
    assert_eq!(not_found, 1, "the loser should see RuleNotFound, not a panic or a second success");
    assert!(forwards.list(None).await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn socks5_negotiate_survives_one_byte_at_a_time_delivery() {
    let (mut client, mut server) = duplex(4096);

    let request: Vec<u8> = {
        let mut bytes = vec![0x05, 0x01, 0x00]; // greeting: v5, 1 method, no-auth
        bytes.extend_from_slice(&[0x05, 0x01, 0x00, 0x03]); // request hdr: v5, CONNECT, rsv, ATYP=domain
        let name = b"internal.example";
        bytes.push(name.len() as u8);
        bytes.extend_from_slice(name);
        bytes.extend_from_slice(&8443u16.to_be_bytes());
        bytes
    };

    let writer = tokio::spawn(async move {
        for byte in request {
            client.write_all(&[byte]).await.unwrap();
            tokio::task::yield_now().await;
        }
        let mut greeting_reply = [0u8; 2];
        client.read_exact(&mut greeting_reply).await.unwrap();
        assert_eq!(greeting_reply, [0x05, 0x00]);
        client
    });

    let addr = socks5::negotiate(&mut server)
        .await
        .expect("parse succeeds even though every byte arrived separately");
    assert_eq!(addr, Some("internal.example:8443".to_string()));

    writer.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn socks5_negotiate_times_out_cleanly_on_a_stalled_client() {
    let (client, mut server) = duplex(4096);
    // Only the greeting arrives; the request phase never does.
    let mut client = client;
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

    let result = tokio::time::timeout(Duration::from_millis(100), socks5::negotiate(&mut server)).await;
    assert!(result.is_err(), "negotiate should still be awaiting the request header, not erroring out");
}
