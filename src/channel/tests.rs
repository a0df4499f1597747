//! Channel module tests

use super::*;
use crate::protocol::{ConnAck, Packet};

fn test_addr() -> SocketAddr {
    "127.0.0.1:1883".parse().unwrap()
}

#[tokio::test]
async fn test_write_completes_on_confirm() {
    let (channel, mut rx) = Channel::new(test_addr(), 8);

    let fut = channel.write(Packet::ConnAck(ConnAck::default())).unwrap();

    let outbound = rx.recv().await.unwrap();
    assert_eq!(outbound.packet.packet_type(), 2);
    outbound.confirm();

    fut.wait().await.unwrap();
}

#[tokio::test]
async fn test_write_on_closed_channel_fails() {
    let (channel, _rx) = Channel::new(test_addr(), 8);
    channel.close();

    let result = channel.write(Packet::PingReq);
    assert!(matches!(result, Err(ChannelError::Closed)));
}

#[tokio::test]
async fn test_close_is_idempotent_and_observable() {
    let (channel, _rx) = Channel::new(test_addr(), 8);

    let waiter = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.closed_wait().await })
    };

    channel.close();
    channel.close();
    assert!(channel.is_closed());
    waiter.await.unwrap();

    // closed_wait resolves immediately once closed
    channel.closed_wait().await;
}

#[tokio::test]
async fn test_disconnect_signal_fires_exactly_once() {
    let (channel, _rx) = Channel::new(test_addr(), 8);
    assert!(
        channel.disconnect_waiter().is_none(),
        "no signal before admission installed one"
    );
    assert!(!channel.complete_disconnect());

    channel.init_disconnect_signal();
    let waiter = channel.disconnect_waiter().unwrap();

    assert!(channel.complete_disconnect(), "first completion fires");
    assert!(!channel.complete_disconnect(), "second completion is a no-op");

    waiter.wait().await;
    // Waiters taken after completion resolve immediately
    channel.disconnect_waiter().unwrap().wait().await;
}

#[tokio::test]
async fn test_connect_guard_rejects_second_connect() {
    let (channel, _rx) = Channel::new(test_addr(), 8);
    assert!(channel.begin_connect());
    assert!(!channel.begin_connect(), "second CONNECT must be refused");
}

#[tokio::test]
async fn test_connack_claimed_once() {
    let (channel, _rx) = Channel::new(test_addr(), 8);
    assert!(!channel.connack_sent());
    assert!(channel.claim_connack());
    assert!(!channel.claim_connack());
    assert!(channel.connack_sent());
}

#[tokio::test]
async fn test_taken_over_set_once() {
    let (channel, _rx) = Channel::new(test_addr(), 8);
    assert!(!channel.is_taken_over());
    assert!(channel.set_taken_over());
    assert!(!channel.set_taken_over());
    assert!(channel.is_taken_over());
}

#[test]
fn test_registry_remove_only_when_still_mapped() {
    let registry = ChannelRegistry::new();
    let (a, _rx_a) = Channel::new(test_addr(), 8);
    let (b, _rx_b) = Channel::new(test_addr(), 8);
    let id: Arc<str> = Arc::from("c1");

    registry.persist(id.clone(), a.clone());
    // Takeover replaced the mapping before A tore down
    registry.persist(id.clone(), b.clone());

    assert!(!registry.remove("c1", &a), "A no longer owns the mapping");
    assert!(registry.get("c1").is_some());
    assert!(registry.remove("c1", &b));
    assert!(registry.get("c1").is_none());
}
