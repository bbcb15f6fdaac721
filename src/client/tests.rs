use super::{Outbound, channel};
use crate::codec::Packet;

#[test]
fn test_client_new() {
    let (client, _outbox) = channel();
    assert!(!client.id.is_empty());
    assert_eq!(client.backlog(), 0);
}

#[test]
fn test_client_ids_are_unique_per_connection() {
    let (a, _) = channel();
    let (b, _) = channel();
    assert_ne!(a.id, b.id);
}

#[test]
fn test_send_preserves_order_then_close() {
    let (client, mut outbox) = channel();

    assert!(client.send(Packet::PingResp));
    assert!(client.send(Packet::PubAck(7)));
    client.close();

    assert!(matches!(outbox.try_recv(), Ok(Outbound::Packet(Packet::PingResp))));
    assert!(matches!(outbox.try_recv(), Ok(Outbound::Packet(Packet::PubAck(7)))));
    assert!(matches!(outbox.try_recv(), Ok(Outbound::Close)));
}

#[test]
fn test_backlog_counts_untaken_packets() {
    let (client, mut outbox) = channel();
    let other = client.clone();

    client.send(Packet::PingResp);
    other.send(Packet::PubAck(1));
    client.send(Packet::PubAck(2));
    assert_eq!(client.backlog(), 3);
    assert_eq!(other.backlog(), 3);

    outbox.try_recv().expect("queued packet");
    assert_eq!(client.backlog(), 2);

    while outbox.try_recv().is_ok() {}
    assert_eq!(client.backlog(), 0);
}

#[test]
fn test_send_to_dropped_connection() {
    let (client, outbox) = channel();
    drop(outbox);

    assert!(client.is_closed());
    assert!(!client.send(Packet::PingResp));
    assert_eq!(client.backlog(), 0);
}

#[tokio::test]
async fn test_closed_resolves_when_receiver_goes_away() {
    let (client, outbox) = channel();

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.closed().await })
    };
    drop(outbox);

    tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
        .await
        .expect("closed() did not resolve")
        .expect("waiter panicked");
}

#[tokio::test]
async fn test_recv_releases_backlog() {
    let (client, mut outbox) = channel();
    client.send(Packet::PingResp);

    assert!(matches!(outbox.recv().await, Some(Outbound::Packet(Packet::PingResp))));
    assert_eq!(client.backlog(), 0);
}
