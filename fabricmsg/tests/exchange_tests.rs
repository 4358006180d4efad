// Integration tests for exchange ownership and reliable delivery through the
// in-memory exchange layer.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fabricmsg::memory::{ExchangeStatus, MemoryExchangeLayer};
use fabricmsg::{
    ConnectionId, EncryptionType, ExchangeLayer, ExchangeTarget, KeyId, NodeId, OwnedExchange,
    SendFlags, PROFILE_SECURITY,
};

fn layer() -> (Arc<MemoryExchangeLayer>, Arc<dyn ExchangeLayer>) {
    let mem = Arc::new(MemoryExchangeLayer::new());
    let dyn_layer: Arc<dyn ExchangeLayer> = mem.clone();
    (mem, dyn_layer)
}

fn node(peer: u64) -> ExchangeTarget {
    ExchangeTarget::Node { peer: NodeId(peer), addr: None }
}

// ── Ownership ───────────────────────────────────────────────────────────

#[test]
fn dropped_exchange_is_aborted() {
    let (mem, layer) = layer();
    let id = {
        let ec = OwnedExchange::open(layer, &node(7)).unwrap();
        ec.id()
    };
    assert_eq!(mem.status(id), Some(ExchangeStatus::Aborted));
    assert_eq!(mem.open_exchange_count(), 0);
}

#[test]
fn closed_exchange_is_not_aborted() {
    let (mem, layer) = layer();
    let ec = OwnedExchange::open(layer, &node(7)).unwrap();
    let id = ec.id();
    ec.close();
    assert_eq!(mem.status(id), Some(ExchangeStatus::Closed));
}

#[test]
fn adopted_exchange_reports_peer_and_connection() {
    let (mem, layer) = layer();
    let id = mem.accept_exchange(NodeId(0x42), Some(ConnectionId(3)));
    let ec = OwnedExchange::adopt(layer, id);
    let info = ec.info().unwrap();
    assert_eq!(info.peer, NodeId(0x42));
    assert_eq!(info.connection, Some(ConnectionId(3)));
    assert!(!info.uses_reliable_messaging());
}

#[test]
fn bound_key_applies_to_later_sends() {
    let (mem, layer) = layer();
    let ec = OwnedExchange::open(layer, &node(1)).unwrap();
    ec.send(PROFILE_SECURITY, 1, Bytes::new(), SendFlags::NONE).unwrap();
    ec.set_key(KeyId::session(9), EncryptionType::Aes256Gcm).unwrap();
    ec.send(PROFILE_SECURITY, 2, Bytes::new(), SendFlags::NONE).unwrap();

    let sent = mem.take_sent();
    assert_eq!(sent[0].key_id, KeyId::NONE);
    assert_eq!(sent[1].key_id, KeyId::session(9));
    assert_eq!(sent[1].encryption_type, EncryptionType::Aes256Gcm);
}

// ── Reliable messaging ──────────────────────────────────────────────────

#[test]
fn unacknowledged_message_is_retransmitted() {
    let (mem, layer) = layer();
    mem.set_ack_timeout(Duration::from_millis(100));
    let ec = OwnedExchange::open(layer, &node(1)).unwrap();
    let id = ec
        .send(PROFILE_SECURITY, 0x0A, Bytes::from_static(b"req"), SendFlags::REQUEST_ACK)
        .unwrap();

    mem.set_now(Duration::from_millis(150));
    let polled = mem.poll_retransmissions();
    assert_eq!(polled.retransmit.len(), 1);
    assert_eq!(polled.retransmit[0].key.message_id, id);
    assert_eq!(&polled.retransmit[0].payload[..], b"req");
}

#[test]
fn abort_cancels_retransmission() {
    let (mem, layer) = layer();
    let ec = OwnedExchange::open(layer, &node(1)).unwrap();
    let exchange = ec.id();
    let id = ec
        .send(PROFILE_SECURITY, 0x0A, Bytes::new(), SendFlags::REQUEST_ACK)
        .unwrap();
    drop(ec);

    assert!(!mem.awaiting_ack(exchange, id));
    mem.set_now(Duration::from_secs(10));
    assert!(mem.poll_retransmissions().retransmit.is_empty());
}

#[test]
fn key_failures_are_recorded_per_peer() {
    let (mem, layer) = layer();
    layer.on_key_failed(NodeId(1), KeyId::session(4), 0x0101);
    layer.on_key_failed(NodeId(2), KeyId::session(4), 0x0101);
    let failures = mem.key_failures();
    assert_eq!(failures.len(), 2);
    assert_eq!(failures[1].peer, NodeId(2));
}
