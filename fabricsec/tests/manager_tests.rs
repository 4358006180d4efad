// Integration tests: manager lifecycle, timers, concurrency limits, shared
// sessions, key errors and the key table as seen through the manager.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::*;
use fabricmsg::memory::{ExchangeStatus, ManualSystemLayer, MemoryExchangeLayer};
use fabricmsg::message::COMMON_MSG_STATUS_REPORT;
use fabricmsg::{
    ConnectionId, EncryptionType, ExchangeError, ExchangeEvent, ExchangeLayer, InboundMessage,
    KeyId, NodeId, SystemLayer, PROFILE_COMMON, PROFILE_SECURITY,
};
use fabricsec::key_error::KeyErrorMessage;
use fabricsec::status_report::common as common_status;
use fabricsec::{
    AuthMode, CertSessionParams, KeyErrorKind, ManagerState, PasswordSessionParams,
    PasswordSource, SecurityConfig, SecurityError, SecurityEvent, SecurityManager,
    SecurityMsgType, StatusReport, ESTABLISHMENT_TIMER, IDLE_SESSION_TIMER,
};

fn password_params() -> PasswordSessionParams {
    PasswordSessionParams::new(node_target(NODE_B), PasswordSource::PairingCode)
}

fn shared_params(end_node: NodeId) -> CertSessionParams {
    let mut params = CertSessionParams::new(node_target(NODE_B));
    params.shared_session_end_node = Some(end_node);
    params
}

/// Hand `node` a security-profile message from `peer` on a fresh exchange.
fn deliver_unsolicited(node: &mut TestNode, peer: NodeId, msg_type: SecurityMsgType, payload: Bytes) {
    let exchange = node.exchange.accept_exchange(peer, None);
    node.manager
        .handle_message(InboundMessage {
            exchange,
            peer,
            connection: None,
            profile: PROFILE_SECURITY,
            msg_type: msg_type.as_u8(),
            message_id: 1,
            key_id: KeyId::NONE,
            encryption_type: EncryptionType::None,
            ack_requested: false,
            payload,
        })
        .unwrap();
    node.collect();
}

fn has_key(node: &TestNode, key_id: KeyId, peer: NodeId) -> bool {
    node.manager.key_table().lock().find(key_id, peer).is_some()
}

// ── Initialization ───────────────────────────────────────────────────────

#[test]
fn uninitialized_manager_refuses_work() {
    let mut manager = SecurityManager::new(
        NODE_A,
        SecurityConfig::default(),
        delegates_for(NODE_A, fabricsec::CertType::Device),
    )
    .unwrap();
    assert_eq!(manager.state(), ManagerState::NotInitialized);
    assert_eq!(
        manager.start_password_session(password_params()).unwrap_err(),
        SecurityError::IncorrectState
    );
    assert_eq!(
        manager.handle_timer(ESTABLISHMENT_TIMER).unwrap_err(),
        SecurityError::IncorrectState
    );
}

#[test]
fn invalid_config_is_rejected_at_construction() {
    let config = SecurityConfig {
        max_session_keys: 0,
        ..SecurityConfig::default()
    };
    let result = SecurityManager::new(NODE_A, config, Default::default());
    assert!(matches!(result, Err(SecurityError::Config(_))));
}

#[test]
fn init_twice_fails_and_shutdown_unregisters() {
    let mut node = TestNode::with_defaults(NODE_A);
    assert_eq!(node.manager.state(), ManagerState::Idle);
    assert!(node.exchange.has_handler(PROFILE_SECURITY));

    let exchange: Arc<dyn ExchangeLayer> = Arc::new(MemoryExchangeLayer::new());
    let system: Arc<dyn SystemLayer> = Arc::new(ManualSystemLayer::new());
    assert_eq!(
        node.manager.init(exchange, system).unwrap_err(),
        SecurityError::IncorrectState
    );

    node.manager.start_password_session(password_params()).unwrap();
    assert!(node.system.is_armed(ESTABLISHMENT_TIMER));
    node.manager.shutdown();
    assert_eq!(node.manager.state(), ManagerState::NotInitialized);
    assert!(!node.exchange.has_handler(PROFILE_SECURITY));
    assert!(!node.system.is_armed(ESTABLISHMENT_TIMER));
    // Shutdown reports nothing.
    assert!(node.take_events().is_empty());
}

// ── One attempt at a time ────────────────────────────────────────────────

#[test]
fn second_local_start_is_busy() {
    let mut node = TestNode::with_defaults(NODE_A);
    node.manager.start_password_session(password_params()).unwrap();
    assert_eq!(
        node.manager
            .start_cert_session(CertSessionParams::new(node_target(NODE_B)))
            .unwrap_err(),
        SecurityError::Busy
    );
    assert_eq!(node.manager.state(), ManagerState::PasswordInProgress);
}

#[test]
fn busy_responder_rejects_session_request() {
    let mut pair = Pair::with_defaults();
    pair.b
        .manager
        .start_password_session(PasswordSessionParams::new(
            node_target(NodeId(0x0C)),
            PasswordSource::PairingCode,
        ))
        .unwrap();
    pair.drop_outbound(Side::B);

    let token = pair.a.manager.start_password_session(password_params()).unwrap();
    pair.pump();

    let a_events = pair.a.take_events();
    let failure = failures(&a_events)[0];
    assert_eq!(failure.token, Some(token));
    assert_eq!(
        failure.status_report,
        Some(StatusReport::common(common_status::BUSY))
    );
    assert!(pair.a.manager.key_table().lock().is_empty());
    // B's own attempt is untouched.
    assert_eq!(pair.b.manager.state(), ManagerState::PasswordInProgress);
}

#[test]
fn plaintext_password_session_is_rejected() {
    let mut node = TestNode::with_defaults(NODE_A);
    let mut params = password_params();
    params.encryption_type = EncryptionType::None;
    assert!(matches!(
        node.manager.start_password_session(params),
        Err(SecurityError::InvalidArgument(_))
    ));
    assert_eq!(node.manager.state(), ManagerState::Idle);
}

#[test]
fn cert_session_rejects_non_cert_auth_mode() {
    let mut node = TestNode::with_defaults(NODE_A);
    let mut params = CertSessionParams::new(node_target(NODE_B));
    params.requested_auth_mode = AuthMode::Password(PasswordSource::PairingCode);
    assert!(matches!(
        node.manager.start_cert_session(params),
        Err(SecurityError::InvalidArgument(_))
    ));
}

// ── Timers ───────────────────────────────────────────────────────────────

#[test]
fn establishment_timeout_fails_attempt_once() {
    let mut node = TestNode::with_defaults(NODE_A);
    let token = node.manager.start_password_session(password_params()).unwrap();
    let exchange = node.exchange.take_sent()[0].exchange;

    node.advance(Duration::from_millis(29_999));
    assert!(failures(&node.events).is_empty());
    node.advance(Duration::from_millis(1));

    let events = node.take_events();
    let failure = failures(&events)[0];
    assert_eq!(failure.token, Some(token));
    assert_eq!(failure.error, SecurityError::Timeout);
    assert_eq!(available_count(&events), 1);

    let sent = node.exchange.take_sent();
    let reports: Vec<_> = sent
        .iter()
        .filter(|m| m.profile == PROFILE_COMMON && m.msg_type == COMMON_MSG_STATUS_REPORT)
        .collect();
    assert_eq!(reports.len(), 1);
    assert_eq!(
        StatusReport::decode(&reports[0].payload).unwrap(),
        StatusReport::common(common_status::TIMEOUT)
    );
    assert_eq!(node.exchange.status(exchange), Some(ExchangeStatus::Aborted));
    assert!(node.manager.key_table().lock().is_empty());
    assert_eq!(node.manager.state(), ManagerState::Idle);

    // A late expiry finds nothing to fail.
    node.manager.handle_timer(ESTABLISHMENT_TIMER).unwrap();
    assert!(node.take_events().is_empty());
}

#[test]
fn completed_session_cancels_establishment_timer() {
    let mut pair = Pair::with_defaults();
    pair.a.manager.start_password_session(password_params()).unwrap();
    pair.pump();
    assert!(!pair.a.system.is_armed(ESTABLISHMENT_TIMER));
    assert!(!pair.b.system.is_armed(ESTABLISHMENT_TIMER));
}

#[test]
fn idle_sweep_spares_active_keys_once() {
    let mut pair = Pair::with_defaults();
    pair.a.manager.start_password_session(password_params()).unwrap();
    pair.pump();
    let a_events = pair.a.take_events();
    let key_id = established(&a_events)[0].key_id;

    // The responder holds no reservation, so its key is swept when idle.
    assert!(pair.b.system.is_armed(IDLE_SESSION_TIMER));
    pair.b.manager.on_encrypted_message_received(NODE_A, key_id).unwrap();

    pair.b.advance(Duration::from_secs(15));
    assert!(pair.b.manager.key_table().lock().find(key_id, NODE_A).is_some());
    assert!(pair.b.system.is_armed(IDLE_SESSION_TIMER));

    pair.b.advance(Duration::from_secs(15));
    assert!(pair.b.manager.key_table().lock().find(key_id, NODE_A).is_none());
    assert!(!pair.b.system.is_armed(IDLE_SESSION_TIMER));

    // The initiator's reserved key is never a sweep candidate.
    pair.a.advance(Duration::from_secs(60));
    assert!(pair.a.manager.key_table().lock().find(key_id, NODE_B).is_some());
}

#[test]
fn cert_establishment_timeout_fails_attempt_once() {
    let mut node = TestNode::with_defaults(NODE_A);
    let token = node
        .manager
        .start_cert_session(CertSessionParams::new(node_target(NODE_B)))
        .unwrap();
    assert_eq!(node.manager.state(), ManagerState::CertInProgress);
    let exchange = node.exchange.take_sent()[0].exchange;

    node.advance(Duration::from_secs(30));
    let events = node.take_events();
    assert_eq!(failures(&events).len(), 1);
    assert_eq!(failures(&events)[0].token, Some(token));
    assert_eq!(failures(&events)[0].error, SecurityError::Timeout);
    assert_eq!(available_count(&events), 1);

    let reports: Vec<_> = node
        .exchange
        .take_sent()
        .into_iter()
        .filter(|m| m.profile == PROFILE_COMMON && m.msg_type == COMMON_MSG_STATUS_REPORT)
        .collect();
    assert_eq!(reports.len(), 1);
    assert_eq!(
        StatusReport::decode(&reports[0].payload).unwrap(),
        StatusReport::common(common_status::TIMEOUT)
    );
    assert_eq!(node.exchange.status(exchange), Some(ExchangeStatus::Aborted));
    assert!(node.manager.key_table().lock().is_empty());
    assert_eq!(node.manager.state(), ManagerState::Idle);
}

#[test]
fn traffic_completed_responder_key_is_swept_when_idle() {
    let mut pair = Pair::with_defaults();
    pair.a
        .manager
        .start_cert_session(CertSessionParams::new(node_target(NODE_B)))
        .unwrap();
    let request = pair.drop_outbound(Side::A).remove(0);
    pair.deliver(Side::A, request);
    let response = pair
        .drop_outbound(Side::B)
        .into_iter()
        .find(|m| m.msg_type == SecurityMsgType::CertBeginSessionResponse.as_u8())
        .unwrap();
    pair.deliver(Side::B, response);
    pair.drop_outbound(Side::A);
    let a_events = pair.a.take_events();
    let key_id = established(&a_events)[0].key_id;
    assert!(!pair.b.system.is_armed(IDLE_SESSION_TIMER));

    // Completion by traffic leaves the responder's key unreserved.
    pair.b.manager.on_encrypted_message_received(NODE_A, key_id).unwrap();
    assert_eq!(established(&pair.b.take_events()).len(), 1);
    assert!(pair.b.system.is_armed(IDLE_SESSION_TIMER));

    pair.b.advance(Duration::from_secs(15));
    pair.b.advance(Duration::from_secs(15));
    assert!(!has_key(&pair.b, key_id, NODE_A));
    assert!(!pair.b.system.is_armed(IDLE_SESSION_TIMER));
}

#[test]
fn dropped_reservation_rearms_idle_sweep() {
    let mut pair = Pair::with_defaults();
    pair.a.manager.start_password_session(password_params()).unwrap();
    pair.pump();
    let a_events = pair.a.take_events();
    let key_id = established(&a_events)[0].key_id;
    assert!(pair.b.system.is_armed(IDLE_SESSION_TIMER));

    let guard = pair.b.manager.reserve_session_key(key_id, NODE_A).unwrap();
    assert!(!pair.b.system.is_armed(IDLE_SESSION_TIMER));

    // Dropped outside the manager: the table still re-arms the sweep.
    drop(guard);
    assert!(pair.b.system.is_armed(IDLE_SESSION_TIMER));
    pair.b.advance(Duration::from_secs(15));
    assert!(has_key(&pair.b, key_id, NODE_A));
    pair.b.advance(Duration::from_secs(15));
    assert!(!has_key(&pair.b, key_id, NODE_A));
}

#[test]
fn late_idle_key_gets_a_full_period() {
    let mut pair = Pair::with_defaults();
    pair.a.manager.start_password_session(password_params()).unwrap();
    pair.pump();
    let first_events = pair.a.take_events();
    let first = established(&first_events)[0].key_id;

    pair.b.advance(Duration::from_millis(14_900));
    pair.a.manager.start_password_session(password_params()).unwrap();
    pair.pump();
    let second = established(&pair.a.take_events())[0].key_id;
    assert_ne!(first, second);

    // The armed sweep fires 200ms after the second key went idle.
    pair.b.advance(Duration::from_millis(200));
    assert!(has_key(&pair.b, second, NODE_A));

    pair.b.advance(Duration::from_secs(15));
    assert!(!has_key(&pair.b, first, NODE_A));
    assert!(!has_key(&pair.b, second, NODE_A));
}

// ── Cancel and reset ─────────────────────────────────────────────────────

#[test]
fn cancel_reports_without_token() {
    let mut node = TestNode::with_defaults(NODE_A);
    let token = node.manager.start_password_session(password_params()).unwrap();
    node.manager.cancel_session_establishment(token).unwrap();

    let events = node.take_events();
    let failure = failures(&events)[0];
    assert_eq!(failure.token, None);
    assert_eq!(failure.error, SecurityError::TransactionCanceled);
    assert_eq!(available_count(&events), 1);
    assert!(node.manager.key_table().lock().is_empty());

    assert!(matches!(
        node.manager.cancel_session_establishment(token),
        Err(SecurityError::InvalidArgument(_))
    ));
}

#[test]
fn cancel_with_foreign_token_is_refused() {
    let mut node = TestNode::with_defaults(NODE_A);
    let token = node.manager.start_password_session(password_params()).unwrap();
    let other = fabricsec::AttemptToken(token.0 + 100);
    assert!(node.manager.cancel_session_establishment(other).is_err());
    assert_eq!(node.manager.state(), ManagerState::PasswordInProgress);
}

#[test]
fn reset_is_silent_and_idempotent() {
    let mut node = TestNode::with_defaults(NODE_A);
    node.manager.start_password_session(password_params()).unwrap();
    node.manager.reset();

    let events = node.take_events();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], SecurityEvent::Available));
    assert_eq!(node.manager.state(), ManagerState::Idle);
    assert!(node.manager.key_table().lock().is_empty());
    assert!(!node.system.is_armed(ESTABLISHMENT_TIMER));

    node.manager.reset();
    assert!(node.take_events().is_empty());
}

#[test]
fn send_error_fails_attempt() {
    let mut node = TestNode::with_defaults(NODE_A);
    node.manager.start_password_session(password_params()).unwrap();
    let exchange = node.exchange.take_sent()[0].exchange;
    node.manager
        .handle_exchange_event(ExchangeEvent::SendError {
            exchange,
            error: ExchangeError::SendFailed("link down".into()),
        })
        .unwrap();

    let events = node.take_events();
    assert!(matches!(failures(&events)[0].error, SecurityError::Exchange(_)));
    assert_eq!(node.manager.state(), ManagerState::Idle);
}

// ── Shared sessions ──────────────────────────────────────────────────────

#[test]
fn shared_session_is_joined_without_a_handshake() {
    let mut pair = Pair::with_defaults();
    pair.a.manager.start_cert_session(shared_params(NodeId(0x55))).unwrap();
    pair.pump();
    let first = pair.a.take_events();
    let first_session = established(&first)[0];
    assert_eq!(first_session.peer, NodeId(0x55));
    let carried = pair.log.len();

    let token = pair.a.manager.start_cert_session(shared_params(NodeId(0x66))).unwrap();
    let second = pair.a.take_events();
    let second_session = established(&second)[0];
    assert_eq!(second_session.token, Some(token));
    assert_eq!(second_session.peer, NodeId(0x66));
    assert_eq!(second_session.key_id, first_session.key_id);
    assert_eq!(available_count(&second), 0);

    pair.pump();
    assert_eq!(pair.log.len(), carried);

    let table = pair.a.manager.key_table().lock();
    let entry = table.find(first_session.key_id, NODE_B).unwrap();
    assert!(entry.is_shared());
    assert_eq!(entry.end_nodes(), &[NodeId(0x55), NodeId(0x66)]);
    assert_eq!(entry.reserve_count(), 2);
    assert!(table.find(first_session.key_id, NodeId(0x66)).is_some());
}

#[test]
fn shared_session_under_negotiation_is_busy() {
    let mut pair = Pair::with_defaults();
    pair.a.manager.start_cert_session(shared_params(NodeId(0x55))).unwrap();
    assert_eq!(
        pair.a
            .manager
            .start_cert_session(shared_params(NodeId(0x66)))
            .unwrap_err(),
        SecurityError::Busy
    );
    pair.pump();
    assert_eq!(established(&pair.a.take_events()).len(), 1);
}

// ── Key errors and session end ───────────────────────────────────────────

#[test]
fn key_error_removes_shared_key_and_notifies_every_end_node() {
    let mut pair = Pair::with_defaults();
    pair.a.manager.start_cert_session(shared_params(NodeId(0x55))).unwrap();
    pair.pump();
    pair.a.manager.start_cert_session(shared_params(NodeId(0x66))).unwrap();
    let a_events = pair.a.take_events();
    let key_id = established(&a_events)[0].key_id;
    pair.b.take_events();

    pair.b
        .manager
        .send_key_error(
            &node_target(NODE_A),
            key_id,
            EncryptionType::Aes256Gcm,
            42,
            KeyErrorKind::KeyNotFound,
        )
        .unwrap();
    pair.pump();

    assert!(pair.a.manager.key_table().lock().find(key_id, NODE_B).is_none());
    let mut notified: Vec<_> = pair
        .a
        .exchange
        .key_failures()
        .into_iter()
        .map(|f| f.peer)
        .collect();
    notified.sort();
    assert_eq!(notified, vec![NODE_B, NodeId(0x55), NodeId(0x66)]);

    let events = pair.a.take_events();
    let report = events
        .iter()
        .find_map(|e| match e {
            SecurityEvent::KeyErrorReceived(r) => Some(r),
            _ => None,
        })
        .unwrap();
    assert_eq!(report.peer, NODE_B);
    assert_eq!(report.key_id, key_id);
    assert_eq!(report.message_id, 42);
    assert_eq!(report.error, SecurityError::KeyFromPeer(KeyErrorKind::KeyNotFound));
    assert!(SecurityManager::is_key_error(&report.error));
}

#[test]
fn key_error_for_unknown_key_notifies_reporter() {
    let mut pair = Pair::with_defaults();
    let unknown = fabricmsg::KeyId::session(0x123);
    pair.b
        .manager
        .send_key_error(
            &node_target(NODE_A),
            unknown,
            EncryptionType::Aes256Gcm,
            7,
            KeyErrorKind::WrongEncryptionType,
        )
        .unwrap();
    pair.pump();

    let failures = pair.a.exchange.key_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].peer, NODE_B);
    assert_eq!(failures[0].key_id, unknown);
    assert_eq!(failures[0].error_code, KeyErrorKind::WrongEncryptionType.code());
}

#[test]
fn key_error_with_unknown_encryption_type_still_removes_key() {
    let mut pair = Pair::with_defaults();
    pair.a.manager.start_password_session(password_params()).unwrap();
    pair.pump();
    let a_events = pair.a.take_events();
    let key_id = established(&a_events)[0].key_id;

    let report = KeyErrorMessage {
        key_id,
        raw_encryption_type: 0x7F,
        message_id: 9,
        error_code: KeyErrorKind::KeyNotFound.code(),
    };
    deliver_unsolicited(&mut pair.a, NODE_B, SecurityMsgType::KeyError, report.encode());

    assert!(!has_key(&pair.a, key_id, NODE_B));
    let failures = pair.a.exchange.key_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].peer, NODE_B);

    let events = pair.a.take_events();
    let received = events
        .iter()
        .find_map(|e| match e {
            SecurityEvent::KeyErrorReceived(r) => Some(r),
            _ => None,
        })
        .unwrap();
    assert_eq!(received.encryption_type, None);
    assert_eq!(received.message_id, 9);
}

#[test]
fn end_node_leaving_keeps_shared_session_for_others() {
    let mut pair = Pair::with_defaults();
    pair.a.manager.start_cert_session(shared_params(NodeId(0x55))).unwrap();
    pair.pump();
    pair.a.manager.start_cert_session(shared_params(NodeId(0x66))).unwrap();
    let a_events = pair.a.take_events();
    let key_id = established(&a_events)[0].key_id;

    let payload = Bytes::copy_from_slice(&key_id.raw().to_le_bytes());
    deliver_unsolicited(&mut pair.a, NodeId(0x55), SecurityMsgType::EndSession, payload.clone());
    assert!(!has_key(&pair.a, key_id, NodeId(0x55)));
    assert!(has_key(&pair.a, key_id, NodeId(0x66)));
    assert!(has_key(&pair.a, key_id, NODE_B));

    deliver_unsolicited(&mut pair.a, NodeId(0x66), SecurityMsgType::EndSession, payload);
    assert!(!has_key(&pair.a, key_id, NODE_B));
}

#[test]
fn end_session_removes_key_on_both_sides() {
    let mut pair = Pair::with_defaults();
    pair.a.manager.start_password_session(password_params()).unwrap();
    pair.pump();
    let a_events = pair.a.take_events();
    let key_id = established(&a_events)[0].key_id;
    assert!(pair.b.manager.key_table().lock().find(key_id, NODE_A).is_some());

    pair.a.manager.end_session(&node_target(NODE_B), key_id).unwrap();
    assert!(pair.a.manager.key_table().lock().find(key_id, NODE_B).is_none());
    pair.pump();
    assert!(pair.b.manager.key_table().lock().find(key_id, NODE_A).is_none());
    assert_eq!(
        pair.sent_count(Side::A, PROFILE_SECURITY, SecurityMsgType::EndSession.as_u8()),
        1
    );
}

// ── Reservations ─────────────────────────────────────────────────────────

#[test]
fn reservations_are_counted_and_released() {
    let mut pair = Pair::with_defaults();
    pair.a.manager.start_password_session(password_params()).unwrap();
    pair.pump();
    let mut a_events = pair.a.take_events();
    let key_id = established(&a_events)[0].key_id;

    let extra = pair.a.manager.reserve_session_key(key_id, NODE_B).unwrap();
    assert_eq!(
        pair.a.manager.key_table().lock().find(key_id, NODE_B).unwrap().reserve_count(),
        2
    );
    pair.a.manager.release_session_key(extra);
    assert_eq!(
        pair.a.manager.key_table().lock().find(key_id, NODE_B).unwrap().reserve_count(),
        1
    );

    // Dropping the event's reservation frees the initiator's key.
    a_events.clear();
    assert!(pair.a.manager.key_table().lock().is_empty());
    assert_eq!(
        pair.a.manager.reserve_session_key(key_id, NODE_B).unwrap_err(),
        SecurityError::KeyNotFound(key_id)
    );
}

#[test]
fn closed_connection_drops_its_keys() {
    let mut pair = Pair::with_defaults();
    pair.a
        .manager
        .start_cert_session(CertSessionParams::new(connection_target(NODE_B)))
        .unwrap();
    pair.pump();
    let a_events = pair.a.take_events();
    let session = established(&a_events)[0];
    assert_eq!(session.connection, Some(ConnectionId(1)));

    pair.a
        .manager
        .handle_exchange_event(ExchangeEvent::ConnectionClosed {
            connection: ConnectionId(1),
        })
        .unwrap();
    assert!(pair.a.manager.key_table().lock().is_empty());
}

#[test]
fn connection_close_fails_attempt_on_that_connection() {
    let mut node = TestNode::with_defaults(NODE_A);
    node.manager
        .start_cert_session(CertSessionParams::new(connection_target(NODE_B)))
        .unwrap();
    node.manager
        .handle_exchange_event(ExchangeEvent::ConnectionClosed {
            connection: ConnectionId(1),
        })
        .unwrap();
    let events = node.take_events();
    assert_eq!(failures(&events)[0].error, SecurityError::ConnectionClosed);
    assert!(node.manager.key_table().lock().is_empty());
}

#[test]
fn key_table_capacity_limits_sessions() {
    let config = SecurityConfig {
        max_session_keys: 1,
        ..SecurityConfig::default()
    };
    let mut pair = Pair::new(
        TestNode::new(NODE_A, config, delegates_for(NODE_A, fabricsec::CertType::Device)),
        TestNode::with_defaults(NODE_B),
    );
    pair.a.manager.start_password_session(password_params()).unwrap();
    pair.pump();
    let _held = pair.a.take_events();

    assert_eq!(
        pair.a.manager.start_password_session(password_params()).unwrap_err(),
        SecurityError::NoMemory
    );
    // The refused start leaves nothing behind.
    assert_eq!(pair.a.manager.state(), ManagerState::Idle);
    assert_eq!(pair.a.exchange.open_exchange_count(), 0);
}
