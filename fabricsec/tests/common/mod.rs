// Two-node harness for session manager integration tests.
//
// Each node runs a SecurityManager over its own in-memory exchange layer and
// virtual clock. `Pair::pump` carries messages and acknowledgements between
// the layers until both sides are quiet.

#![allow(dead_code)]

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use fabricmsg::memory::{ExchangeStatus, ManualSystemLayer, MemoryExchangeLayer, SentMessage};
use fabricmsg::{
    ConnectionId, ExchangeEvent, ExchangeId, ExchangeLayer, ExchangeTarget, InboundMessage,
    NodeId, SendFlags, SystemLayer,
};
use fabricsec::crypto::keys::IdentityKeyPair;
use fabricsec::engine::cert::{NodeCredentials, TrustAnchorDelegate};
use fabricsec::engine::key_export::StaticKeyExport;
use fabricsec::engine::password::StaticPassword;
use fabricsec::engine::token::MemoryTokenStore;
use fabricsec::{
    AuthDelegates, CertType, PasswordSource, SecurityConfig, SecurityEvent, SecurityManager,
};

pub const NODE_A: NodeId = NodeId(0x0A);
pub const NODE_B: NodeId = NodeId(0x0B);
pub const PASSWORD: &[u8] = b"2021-pairing";
pub const TOKEN_ID: u64 = 0x7070;
pub const TOKEN_KEY: [u8; 32] = [0x5A; 32];
pub const EXPORT_KEY_ID: u32 = 0x0001_0001;
pub const EXPORT_KEY: &[u8] = b"exported application key";

const ANCHOR_SEED: [u8; 32] = [0x11; 32];

pub fn anchor() -> IdentityKeyPair {
    IdentityKeyPair::from_seed(&ANCHOR_SEED)
}

/// Delegates for every protocol, with certificates issued by a shared anchor.
pub fn delegates_for(node: NodeId, cert_type: CertType) -> AuthDelegates {
    let anchor = anchor();
    let credentials = NodeCredentials::issue(&anchor, node, cert_type);
    let tokens = if node == NODE_B {
        MemoryTokenStore::new().with_local_token(TOKEN_ID, TOKEN_KEY)
    } else {
        MemoryTokenStore::new().with_known_token(TOKEN_ID, TOKEN_KEY)
    };
    AuthDelegates {
        password: Some(Arc::new(StaticPassword::new(PasswordSource::PairingCode, PASSWORD))),
        cert: Some(Arc::new(TrustAnchorDelegate::new(
            credentials,
            anchor.public_key_bytes(),
        ))),
        token: Some(Arc::new(tokens)),
        key_export: Some(Arc::new(
            StaticKeyExport::new()
                .with_key(EXPORT_KEY_ID, EXPORT_KEY)
                .authorize(NODE_A),
        )),
    }
}

pub fn node_target(peer: NodeId) -> ExchangeTarget {
    ExchangeTarget::Node { peer, addr: None }
}

pub fn connection_target(peer: NodeId) -> ExchangeTarget {
    ExchangeTarget::Connection {
        connection: ConnectionId(1),
        peer,
    }
}

pub struct TestNode {
    pub id: NodeId,
    pub manager: SecurityManager,
    pub exchange: Arc<MemoryExchangeLayer>,
    pub system: Arc<ManualSystemLayer>,
    pub events: Vec<SecurityEvent>,
}

impl TestNode {
    pub fn new(id: NodeId, config: SecurityConfig, delegates: AuthDelegates) -> Self {
        let exchange = Arc::new(MemoryExchangeLayer::new());
        let system = Arc::new(ManualSystemLayer::new());
        let mut manager = SecurityManager::new(id, config, delegates).unwrap();
        let exchange_layer: Arc<dyn ExchangeLayer> = exchange.clone();
        let system_layer: Arc<dyn SystemLayer> = system.clone();
        manager.init(exchange_layer, system_layer).unwrap();
        Self {
            id,
            manager,
            exchange,
            system,
            events: Vec::new(),
        }
    }

    pub fn with_defaults(id: NodeId) -> Self {
        Self::new(id, test_config(), delegates_for(id, CertType::Device))
    }

    pub fn collect(&mut self) {
        self.events.extend(self.manager.drain_events());
    }

    pub fn take_events(&mut self) -> Vec<SecurityEvent> {
        self.collect();
        mem::take(&mut self.events)
    }

    /// Advance the virtual clock and deliver fired timers.
    pub fn advance(&mut self, by: Duration) {
        for timer in self.system.advance(by) {
            self.manager.handle_timer(timer).unwrap();
        }
        self.collect();
    }
}

pub fn test_config() -> SecurityConfig {
    SecurityConfig::default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    A,
    B,
}

impl Side {
    fn other(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }
}

pub struct Pair {
    pub a: TestNode,
    pub b: TestNode,
    /// Sender-side exchange to receiver-side exchange.
    routes: HashMap<(Side, ExchangeId), ExchangeId>,
    /// Every message carried, in order.
    pub log: Vec<(Side, SentMessage)>,
}

impl Pair {
    pub fn new(a: TestNode, b: TestNode) -> Self {
        Self {
            a,
            b,
            routes: HashMap::new(),
            log: Vec::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(TestNode::with_defaults(NODE_A), TestNode::with_defaults(NODE_B))
    }

    pub fn node(&mut self, side: Side) -> &mut TestNode {
        match side {
            Side::A => &mut self.a,
            Side::B => &mut self.b,
        }
    }

    /// Carry messages and acknowledgements until both sides are quiet.
    /// Returns the number of messages delivered.
    pub fn pump(&mut self) -> usize {
        let mut delivered = 0;
        loop {
            let mut progressed = false;
            for side in [Side::A, Side::B] {
                let sent = self.node(side).exchange.take_sent();
                for msg in sent {
                    self.deliver(side, msg);
                    delivered += 1;
                    progressed = true;
                }
                let acks = self.node(side).exchange.take_acks();
                for ack in acks {
                    self.deliver_ack(side, ack.exchange, ack.message_id);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        self.a.collect();
        self.b.collect();
        delivered
    }

    /// Discard everything `side` has sent but not yet delivered.
    pub fn drop_outbound(&mut self, side: Side) -> Vec<SentMessage> {
        let node = self.node(side);
        node.exchange.take_acks();
        node.exchange.take_sent()
    }

    pub fn deliver(&mut self, from: Side, msg: SentMessage) {
        let to = from.other();
        let sender_id = self.node(from).id;
        let existing = self.routes.get(&(from, msg.exchange)).copied();
        let receiver = match existing {
            Some(id) if self.node(to).exchange.status(id) == Some(ExchangeStatus::Open) => id,
            _ => {
                let id = self.node(to).exchange.accept_exchange(sender_id, msg.connection);
                self.routes.insert((from, msg.exchange), id);
                self.routes.insert((to, id), msg.exchange);
                id
            }
        };

        let ack_requested = msg.flags.contains(SendFlags::REQUEST_ACK);
        let node = self.node(to);
        node.exchange
            .note_received(receiver, msg.message_id, ack_requested);
        let inbound = InboundMessage {
            exchange: receiver,
            peer: sender_id,
            connection: msg.connection,
            profile: msg.profile,
            msg_type: msg.msg_type,
            message_id: msg.message_id,
            key_id: msg.key_id,
            encryption_type: msg.encryption_type,
            ack_requested,
            payload: msg.payload.clone(),
        };
        node.manager.handle_message(inbound).unwrap();
        node.collect();
        self.log.push((from, msg));
    }

    fn deliver_ack(&mut self, from: Side, exchange: ExchangeId, message_id: u32) {
        let Some(&target) = self.routes.get(&(from, exchange)) else {
            return;
        };
        let node = self.node(from.other());
        if node.exchange.acknowledge(target, message_id) {
            node.manager
                .handle_exchange_event(ExchangeEvent::AckReceived {
                    exchange: target,
                    message_id,
                })
                .unwrap();
            node.collect();
        }
    }

    /// Messages `from` sent with `profile`/`msg_type`.
    pub fn sent_count(&self, from: Side, profile: u32, msg_type: u8) -> usize {
        self.log
            .iter()
            .filter(|(side, m)| *side == from && m.profile == profile && m.msg_type == msg_type)
            .count()
    }
}

pub fn established(events: &[SecurityEvent]) -> Vec<&fabricsec::EstablishedSession> {
    events
        .iter()
        .filter_map(|e| match e {
            SecurityEvent::SessionEstablished(s) => Some(s),
            _ => None,
        })
        .collect()
}

pub fn failures(events: &[SecurityEvent]) -> Vec<&fabricsec::SessionFailure> {
    events
        .iter()
        .filter_map(|e| match e {
            SecurityEvent::SessionFailed(f) | SecurityEvent::KeyExportFailed(f) => Some(f),
            _ => None,
        })
        .collect()
}

pub fn available_count(events: &[SecurityEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, SecurityEvent::Available))
        .count()
}
