//! fabricmsg -- message exchange layer for the fabric security stack.
//!
//! Provides the contracts a session-establishment client consumes:
//! - **Exchanges**: request/response conversations over a connection or over
//!   acknowledged datagrams ([`ExchangeLayer`], [`OwnedExchange`])
//! - **System services**: one-shot timers and crypto-cost hooks ([`SystemLayer`])
//! - **Reliable messaging**: acknowledgement tracking and retransmission
//! - **In-memory layers** for running clients deterministically

pub mod error;
pub mod exchange;
pub mod ids;
pub mod memory;
pub mod message;
pub mod retransmission;
pub mod system;

pub use error::{ExchangeError, Result};
pub use exchange::{ExchangeEvent, ExchangeInfo, ExchangeLayer, ExchangeTarget, OwnedExchange};
pub use ids::{ConnectionId, EncryptionType, ExchangeId, KeyId, NodeId};
pub use message::{InboundMessage, ProfileId, SendFlags, PROFILE_COMMON, PROFILE_SECURITY};
pub use system::{SystemLayer, TimerId};
