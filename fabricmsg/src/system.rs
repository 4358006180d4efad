//! Timer and platform hooks provided by the host event loop.

use std::time::Duration;

/// Identifies one timer owned by a client of the system layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u16);

/// Host event-loop services.
///
/// Timers are one-shot: starting an armed timer re-arms it. When a timer
/// fires the host calls back into the client that started it.
pub trait SystemLayer: Send + Sync {
    fn start_timer(&self, timer: TimerId, after: Duration);

    fn cancel_timer(&self, timer: TimerId);

    /// Called before a long-running cryptographic computation.
    fn on_expensive_crypto_start(&self) {}

    /// Called after a long-running cryptographic computation.
    fn on_expensive_crypto_end(&self) {}
}
