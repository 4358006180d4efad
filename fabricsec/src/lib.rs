// fabricsec -- security session manager for fabric nodes
//
// Crate root: module declarations and public re-exports.
//
// The manager establishes authenticated session keys with peers over the
// exchange layer in `fabricmsg`:
// - password sessions (PAKE-style, optional responder key confirmation)
// - certificate sessions, including shared sessions through a terminating node
// - token authentication with optional re-authentication
// - key export from a peer's key store
// and keeps the resulting keys in a reservation-counted table.

pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod event;
pub mod key_error;
pub mod key_table;
pub mod manager;
pub mod message;
pub mod status_report;
pub mod types;

// Re-export key types at crate root for convenience.
pub use config::{AuthDelegates, SecurityConfig};
pub use error::{Result, SecurityError};
pub use event::{
    EstablishedSession, ExportedKey, KeyErrorReport, SecurityEvent, SessionFailure,
};
pub use key_error::KeyErrorKind;
pub use key_table::{KeyReservation, SessionKey, SessionKeyTable, SharedKeyTable};
pub use manager::{
    CertSessionParams, KeyExportParams, PasswordSessionParams, SecurityManager,
    TokenSessionParams, ESTABLISHMENT_TIMER, IDLE_SESSION_TIMER,
};
pub use message::SecurityMsgType;
pub use status_report::StatusReport;
pub use types::{AttemptToken, AuthMode, CertType, ManagerState, PasswordSource};
