pub mod audit;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod guard;
pub mod identity;
pub mod keyfile;
pub mod logging;
pub mod service;
pub mod session;
pub mod store;

pub use audit::{AuditAction, AuditLog};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigFormat, CryptoCfg, DaemonCfg, KeygateConfig, KeysCfg, Paths, SessionCfg};
pub use crypto::CryptoBox;
pub use error::{KeygateError, KeygateResult};
pub use identity::Operator;
pub use service::{Keygate, RevokeReport};
pub use session::{
    Check, CredentialSource, Credentials, GateStatus, LockOutcome, LockoutMarker, Session,
    SessionGate, SessionTicket, UnlockOutcome,
};
pub use store::{IssuedKey, KeyStatus, KeyStore, KeySummary, Validation};
