//! High-level gate service wiring config, audit log, key store, and session.

use crate::audit::AuditLog;
use crate::clock::{Clock, SystemClock};
use crate::config::KeygateConfig;
use crate::error::{KeygateError, KeygateResult};
use crate::identity::Operator;
use crate::session::{
    Check, CredentialSource, GateStatus, LockOutcome, SessionGate, SessionTicket, UnlockOutcome,
};
use crate::store::{IssuedKey, KeyStore, KeySummary, Validation};
use log::info;
use std::sync::Arc;

/// Result of a revoke that succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokeReport {
    pub key_id: String,
    /// The revoked key held the active session, which is now closed.
    pub session_closed: bool,
}

/// Every operation the CLI and the daemon need, over one shared config.
pub struct Keygate {
    config: Arc<KeygateConfig>,
    audit: Arc<AuditLog>,
    store: Arc<KeyStore>,
    gate: SessionGate,
    clock: Arc<dyn Clock>,
}

impl Keygate {
    /// Open the gate described by `config` on the wall clock, creating the
    /// master key and store on first use.
    pub fn open(config: Arc<KeygateConfig>) -> KeygateResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock), Operator::current())
    }

    /// Same as [`Keygate::open`] with an injected clock and operator.
    pub fn with_clock(
        config: Arc<KeygateConfig>,
        clock: Arc<dyn Clock>,
        operator: Operator,
    ) -> KeygateResult<Self> {
        let audit = Arc::new(AuditLog::new(config.logs_dir(), operator, clock.clone()));
        let store = Arc::new(KeyStore::new(&config, audit.clone(), clock.clone()));
        store.initialize()?;
        let gate = SessionGate::new(&config, store.clone(), audit.clone(), clock.clone())?;
        Ok(Self {
            config,
            audit,
            store,
            gate,
            clock,
        })
    }

    pub fn config(&self) -> &KeygateConfig {
        &self.config
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn store(&self) -> &KeyStore {
        &self.store
    }

    pub fn gate(&self) -> &SessionGate {
        &self.gate
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Issue a key; `None` uses the configured default lifetime.
    pub fn generate(&self, expiry_days: Option<u32>) -> KeygateResult<IssuedKey> {
        let days = expiry_days.unwrap_or(self.config.keys.default_expiry_days);
        let issued = self.store.generate(days)?;
        info!("issued key {} valid through {}", issued.id, issued.expiry);
        Ok(issued)
    }

    pub fn validate(&self, id: &str, secret: &str) -> KeygateResult<Validation> {
        self.store.validate(id, secret)
    }

    pub fn list(&self) -> KeygateResult<Vec<KeySummary>> {
        self.store.list()
    }

    /// Remove a key and close the session it holds, if any.
    pub fn revoke(&self, id: Option<&str>) -> KeygateResult<RevokeReport> {
        let id = id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| KeygateError::MissingArgument("key id".to_string()))?;
        self.store.revoke(id)?;
        // Store lock is released here; the session lock is taken on its own.
        let session_closed = self.gate.force_lock_if(id)?;
        Ok(RevokeReport {
            key_id: id.to_string(),
            session_closed,
        })
    }

    pub fn unlock(&self, source: &mut dyn CredentialSource) -> KeygateResult<UnlockOutcome> {
        self.gate.unlock(source)
    }

    pub fn lock(&self) -> KeygateResult<LockOutcome> {
        self.gate.lock()
    }

    pub fn refresh(&self) -> KeygateResult<Option<SessionTicket>> {
        self.gate.refresh()
    }

    /// Sweep an overdue session, then report.
    pub fn status(&self) -> KeygateResult<GateStatus> {
        self.gate.refresh()?;
        self.gate.status()
    }

    /// Sweep an overdue session, then answer `VALID` or `LOCKED`.
    pub fn check(&self) -> KeygateResult<Check> {
        self.gate.refresh()?;
        self.gate.check()
    }

    pub fn log_usage(&self, action: &str) -> KeygateResult<bool> {
        self.gate.refresh()?;
        self.gate.log_usage(action)
    }
}
