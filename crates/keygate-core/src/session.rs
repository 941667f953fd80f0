//! Lock/unlock state machine with a persisted deadline.
//!
//! The gate is `Unlocked` exactly while a session file exists. Expiry is
//! lazy: nothing sleeps in the background, every entry point that may act on
//! the session first compares the stored deadline with the clock.

use crate::audit::{AuditAction, AuditLog};
use crate::clock::Clock;
use crate::config::{KeygateConfig, MAX_WINDOW_SECS};
use crate::error::{KeygateError, KeygateResult};
use crate::guard::StateLock;
use crate::keyfile::atomic_replace;
use crate::store::{KeyStore, Validation};
use chrono::Duration;
use log::{debug, info, warn};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zeroize::Zeroizing;

/// One `(id, secret)` pair offered to `unlock`.
pub struct Credentials {
    pub id: String,
    pub secret: Zeroizing<String>,
}

impl Credentials {
    pub fn new(id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret: Zeroizing::new(secret.into()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Supplies credentials to `unlock`, one attempt at a time. `None` means the
/// operator gave up.
pub trait CredentialSource {
    fn next(&mut self, attempt: u32) -> KeygateResult<Option<Credentials>>;
}

impl CredentialSource for Vec<Credentials> {
    fn next(&mut self, _attempt: u32) -> KeygateResult<Option<Credentials>> {
        if self.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.remove(0)))
        }
    }
}

/// Identity of one unlock. Two unlocks with the same key are different
/// tickets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTicket {
    pub key_id: String,
    pub unlocked_at: i64,
}

/// Contents of the session file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub key_id: String,
    pub unlocked_at: i64,
    pub user: String,
    pub expires_at: i64,
}

impl Session {
    pub fn ticket(&self) -> SessionTicket {
        SessionTicket {
            key_id: self.key_id.clone(),
            unlocked_at: self.unlocked_at,
        }
    }

    fn render(&self) -> String {
        format!(
            "KEY_ID={}\nUNLOCK_TIME={}\nUSER={}\nEXPIRES_AT={}\n",
            self.key_id, self.unlocked_at, self.user, self.expires_at
        )
    }

    fn parse(text: &str, budget: Duration) -> KeygateResult<Self> {
        let mut key_id = None;
        let mut unlocked_at = None;
        let mut user = None;
        let mut expires_at = None;

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once('=')
                .ok_or_else(|| KeygateError::CorruptSession(format!("malformed line `{line}`")))?;
            match name {
                "KEY_ID" => key_id = Some(value.to_string()),
                "UNLOCK_TIME" => unlocked_at = Some(parse_epoch(name, value)?),
                "USER" => user = Some(value.to_string()),
                "EXPIRES_AT" => expires_at = Some(parse_epoch(name, value)?),
                other => debug!("ignoring unknown session field {other}"),
            }
        }

        let key_id = key_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| KeygateError::CorruptSession("KEY_ID missing".to_string()))?;
        let unlocked_at = unlocked_at
            .ok_or_else(|| KeygateError::CorruptSession("UNLOCK_TIME missing".to_string()))?;
        let expires_at = match expires_at {
            Some(at) => at,
            None => unlocked_at
                .checked_add(budget.num_seconds())
                .filter(|at| *at <= MAX_EPOCH)
                .ok_or_else(|| {
                    KeygateError::CorruptSession("UNLOCK_TIME out of range".to_string())
                })?,
        };
        Ok(Self {
            key_id,
            unlocked_at,
            user: user.unwrap_or_else(|| "unknown".to_string()),
            expires_at,
        })
    }
}

/// Last second of year 9999; anything later in a session file is garbage.
const MAX_EPOCH: i64 = 253_402_300_799;

fn parse_epoch(name: &str, value: &str) -> KeygateResult<i64> {
    let epoch = value
        .parse::<i64>()
        .map_err(|_| KeygateError::CorruptSession(format!("{name} is not epoch seconds")))?;
    if !(0..=MAX_EPOCH).contains(&epoch) {
        return Err(KeygateError::CorruptSession(format!(
            "{name} {epoch} is out of range"
        )));
    }
    Ok(epoch)
}

/// Advisory record of a failed unlock call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutMarker {
    pub set_at: i64,
    pub attempts: u32,
}

impl LockoutMarker {
    fn render(&self) -> String {
        format!("LOCKOUT_TIME={}\nATTEMPTS={}\n", self.set_at, self.attempts)
    }

    fn parse(text: &str) -> Option<Self> {
        let mut set_at = None;
        let mut attempts = None;
        for line in text.lines() {
            match line.trim().split_once('=') {
                Some(("LOCKOUT_TIME", value)) => {
                    set_at = value
                        .parse::<i64>()
                        .ok()
                        .filter(|at| (0..=MAX_EPOCH).contains(at))
                }
                Some(("ATTEMPTS", value)) => attempts = value.parse().ok(),
                _ => {}
            }
        }
        Some(Self {
            set_at: set_at?,
            attempts: attempts.unwrap_or(0),
        })
    }
}

/// Result of an `unlock` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockOutcome {
    Unlocked(SessionTicket),
    AlreadyUnlocked(SessionTicket),
    /// The key checked out but is past its expiry date.
    Expired { key_id: String },
    /// Every attempt was rejected; the lockout marker is now set.
    LockedOut { attempts: u32 },
    /// The credential source ran dry before the attempts did.
    Aborted { attempts: u32 },
    /// A fresh lockout marker is being enforced.
    Refused { retry_after_secs: i64 },
}

impl UnlockOutcome {
    pub fn is_unlocked(&self) -> bool {
        matches!(
            self,
            UnlockOutcome::Unlocked(_) | UnlockOutcome::AlreadyUnlocked(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Locked(SessionTicket),
    AlreadyLocked,
}

/// Read-only projection of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateStatus {
    Locked,
    Unlocked {
        key_id: String,
        user: String,
        elapsed: Duration,
        remaining: Duration,
    },
}

/// Two-state answer for the lookup collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    Valid,
    Locked,
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Check::Valid => f.write_str("VALID"),
            Check::Locked => f.write_str("LOCKED"),
        }
    }
}

pub struct SessionGate {
    session_path: PathBuf,
    lockout_path: PathBuf,
    lock_path: PathBuf,
    budget: Duration,
    max_attempts: u32,
    enforce_lockout: bool,
    lockout_window: Duration,
    store: Arc<KeyStore>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
}

impl SessionGate {
    pub fn new(
        config: &KeygateConfig,
        store: Arc<KeyStore>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> KeygateResult<Self> {
        let session_path = config.session_path();
        Ok(Self {
            lock_path: StateLock::path_for(&session_path),
            session_path,
            lockout_path: config.lockout_path(),
            budget: window("session.duration_secs", config.session.duration_secs)?,
            max_attempts: config.session.max_attempts.max(1),
            enforce_lockout: config.session.enforce_lockout,
            lockout_window: window("session.lockout_secs", config.session.lockout_secs)?,
            store,
            audit,
            clock,
        })
    }

    pub fn session_path(&self) -> &Path {
        &self.session_path
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// The stored session, if any. A corrupt file reads as no session.
    pub fn current(&self) -> KeygateResult<Option<Session>> {
        match self.read_session() {
            Err(KeygateError::CorruptSession(reason)) => {
                warn!("[KG1501] ignoring unreadable session file: {reason}");
                Ok(None)
            }
            other => other,
        }
    }

    /// Lazy deadline sweep. Returns the ticket it locked, if any.
    pub fn refresh(&self) -> KeygateResult<Option<SessionTicket>> {
        let session = match self.read_session() {
            Ok(Some(session)) => session,
            Ok(None) => return Ok(None),
            Err(KeygateError::CorruptSession(reason)) => {
                let _lock = StateLock::acquire(&self.lock_path)?;
                warn!("[KG1501] removing unreadable session file: {reason}");
                remove_if_present(&self.session_path)?;
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        if self.now_epoch() < session.expires_at {
            return Ok(None);
        }
        let ticket = session.ticket();
        if self.auto_lock_fire(&ticket)? {
            Ok(Some(ticket))
        } else {
            Ok(None)
        }
    }

    /// Timer callback: end the session only if it is still the one that
    /// scheduled the timer.
    pub fn auto_lock_fire(&self, ticket: &SessionTicket) -> KeygateResult<bool> {
        let _lock = StateLock::acquire(&self.lock_path)?;
        match self.current()? {
            Some(session) if session.ticket() == *ticket => {
                remove_if_present(&self.session_path)?;
                info!("session for key {} reached its deadline", ticket.key_id);
                self.audit.append(
                    AuditAction::SystemLock,
                    format!("automatic lock: session for key {} expired", ticket.key_id),
                );
                Ok(true)
            }
            _ => {
                debug!("auto-lock for key {} is stale; ignoring", ticket.key_id);
                Ok(false)
            }
        }
    }

    /// Try up to `max_attempts` credentials from `source`.
    pub fn unlock(&self, source: &mut dyn CredentialSource) -> KeygateResult<UnlockOutcome> {
        self.refresh()?;
        if let Some(session) = self.current()? {
            return Ok(UnlockOutcome::AlreadyUnlocked(session.ticket()));
        }

        if self.enforce_lockout {
            if let Some(marker) = self.lockout_marker()? {
                let retry_after = marker.set_at + self.lockout_window.num_seconds()
                    - self.now_epoch();
                if retry_after > 0 {
                    self.audit.append(
                        AuditAction::SystemLockout,
                        format!("unlock refused: lockout active for another {retry_after}s"),
                    );
                    return Ok(UnlockOutcome::Refused {
                        retry_after_secs: retry_after,
                    });
                }
            }
        }

        let mut failures = 0;
        for attempt in 1..=self.max_attempts {
            let Some(credentials) = source.next(attempt)? else {
                self.audit.append(
                    AuditAction::SystemUnlock,
                    format!("unlock aborted after {failures} failed attempt(s)"),
                );
                return Ok(UnlockOutcome::Aborted { attempts: failures });
            };

            let _lock = StateLock::acquire(&self.lock_path)?;
            match self.store.validate(&credentials.id, &credentials.secret)? {
                Validation::Valid => {
                    if let Some(existing) = self.current()? {
                        return Ok(UnlockOutcome::AlreadyUnlocked(existing.ticket()));
                    }
                    let session = self.open_session(&credentials.id)?;
                    return Ok(UnlockOutcome::Unlocked(session.ticket()));
                }
                Validation::Expired => {
                    self.audit.append(
                        AuditAction::SystemUnlock,
                        format!("unlock failed: key {} has expired", credentials.id),
                    );
                    return Ok(UnlockOutcome::Expired {
                        key_id: credentials.id,
                    });
                }
                Validation::Invalid => {
                    failures += 1;
                    debug!("unlock attempt {attempt}/{} rejected", self.max_attempts);
                }
            }
        }

        let marker = LockoutMarker {
            set_at: self.now_epoch(),
            attempts: failures,
        };
        atomic_replace(&self.lockout_path, marker.render().as_bytes())?;
        warn!("unlock locked out after {failures} failed attempts");
        self.audit.append(
            AuditAction::SystemLockout,
            format!("{failures} consecutive failed unlock attempts"),
        );
        Ok(UnlockOutcome::LockedOut { attempts: failures })
    }

    /// Manual lock. Locking a locked gate does nothing.
    pub fn lock(&self) -> KeygateResult<LockOutcome> {
        let _lock = StateLock::acquire(&self.lock_path)?;
        let session = self.current()?;
        if !remove_if_present(&self.session_path)? {
            return Ok(LockOutcome::AlreadyLocked);
        }
        let Some(session) = session else {
            return Ok(LockOutcome::AlreadyLocked);
        };
        self.audit.append(
            AuditAction::SystemLock,
            format!("manual lock: session for key {} ended", session.key_id),
        );
        Ok(LockOutcome::Locked(session.ticket()))
    }

    /// End the session if it was opened with `key_id`.
    pub fn force_lock_if(&self, key_id: &str) -> KeygateResult<bool> {
        let _lock = StateLock::acquire(&self.lock_path)?;
        match self.current()? {
            Some(session) if session.key_id == key_id => {
                remove_if_present(&self.session_path)?;
                self.audit.append(
                    AuditAction::SystemLock,
                    format!("forced lock: key {key_id} was revoked"),
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Pure projection; an overdue session still reads as unlocked with a
    /// negative `remaining` until something sweeps it.
    pub fn status(&self) -> KeygateResult<GateStatus> {
        let Some(session) = self.current()? else {
            return Ok(GateStatus::Locked);
        };
        let now = self.now_epoch();
        Ok(GateStatus::Unlocked {
            key_id: session.key_id,
            user: session.user,
            elapsed: Duration::seconds(now - session.unlocked_at),
            remaining: Duration::seconds(session.expires_at - now),
        })
    }

    pub fn check(&self) -> KeygateResult<Check> {
        Ok(match self.status()? {
            GateStatus::Unlocked { remaining, .. } if remaining > Duration::zero() => Check::Valid,
            _ => Check::Locked,
        })
    }

    /// Record that the unlocked key was used for `action`. Returns whether
    /// anything was logged.
    pub fn log_usage(&self, action: &str) -> KeygateResult<bool> {
        if self.check()? != Check::Valid {
            return Ok(false);
        }
        let Some(session) = self.current()? else {
            return Ok(false);
        };
        self.audit.append(
            AuditAction::KeyUsage,
            format!("key {} used for {action}", session.key_id),
        );
        Ok(true)
    }

    pub fn lockout_marker(&self) -> KeygateResult<Option<LockoutMarker>> {
        match fs::read_to_string(&self.lockout_path) {
            Ok(text) => Ok(LockoutMarker::parse(&text)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn open_session(&self, key_id: &str) -> KeygateResult<Session> {
        let now = self.now_epoch();
        let session = Session {
            key_id: key_id.to_string(),
            unlocked_at: now,
            user: self.audit.operator().user.clone(),
            expires_at: now + self.budget.num_seconds(),
        };
        atomic_replace(&self.session_path, session.render().as_bytes())?;
        remove_if_present(&self.lockout_path)?;

        info!("gate unlocked with key {key_id}");
        self.audit.append(
            AuditAction::SystemUnlock,
            format!(
                "unlocked with key {key_id}; auto-lock in {}s",
                self.budget.num_seconds()
            ),
        );
        Ok(session)
    }

    fn read_session(&self) -> KeygateResult<Option<Session>> {
        match fs::read_to_string(&self.session_path) {
            Ok(text) => Session::parse(&text, self.budget).map(Some),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn now_epoch(&self) -> i64 {
        self.clock.now().timestamp()
    }
}

fn window(field: &str, secs: u64) -> KeygateResult<Duration> {
    if secs > MAX_WINDOW_SECS {
        return Err(KeygateError::InvalidConfig(format!(
            "{field} must be at most {MAX_WINDOW_SECS} (got {secs})"
        )));
    }
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| KeygateError::InvalidConfig(format!("{field} is out of range")))
}

fn remove_if_present(path: &Path) -> KeygateResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::identity::Operator;
    use crate::store::IssuedKey;
    use chrono::{Local, TimeZone};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        clock: Arc<ManualClock>,
        audit: Arc<AuditLog>,
        store: Arc<KeyStore>,
        gate: SessionGate,
    }

    fn fixture_with(adjust: impl FnOnce(&mut KeygateConfig)) -> Fixture {
        let dir = tempdir().unwrap();
        let mut config = KeygateConfig::default_for(dir.path());
        config.crypto.kdf_iterations = 1;
        adjust(&mut config);
        let start = Local.with_ymd_and_hms(2026, 10, 18, 9, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let audit = Arc::new(AuditLog::new(
            config.logs_dir(),
            Operator::new("ops", "gate01"),
            clock.clone(),
        ));
        let store = Arc::new(KeyStore::new(&config, audit.clone(), clock.clone()));
        store.initialize().unwrap();
        let gate = SessionGate::new(&config, store.clone(), audit.clone(), clock.clone()).unwrap();
        Fixture {
            _dir: dir,
            clock,
            audit,
            store,
            gate,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    fn good(key: &IssuedKey) -> Credentials {
        Credentials::new(key.id.clone(), key.secret.as_str())
    }

    fn bad(key: &IssuedKey) -> Credentials {
        Credentials::new(key.id.clone(), "not-the-secret")
    }

    fn audit_lines(fx: &Fixture) -> Vec<String> {
        fx.audit.entries_for(fx.clock.now().date_naive()).unwrap()
    }

    #[test]
    fn unlock_then_status_then_lock() {
        let fx = fixture();
        let key = fx.store.generate(7).unwrap();

        let outcome = fx.gate.unlock(&mut vec![good(&key)]).unwrap();
        assert!(matches!(outcome, UnlockOutcome::Unlocked(ref t) if t.key_id == key.id));
        let mode = fs::metadata(fx.gate.session_path())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600);

        fx.clock.advance(Duration::minutes(5));
        let first = fx.gate.status().unwrap();
        fx.clock.advance(Duration::minutes(5));
        let second = fx.gate.status().unwrap();
        match (first, second) {
            (
                GateStatus::Unlocked { elapsed: e1, remaining: r1, .. },
                GateStatus::Unlocked { elapsed: e2, remaining: r2, user, .. },
            ) => {
                assert_eq!(e1, Duration::minutes(5));
                assert!(e2 > e1);
                assert!(r2 < r1);
                assert_eq!(user, "ops");
            }
            other => panic!("unexpected status {other:?}"),
        }
        assert_eq!(fx.gate.check().unwrap(), Check::Valid);

        assert!(matches!(fx.gate.lock().unwrap(), LockOutcome::Locked(_)));
        assert_eq!(fx.gate.status().unwrap(), GateStatus::Locked);
        assert_eq!(fx.gate.check().unwrap(), Check::Locked);
        assert_eq!(fx.gate.lock().unwrap(), LockOutcome::AlreadyLocked);
    }

    #[test]
    fn session_file_uses_documented_fields() {
        let fx = fixture();
        let key = fx.store.generate(7).unwrap();
        fx.gate.unlock(&mut vec![good(&key)]).unwrap();

        let text = fs::read_to_string(fx.gate.session_path()).unwrap();
        let unlocked_at = fx.clock.now().timestamp();
        assert_eq!(
            text,
            format!(
                "KEY_ID={}\nUNLOCK_TIME={unlocked_at}\nUSER=ops\nEXPIRES_AT={}\n",
                key.id,
                unlocked_at + 28_800
            )
        );
    }

    #[test]
    fn legacy_session_without_deadline_uses_budget() {
        let text = "KEY_ID=KEY_A\nUNLOCK_TIME=1000\nUSER=ops\n";
        let session = Session::parse(text, Duration::hours(8)).unwrap();
        assert_eq!(session.expires_at, 1000 + 28_800);
        assert!(Session::parse("USER=ops\n", Duration::hours(8)).is_err());
        assert!(Session::parse("KEY_ID=a\nUNLOCK_TIME=soon\n", Duration::hours(8)).is_err());
    }

    #[test]
    fn unlock_is_idempotent_while_unlocked() {
        let fx = fixture();
        let key = fx.store.generate(7).unwrap();
        let first = fx.gate.unlock(&mut vec![good(&key)]).unwrap();

        let mut nothing: Vec<Credentials> = Vec::new();
        let second = fx.gate.unlock(&mut nothing).unwrap();
        match (first, second) {
            (UnlockOutcome::Unlocked(a), UnlockOutcome::AlreadyUnlocked(b)) => assert_eq!(a, b),
            other => panic!("unexpected outcomes {other:?}"),
        }
    }

    #[test]
    fn expired_key_aborts_without_consuming_retries() {
        let fx = fixture();
        let key = fx.store.generate(1).unwrap();
        fx.clock.advance(Duration::days(2));

        let mut source = vec![good(&key), good(&key), good(&key)];
        let outcome = fx.gate.unlock(&mut source).unwrap();
        assert_eq!(
            outcome,
            UnlockOutcome::Expired {
                key_id: key.id.clone()
            }
        );
        assert_eq!(source.len(), 2);
        assert_eq!(fx.gate.lockout_marker().unwrap(), None);
        assert_eq!(fx.gate.status().unwrap(), GateStatus::Locked);
    }

    #[test]
    fn three_invalid_attempts_set_lockout() {
        let fx = fixture();
        let key = fx.store.generate(7).unwrap();

        let mut source = vec![bad(&key), bad(&key), bad(&key), good(&key)];
        let outcome = fx.gate.unlock(&mut source).unwrap();
        assert_eq!(outcome, UnlockOutcome::LockedOut { attempts: 3 });
        assert_eq!(source.len(), 1);

        let marker = fx.gate.lockout_marker().unwrap().unwrap();
        assert_eq!(marker.attempts, 3);
        assert!(audit_lines(&fx)
            .iter()
            .any(|l| l.contains("[SYSTEM_LOCKOUT]")));

        // Advisory only: a new call goes through.
        let outcome = fx.gate.unlock(&mut source).unwrap();
        assert!(outcome.is_unlocked());
        assert_eq!(fx.gate.lockout_marker().unwrap(), None);
    }

    #[test]
    fn invalid_then_valid_within_one_call_unlocks() {
        let fx = fixture();
        let key = fx.store.generate(7).unwrap();
        let outcome = fx
            .gate
            .unlock(&mut vec![bad(&key), bad(&key), good(&key)])
            .unwrap();
        assert!(matches!(outcome, UnlockOutcome::Unlocked(_)));
    }

    #[test]
    fn enforced_lockout_refuses_until_window_passes() {
        let fx = fixture_with(|cfg| {
            cfg.session.enforce_lockout = true;
            cfg.session.lockout_secs = 60;
        });
        let key = fx.store.generate(7).unwrap();
        fx.gate
            .unlock(&mut vec![bad(&key), bad(&key), bad(&key)])
            .unwrap();

        let mut source = vec![good(&key)];
        let outcome = fx.gate.unlock(&mut source).unwrap();
        assert_eq!(
            outcome,
            UnlockOutcome::Refused {
                retry_after_secs: 60
            }
        );
        assert_eq!(source.len(), 1);

        fx.clock.advance(Duration::seconds(61));
        assert!(fx.gate.unlock(&mut source).unwrap().is_unlocked());
    }

    #[test]
    fn running_out_of_credentials_aborts_without_lockout() {
        let fx = fixture();
        let key = fx.store.generate(7).unwrap();
        let outcome = fx.gate.unlock(&mut vec![bad(&key)]).unwrap();
        assert_eq!(outcome, UnlockOutcome::Aborted { attempts: 1 });
        assert_eq!(fx.gate.lockout_marker().unwrap(), None);
    }

    #[test]
    fn deadline_is_swept_lazily() {
        let fx = fixture();
        let key = fx.store.generate(7).unwrap();
        fx.gate.unlock(&mut vec![good(&key)]).unwrap();

        fx.clock.advance(Duration::hours(8) + Duration::seconds(1));
        // status is a projection: still unlocked, but overdue
        match fx.gate.status().unwrap() {
            GateStatus::Unlocked { remaining, .. } => assert!(remaining < Duration::zero()),
            other => panic!("unexpected status {other:?}"),
        }
        assert_eq!(fx.gate.check().unwrap(), Check::Locked);
        assert!(!fx.gate.log_usage("dig example.com").unwrap());

        let swept = fx.gate.refresh().unwrap().unwrap();
        assert_eq!(swept.key_id, key.id);
        assert_eq!(fx.gate.status().unwrap(), GateStatus::Locked);
        assert!(audit_lines(&fx)
            .iter()
            .any(|l| l.contains("[SYSTEM_LOCK]") && l.contains("automatic lock")));
        assert_eq!(fx.gate.refresh().unwrap(), None);
    }

    #[test]
    fn stale_timer_leaves_newer_session_alone() {
        let fx = fixture();
        let key = fx.store.generate(7).unwrap();
        let UnlockOutcome::Unlocked(old) = fx.gate.unlock(&mut vec![good(&key)]).unwrap() else {
            panic!("expected unlock");
        };
        fx.gate.lock().unwrap();
        fx.clock.advance(Duration::seconds(30));
        let UnlockOutcome::Unlocked(new) = fx.gate.unlock(&mut vec![good(&key)]).unwrap() else {
            panic!("expected unlock");
        };
        assert_ne!(old, new);

        assert!(!fx.gate.auto_lock_fire(&old).unwrap());
        assert_eq!(fx.gate.check().unwrap(), Check::Valid);
        assert!(fx.gate.auto_lock_fire(&new).unwrap());
        assert_eq!(fx.gate.check().unwrap(), Check::Locked);
    }

    #[test]
    fn force_lock_only_matches_active_key() {
        let fx = fixture();
        let a = fx.store.generate(7).unwrap();
        let b = fx.store.generate(7).unwrap();
        fx.gate.unlock(&mut vec![good(&a)]).unwrap();

        assert!(!fx.gate.force_lock_if(&b.id).unwrap());
        assert_eq!(fx.gate.check().unwrap(), Check::Valid);
        assert!(fx.gate.force_lock_if(&a.id).unwrap());
        assert_eq!(fx.gate.check().unwrap(), Check::Locked);
    }

    #[test]
    fn log_usage_only_while_unlocked() {
        let fx = fixture();
        let key = fx.store.generate(7).unwrap();
        assert!(!fx.gate.log_usage("dig example.com").unwrap());

        fx.gate.unlock(&mut vec![good(&key)]).unwrap();
        assert!(fx.gate.log_usage("dig example.com").unwrap());

        let usage: Vec<String> = audit_lines(&fx)
            .into_iter()
            .filter(|l| l.contains("[KEY_USAGE]"))
            .collect();
        assert_eq!(usage.len(), 1);
        assert!(usage[0].ends_with(&format!("key {} used for dig example.com", key.id)));
    }

    #[test]
    fn corrupt_session_reads_as_locked_and_is_swept() {
        let fx = fixture();
        atomic_replace(fx.gate.session_path(), b"garbage\n").unwrap();
        assert_eq!(fx.gate.status().unwrap(), GateStatus::Locked);
        assert_eq!(fx.gate.refresh().unwrap(), None);
        assert!(!fx.gate.session_path().exists());
    }

    #[test]
    fn out_of_range_epochs_read_as_corrupt() {
        let fx = fixture();
        for text in [
            "KEY_ID=KEY_A\nUNLOCK_TIME=1\nUSER=x\nEXPIRES_AT=9223372036854775807\n",
            "KEY_ID=KEY_A\nUNLOCK_TIME=-9223372036854775808\nUSER=x\nEXPIRES_AT=10\n",
            "KEY_ID=KEY_A\nUNLOCK_TIME=9223372036854775000\nUSER=x\n",
        ] {
            atomic_replace(fx.gate.session_path(), text.as_bytes()).unwrap();
            assert_eq!(fx.gate.status().unwrap(), GateStatus::Locked);
            assert_eq!(fx.gate.check().unwrap(), Check::Locked);
            assert!(!fx.gate.log_usage("lookup").unwrap());
            assert_eq!(fx.gate.refresh().unwrap(), None);
            assert!(!fx.gate.session_path().exists());
        }
    }

    #[test]
    fn lockout_marker_ignores_out_of_range_time() {
        assert_eq!(
            LockoutMarker::parse("LOCKOUT_TIME=9223372036854775807\nATTEMPTS=3\n"),
            None
        );
        assert_eq!(
            LockoutMarker::parse("LOCKOUT_TIME=100\nATTEMPTS=3\n"),
            Some(LockoutMarker {
                set_at: 100,
                attempts: 3
            })
        );
    }

    #[test]
    fn oversized_windows_are_rejected() {
        let dir = tempdir().unwrap();
        let mut config = KeygateConfig::default_for(dir.path());
        let clock = Arc::new(ManualClock::new(Local::now()));
        let audit = Arc::new(AuditLog::new(
            config.logs_dir(),
            Operator::new("ops", "gate01"),
            clock.clone(),
        ));
        let store = Arc::new(KeyStore::new(&config, audit.clone(), clock.clone()));

        config.session.duration_secs = u64::MAX;
        let err = SessionGate::new(&config, store.clone(), audit.clone(), clock.clone())
            .err()
            .unwrap();
        assert_eq!(err.code(), "KG1100");

        config.session.duration_secs = MAX_WINDOW_SECS;
        config.session.lockout_secs = MAX_WINDOW_SECS + 1;
        assert!(SessionGate::new(&config, store.clone(), audit.clone(), clock.clone()).is_err());

        config.session.lockout_secs = 300;
        let gate = SessionGate::new(&config, store, audit, clock).unwrap();
        assert_eq!(gate.budget(), Duration::seconds(MAX_WINDOW_SECS as i64));
    }
}
