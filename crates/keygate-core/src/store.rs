//! Encrypted key records: issuance, validation, listing, and revocation.
//!
//! The store is a text file with one `id:base64blob` line per key. Each blob
//! is a [`CryptoBox`] sealing `secret|YYYY-MM-DD` under the master key, so
//! neither the secret nor the expiry is readable without it.

use crate::audit::{AuditAction, AuditLog};
use crate::clock::Clock;
use crate::config::KeygateConfig;
use crate::crypto::CryptoBox;
use crate::error::{KeygateError, KeygateResult};
use crate::guard::StateLock;
use crate::keyfile::{
    append_private_file, atomic_replace, read_master_key, write_master_key,
    write_private_file, MASTER_KEY_MIN_LEN,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{Days, NaiveDate};
use log::{debug, info, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

const FIELD_SEPARATOR: char = '|';
const DATE_FORMAT: &str = "%Y-%m-%d";
const ID_SUFFIX_BYTES: usize = 4;

/// Outcome of presenting a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    Valid,
    Invalid,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Active,
    Expired,
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStatus::Active => f.write_str("ACTIVE"),
            KeyStatus::Expired => f.write_str("EXPIRED"),
        }
    }
}

/// What `list` may reveal about a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySummary {
    pub id: String,
    pub expiry: NaiveDate,
    pub status: KeyStatus,
}

/// A freshly issued credential. The secret exists only in this value.
#[derive(Debug)]
pub struct IssuedKey {
    pub id: String,
    pub secret: Zeroizing<String>,
    pub expiry: NaiveDate,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    id: String,
    blob: String,
}

impl StoredRecord {
    fn to_line(&self) -> String {
        format!("{}:{}\n", self.id, self.blob)
    }
}

// Decrypted contents of a record.
struct Sealed {
    secret: Zeroizing<String>,
    expiry: NaiveDate,
}

pub struct KeyStore {
    store_path: PathBuf,
    master_key_path: PathBuf,
    lock_path: PathBuf,
    crypto: CryptoBox,
    secret_bytes: usize,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
}

impl KeyStore {
    pub fn new(config: &KeygateConfig, audit: Arc<AuditLog>, clock: Arc<dyn Clock>) -> Self {
        let store_path = config.store_path();
        Self {
            lock_path: StateLock::path_for(&store_path),
            store_path,
            master_key_path: config.master_key_path(),
            crypto: CryptoBox::new(config.crypto.kdf_iterations),
            secret_bytes: config.keys.secret_bytes,
            audit,
            clock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.store_path
    }

    /// Create the master key and an empty store if they are missing.
    /// Returns `true` when this call created the master key.
    pub fn initialize(&self) -> KeygateResult<bool> {
        if self.master_key_path.exists() && self.store_path.exists() {
            return Ok(false);
        }

        let _lock = StateLock::acquire(&self.lock_path)?;
        let mut created = false;
        if !self.master_key_path.exists() {
            let mut key = Zeroizing::new(vec![0u8; MASTER_KEY_MIN_LEN]);
            OsRng.fill_bytes(&mut key[..]);
            write_master_key(&self.master_key_path, &key)?;
            created = true;
        }
        if !self.store_path.exists() {
            write_private_file(&self.store_path, b"")?;
        }

        if created {
            info!("initialized master key at {}", self.master_key_path.display());
            self.audit.append(
                AuditAction::SystemInit,
                format!("master key and key store created under {}", self.store_path.display()),
            );
        }
        Ok(created)
    }

    /// Issue a key valid through `today + expiry_days`.
    pub fn generate(&self, expiry_days: u32) -> KeygateResult<IssuedKey> {
        let today = self.today();
        let expiry = today
            .checked_add_days(Days::new(u64::from(expiry_days)))
            .ok_or_else(|| {
                KeygateError::InvalidConfig(format!("expiry of {expiry_days} days is out of range"))
            })?;
        self.generate_until(expiry)
    }

    /// Issue a key valid through `expiry` inclusive.
    pub fn generate_until(&self, expiry: NaiveDate) -> KeygateResult<IssuedKey> {
        let master = read_master_key(&self.master_key_path)?;
        let _lock = StateLock::acquire(&self.lock_path)?;

        let taken: HashSet<String> = self.read_records()?.into_iter().map(|r| r.id).collect();
        let id = loop {
            let candidate = self.new_id();
            if !taken.contains(&candidate) {
                break candidate;
            }
            debug!("key id {candidate} already issued; rerolling suffix");
        };

        let mut raw = Zeroizing::new(vec![0u8; self.secret_bytes]);
        OsRng.fill_bytes(&mut raw[..]);
        let secret = Zeroizing::new(hex::encode(&raw[..]));

        let plaintext = Zeroizing::new(format!(
            "{}{FIELD_SEPARATOR}{}",
            secret.as_str(),
            expiry.format(DATE_FORMAT)
        ));
        let blob = self.crypto.encrypt(plaintext.as_bytes(), &master)?;
        let record = StoredRecord {
            id: id.clone(),
            blob: STANDARD.encode(blob),
        };
        append_private_file(&self.store_path, record.to_line().as_bytes())?;

        self.audit.append(
            AuditAction::KeyGenerate,
            format!("generated key {id} valid through {}", expiry.format(DATE_FORMAT)),
        );
        Ok(IssuedKey { id, secret, expiry })
    }

    /// Check a presented credential. Unknown ids, undecryptable records, and
    /// wrong secrets are all `Invalid`; `Expired` needs the right secret.
    pub fn validate(&self, id: &str, secret: &str) -> KeygateResult<Validation> {
        let records = self.read_records()?;
        let Some(record) = records.iter().find(|r| r.id == id) else {
            self.audit
                .append(AuditAction::KeyValidate, format!("{id}: key id not found"));
            return Ok(Validation::Invalid);
        };

        let master = read_master_key(&self.master_key_path)?;
        let sealed = match self.open(record, &master) {
            Ok(sealed) => sealed,
            Err(_) => {
                self.audit
                    .append(AuditAction::KeyValidate, format!("{id}: invalid credentials"));
                return Ok(Validation::Invalid);
            }
        };

        let matches: bool = sealed.secret.as_bytes().ct_eq(secret.as_bytes()).into();
        if !matches {
            self.audit
                .append(AuditAction::KeyValidate, format!("{id}: invalid credentials"));
            return Ok(Validation::Invalid);
        }

        if sealed.expiry < self.today() {
            self.audit.append(
                AuditAction::KeyValidate,
                format!("{id}: key expired on {}", sealed.expiry.format(DATE_FORMAT)),
            );
            return Ok(Validation::Expired);
        }

        self.audit
            .append(AuditAction::KeyValidate, format!("{id}: credentials accepted"));
        Ok(Validation::Valid)
    }

    /// Every record that still opens, in store order. Secrets stay sealed.
    pub fn list(&self) -> KeygateResult<Vec<KeySummary>> {
        let records = self.read_records()?;
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let master = read_master_key(&self.master_key_path)?;
        let today = self.today();

        Ok(records
            .iter()
            .filter_map(|record| match self.open(record, &master) {
                Ok(sealed) => Some(KeySummary {
                    id: record.id.clone(),
                    expiry: sealed.expiry,
                    status: if sealed.expiry < today {
                        KeyStatus::Expired
                    } else {
                        KeyStatus::Active
                    },
                }),
                Err(_) => {
                    debug!("skipping unreadable record {}", record.id);
                    None
                }
            })
            .collect())
    }

    /// Remove `id` permanently. The store is rewritten to a temp file and
    /// renamed into place.
    pub fn revoke(&self, id: &str) -> KeygateResult<()> {
        let _lock = StateLock::acquire(&self.lock_path)?;
        let records = self.read_records()?;
        if !records.iter().any(|r| r.id == id) {
            self.audit.append(
                AuditAction::KeyRevoke,
                format!("{id}: revoke failed, key id not found"),
            );
            return Err(KeygateError::NotFound(id.to_string()));
        }

        let remaining: String = records
            .iter()
            .filter(|r| r.id != id)
            .map(StoredRecord::to_line)
            .collect();
        atomic_replace(&self.store_path, remaining.as_bytes())?;

        self.audit
            .append(AuditAction::KeyRevoke, format!("{id}: key revoked"));
        Ok(())
    }

    pub fn contains(&self, id: &str) -> KeygateResult<bool> {
        Ok(self.read_records()?.iter().any(|r| r.id == id))
    }

    pub fn len(&self) -> KeygateResult<usize> {
        Ok(self.read_records()?.len())
    }

    pub fn is_empty(&self) -> KeygateResult<bool> {
        Ok(self.len()? == 0)
    }

    fn today(&self) -> NaiveDate {
        self.clock.now().date_naive()
    }

    fn new_id(&self) -> String {
        let mut suffix = [0u8; ID_SUFFIX_BYTES];
        OsRng.fill_bytes(&mut suffix);
        format!(
            "KEY_{}_{}",
            self.clock.now().format("%Y%m%d%H%M%S"),
            hex::encode(suffix)
        )
    }

    fn read_records(&self) -> KeygateResult<Vec<StoredRecord>> {
        let contents = match fs::read_to_string(&self.store_path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut records = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_record(index + 1, line) {
                Ok(record) => records.push(record),
                Err(err) => warn!("[{}] {err}", err.code()),
            }
        }
        Ok(records)
    }

    fn open(&self, record: &StoredRecord, master: &[u8]) -> KeygateResult<Sealed> {
        let blob = STANDARD
            .decode(record.blob.as_bytes())
            .map_err(|_| KeygateError::Decryption)?;
        let plaintext = self.crypto.decrypt(&blob, master)?;
        let text = std::str::from_utf8(&plaintext).map_err(|_| KeygateError::Decryption)?;
        let (secret, expiry) = text
            .rsplit_once(FIELD_SEPARATOR)
            .ok_or(KeygateError::Decryption)?;
        let expiry =
            NaiveDate::parse_from_str(expiry, DATE_FORMAT).map_err(|_| KeygateError::Decryption)?;
        Ok(Sealed {
            secret: Zeroizing::new(secret.to_string()),
            expiry,
        })
    }
}

fn parse_record(line_no: usize, line: &str) -> KeygateResult<StoredRecord> {
    let (id, blob) = line
        .split_once(':')
        .ok_or_else(|| KeygateError::CorruptRecord {
            line: line_no,
            reason: "missing `:` separator".to_string(),
        })?;
    if id.is_empty() || blob.is_empty() {
        return Err(KeygateError::CorruptRecord {
            line: line_no,
            reason: "empty id or blob".to_string(),
        });
    }
    Ok(StoredRecord {
        id: id.to_string(),
        blob: blob.to_string(),
    })
}
