//! Append-only audit trail, one file per calendar day.

use crate::clock::Clock;
use crate::identity::Operator;
use crate::keyfile::append_private_file;
use chrono::NaiveDate;
use log::warn;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Tag written in the second bracket of every audit line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    SystemInit,
    KeyGenerate,
    KeyValidate,
    KeyRevoke,
    SystemUnlock,
    SystemLock,
    SystemLockout,
    KeyUsage,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::SystemInit => "SYSTEM_INIT",
            AuditAction::KeyGenerate => "KEY_GENERATE",
            AuditAction::KeyValidate => "KEY_VALIDATE",
            AuditAction::KeyRevoke => "KEY_REVOKE",
            AuditAction::SystemUnlock => "SYSTEM_UNLOCK",
            AuditAction::SystemLock => "SYSTEM_LOCK",
            AuditAction::SystemLockout => "SYSTEM_LOCKOUT",
            AuditAction::KeyUsage => "KEY_USAGE",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct AuditLog {
    dir: PathBuf,
    operator: Operator,
    clock: Arc<dyn Clock>,
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>, operator: Operator, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: dir.into(),
            operator,
            clock,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn operator(&self) -> &Operator {
        &self.operator
    }

    /// File holding the entries for `day`.
    pub fn path_for(&self, day: NaiveDate) -> PathBuf {
        self.dir.join(format!("keygate_{}.log", day.format("%Y%m%d")))
    }

    /// Record one event. Best effort: a failed write is reported through the
    /// diagnostic logger and never bubbles up to the caller.
    pub fn append(&self, action: AuditAction, detail: impl AsRef<str>) {
        let now = self.clock.now();
        let line = format!(
            "[{}] [{}] [{}] {}\n",
            now.format("%Y-%m-%d %H:%M:%S"),
            action,
            self.operator,
            sanitize(detail.as_ref())
        );
        let path = self.path_for(now.date_naive());
        if let Err(err) = append_private_file(&path, line.as_bytes()) {
            warn!(
                "[{}] audit write to {} failed for {action}: {err}",
                err.code(),
                path.display()
            );
        }
    }

    /// Lines recorded on `day`, oldest first. A day with no log is empty.
    pub fn entries_for(&self, day: NaiveDate) -> io::Result<Vec<String>> {
        match fs::read_to_string(self.path_for(day)) {
            Ok(contents) => Ok(contents.lines().map(str::to_string).collect()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }
}

// One event per line, whatever the caller passes in.
fn sanitize(detail: &str) -> String {
    detail
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect()
}
