use std::env;
use std::ffi::CStr;
use std::fmt;

const UNKNOWN: &str = "unknown";

/// Who is acting and where, as recorded in sessions and audit lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operator {
    pub user: String,
    pub host: String,
}

impl Operator {
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
        }
    }

    /// Resolve from the process environment and the kernel hostname.
    pub fn current() -> Self {
        Self {
            user: current_user(),
            host: current_host(),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

fn current_user() -> String {
    ["USER", "LOGNAME"]
        .iter()
        .filter_map(|var| env::var(var).ok())
        .find(|value| !value.trim().is_empty())
        .unwrap_or_else(|| UNKNOWN.to_string())
}

fn current_host() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return UNKNOWN.to_string();
    }
    // gethostname may not terminate on truncation.
    buf[buf.len() - 1] = 0;
    match CStr::from_bytes_until_nul(&buf) {
        Ok(name) if !name.to_bytes().is_empty() => name.to_string_lossy().into_owned(),
        _ => UNKNOWN.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_user_at_host() {
        assert_eq!(Operator::new("ops", "gate01").to_string(), "ops@gate01");
    }

    #[test]
    fn current_always_has_values() {
        let op = Operator::current();
        assert!(!op.user.is_empty());
        assert!(!op.host.is_empty());
    }
}
