//! Diagnostic logging bootstrap shared by the keygate binaries.
//!
//! Diagnostics go to stderr, tagged with the binary that emitted them so the
//! CLI and the supervisor can share one journal. Security events never pass
//! through here; they are written by [`crate::audit::AuditLog`].

use env_logger::{Env, Target};
use log::Record;
use serde_json::json;
use std::env;
use std::io::Write;
use std::process;
use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

const FORMAT_ENV: &str = "KEYGATE_LOG_FORMAT";
const LEVEL_ENV: &str = "KEYGATE_LOG_LEVEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

impl LogFormat {
    /// Anything other than `plain` (case-insensitive) selects JSON.
    pub fn from_setting(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("plain") => LogFormat::Plain,
            _ => LogFormat::Json,
        }
    }
}

/// Initialize the global logger for `component` (e.g. `keygate-cli`).
///
/// The first caller wins. `RUST_LOG` takes precedence, then
/// `KEYGATE_LOG_LEVEL`, then `default_level`.
pub fn init(component: &'static str, default_level: &str) {
    let _ = INIT.get_or_init(|| configure(component, default_level));
}

fn configure(component: &'static str, default_level: &str) {
    let level = env::var(LEVEL_ENV).unwrap_or_else(|_| default_level.to_string());
    let format = LogFormat::from_setting(env::var(FORMAT_ENV).ok().as_deref());

    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or(level));
    builder.target(Target::Stderr);
    let pid = process::id();
    match format {
        LogFormat::Json => builder.format(move |buf, record| {
            let line = json_line(component, pid, &buf.timestamp().to_string(), record);
            writeln!(buf, "{line}")
        }),
        LogFormat::Plain => builder.format(move |buf, record| {
            writeln!(
                buf,
                "{} {component}[{pid}] {}: {}",
                buf.timestamp(),
                record.level().as_str().to_lowercase(),
                record.args()
            )
        }),
    };

    if let Err(err) = builder.try_init() {
        eprintln!("{component}: logger already set: {err}");
    }
}

fn json_line(component: &str, pid: u32, timestamp: &str, record: &Record<'_>) -> String {
    json!({
        "ts": timestamp,
        "level": record.level().as_str().to_lowercase(),
        "component": component,
        "pid": pid,
        "target": record.target(),
        "msg": record.args().to_string(),
    })
    .to_string()
}
