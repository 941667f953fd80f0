//! keygate command-line dispatcher: key issuance, unlock sessions, and audit access.

use anyhow::{Context, Result};
use chrono::{Duration, Local, NaiveDate};
use clap::{ArgGroup, Parser};
use keygate_core::{
    logging, Check, CredentialSource, Credentials, GateStatus, Keygate, KeygateConfig,
    KeygateError, KeygateResult, KeySummary, LockOutcome, UnlockOutcome,
};
use log::debug;
use rpassword::prompt_password;
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

const EXIT_OK: i32 = 0;
const EXIT_FAILURE: i32 = 1;

/// Exactly one action per invocation.
#[derive(Parser, Debug)]
#[command(
    name = "keygate",
    version,
    about = "Issue time-limited keys and unlock the lookup gate."
)]
#[command(group(
    ArgGroup::new("action")
        .required(true)
        .multiple(false)
        .args([
            "generate",
            "unlock",
            "lock",
            "status",
            "list",
            "revoke",
            "check",
            "log_usage",
            "audit",
            "validate_config",
            "config_schema",
        ])
))]
struct Cli {
    /// Configuration file (TOML or YAML). Falls back to KEYGATE_CONFIG, then defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Issue a new key and print its secret once.
    #[arg(long)]
    generate: bool,

    /// Lifetime in days for --generate (default from config, normally 7).
    #[arg(long, value_name = "DAYS", requires = "generate")]
    days: Option<u32>,

    /// Unlock the gate; prompts for key id and secret unless --id is given.
    #[arg(long)]
    unlock: bool,

    /// Key id for a single non-interactive unlock attempt.
    #[arg(long, value_name = "ID", requires = "unlock")]
    id: Option<String>,

    /// Secret for --id. Prompted for when omitted.
    #[arg(long, value_name = "SECRET", env = "KEYGATE_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Close the active session.
    #[arg(long)]
    lock: bool,

    /// Show whether the gate is unlocked and for how long.
    #[arg(long)]
    status: bool,

    /// List issued keys with their expiry and status.
    #[arg(long)]
    list: bool,

    /// Permanently remove a key.
    #[arg(long, value_name = "ID", num_args = 0..=1)]
    revoke: Option<Option<String>>,

    /// Print VALID or LOCKED for the lookup tool.
    #[arg(long)]
    check: bool,

    /// Record use of the unlocked key for ACTION.
    #[arg(long, value_name = "ACTION")]
    log_usage: Option<String>,

    /// Print the audit log for a day (YYYY-MM-DD, default today).
    #[arg(long, value_name = "DATE", num_args = 0..=1)]
    audit: Option<Option<String>>,

    /// Validate the configuration and exit.
    #[arg(long)]
    validate_config: bool,

    /// Print the configuration JSON schema and exit.
    #[arg(long)]
    config_schema: bool,
}

/// Entry point: run the action and exit with its status code.
fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            EXIT_FAILURE
        }
    };
    std::process::exit(code);
}

/// Dispatch the selected action and map its result to an exit code.
fn run() -> Result<i32> {
    logging::init("keygate-cli", "warn");
    let cli = Cli::parse();

    if cli.config_schema {
        let schema = schema_for!(KeygateConfig);
        println!("{}", to_string_pretty(&schema)?);
        return Ok(EXIT_OK);
    }

    let config = KeygateConfig::resolve(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("failed to load configuration from {}", path.display()),
        None => "failed to resolve configuration".to_string(),
    })?;

    if cli.validate_config {
        let issues = config.validate();
        if issues.is_empty() {
            println!("Configuration valid (root {}).", config.paths.root.display());
            return Ok(EXIT_OK);
        }
        eprintln!("Configuration validation failed:");
        for issue in issues {
            eprintln!("  - {issue}");
        }
        return Ok(EXIT_FAILURE);
    }

    if cli.check {
        // Anything but VALID on stdout reads as locked to the lookup tool.
        let answer = Keygate::open(Arc::new(config)).and_then(|gate| gate.check());
        return match answer {
            Ok(check) => {
                println!("{check}");
                Ok(EXIT_OK)
            }
            Err(err) => {
                println!("{}", Check::Locked);
                eprintln!("error: {err}");
                Ok(EXIT_FAILURE)
            }
        };
    }

    let keygate = Keygate::open(Arc::new(config)).context("failed to open key store")?;

    if cli.generate {
        let issued = keygate.generate(cli.days)?;
        println!("Key ID:  {}", issued.id);
        println!("Secret:  {}", issued.secret.as_str());
        println!("Expires: {}", issued.expiry.format("%Y-%m-%d"));
        println!("Store the secret now; it cannot be shown again.");
        return Ok(EXIT_OK);
    }

    if cli.unlock {
        return unlock(&keygate, cli.id, cli.secret);
    }

    if cli.lock {
        match keygate.lock()? {
            LockOutcome::Locked(ticket) => println!("Gate locked (key {}).", ticket.key_id),
            LockOutcome::AlreadyLocked => println!("Gate already locked."),
        }
        return Ok(EXIT_OK);
    }

    if cli.status {
        return status(&keygate);
    }

    if cli.list {
        print_key_table(keygate.list()?);
        return Ok(EXIT_OK);
    }

    if let Some(id) = cli.revoke {
        return match keygate.revoke(id.as_deref()) {
            Ok(report) => {
                println!("Revoked key {}.", report.key_id);
                if report.session_closed {
                    println!("The active session used this key and has been locked.");
                }
                Ok(EXIT_OK)
            }
            Err(err @ (KeygateError::NotFound(_) | KeygateError::MissingArgument(_))) => {
                eprintln!("error: {err}");
                Ok(EXIT_FAILURE)
            }
            Err(err) => Err(err.into()),
        };
    }

    if let Some(action) = cli.log_usage {
        if !keygate.log_usage(&action)? {
            debug!("gate locked; usage of `{action}` not recorded");
        }
        return Ok(EXIT_OK);
    }

    if let Some(date) = cli.audit {
        let day = match date {
            Some(text) => NaiveDate::parse_from_str(&text, "%Y-%m-%d")
                .with_context(|| format!("invalid date `{text}` (expected YYYY-MM-DD)"))?,
            None => Local::now().date_naive(),
        };
        for line in keygate
            .audit()
            .entries_for(day)
            .with_context(|| format!("failed to read audit log for {day}"))?
        {
            println!("{line}");
        }
        return Ok(EXIT_OK);
    }

    Ok(EXIT_FAILURE)
}

fn unlock(keygate: &Keygate, id: Option<String>, secret: Option<String>) -> Result<i32> {
    let outcome = match id {
        Some(id) => {
            let secret = match secret {
                Some(secret) => secret,
                None => prompt_password(format!("Secret for {id}: "))?,
            };
            keygate.unlock(&mut vec![Credentials::new(id, secret)])?
        }
        None => keygate.unlock(&mut PromptSource::new(keygate.config().session.max_attempts))?,
    };

    if let Some(err) = refusal(&outcome) {
        eprintln!("error: {err}");
    }
    let code = match outcome {
        UnlockOutcome::Unlocked(ticket) => {
            println!(
                "Gate unlocked with key {} for {}.",
                ticket.key_id,
                hms(keygate.gate().budget())
            );
            EXIT_OK
        }
        UnlockOutcome::AlreadyUnlocked(ticket) => {
            println!("Gate already unlocked (key {}).", ticket.key_id);
            EXIT_OK
        }
        UnlockOutcome::Expired { .. } => {
            eprintln!("Generate a new key to unlock the gate.");
            EXIT_FAILURE
        }
        UnlockOutcome::LockedOut { .. } => EXIT_FAILURE,
        UnlockOutcome::Aborted { attempts } => {
            eprintln!("Unlock aborted after {attempts} failed attempt(s).");
            EXIT_FAILURE
        }
        UnlockOutcome::Refused { retry_after_secs } => {
            eprintln!("Locked out; try again in {retry_after_secs}s.");
            EXIT_FAILURE
        }
    };
    Ok(code)
}

/// The error an expired key or an exhausted attempt budget reports as.
fn refusal(outcome: &UnlockOutcome) -> Option<KeygateError> {
    match outcome {
        UnlockOutcome::Expired { key_id } => Some(KeygateError::Expired(key_id.clone())),
        UnlockOutcome::LockedOut { attempts } => Some(KeygateError::LockedOut {
            attempts: *attempts,
        }),
        _ => None,
    }
}

fn status(keygate: &Keygate) -> Result<i32> {
    match keygate.status()? {
        GateStatus::Unlocked {
            key_id,
            user,
            elapsed,
            remaining,
        } => {
            println!("UNLOCKED with key {key_id} by {user}");
            println!("  elapsed:   {}", hms(elapsed));
            println!("  remaining: {}", hms(remaining));
            Ok(EXIT_OK)
        }
        GateStatus::Locked => {
            println!("LOCKED");
            if let Some(marker) = keygate.gate().lockout_marker()? {
                println!(
                    "  last unlock call failed {} time(s) at {}",
                    marker.attempts, marker.set_at
                );
            }
            Ok(EXIT_FAILURE)
        }
    }
}

/// Interactive prompts: key id on stdin, secret without echo.
struct PromptSource {
    max_attempts: u32,
}

impl PromptSource {
    fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }
}

impl CredentialSource for PromptSource {
    fn next(&mut self, attempt: u32) -> KeygateResult<Option<Credentials>> {
        if attempt > 1 {
            eprintln!("Invalid credentials ({}/{}).", attempt - 1, self.max_attempts);
        }
        eprint!("Key ID: ");
        io::stderr().flush()?;
        let mut id = String::new();
        if io::stdin().lock().read_line(&mut id)? == 0 {
            return Ok(None);
        }
        let id = id.trim();
        if id.is_empty() {
            return Ok(None);
        }
        let secret = prompt_password("Secret: ")?;
        Ok(Some(Credentials::new(id, secret)))
    }
}

/// Render a duration as `[-]HH:MM:SS`.
fn hms(duration: Duration) -> String {
    let total = duration.num_seconds();
    let sign = if total < 0 { "-" } else { "" };
    let total = total.unsigned_abs();
    format!(
        "{sign}{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

/// Render issued keys as a table.
fn print_key_table(keys: Vec<KeySummary>) {
    if keys.is_empty() {
        println!("No keys issued.");
        return;
    }
    println!("{:<32} {:<12} {}", "KEY ID", "EXPIRES", "STATUS");
    for key in keys {
        println!(
            "{:<32} {:<12} {}",
            key.id,
            key.expiry.format("%Y-%m-%d").to_string(),
            key.status
        );
    }
}
