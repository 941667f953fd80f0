use anyhow::{Context, Result};
use keygate_core::{logging, Keygate, KeygateConfig, Session};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::{
    select, signal,
    time::{sleep, Duration},
};

mod timer;

use timer::next_wake;

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = run().await {
        error!("daemon exit: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    logging::init("keygate-daemon", "info");
    let explicit = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Arc::new(
        KeygateConfig::resolve(explicit.as_deref()).context("load keygate configuration")?,
    );

    info!(
        "keygate supervisor booting (root: {})",
        config.paths.root.display()
    );

    let keygate = Arc::new(Keygate::open(config.clone()).context("open key store")?);
    let watcher = tokio::spawn(supervise(keygate, config.daemon_poll()));

    select! {
        res = watcher => res??,
        _ = signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    Ok(())
}

/// Follow the session file and lock it the moment its deadline passes.
async fn supervise(keygate: Arc<Keygate>, poll: Duration) -> Result<()> {
    loop {
        let wait = tick(&keygate, poll);
        sleep(wait).await;
    }
}

/// One pass over the session: fire the auto-lock if its deadline has passed,
/// then return how long to sleep before the next pass.
fn tick(keygate: &Keygate, poll: Duration) -> Duration {
    let session = match keygate.gate().current() {
        Ok(Some(session)) => session,
        Ok(None) => return poll,
        Err(err) => {
            warn!("[{}] reading session failed: {err}", err.code());
            return poll;
        }
    };

    let now = keygate.clock().now().timestamp();
    if now < session.expires_at {
        return next_wake(now, session.expires_at, poll);
    }
    fire(keygate, &session);
    poll
}

fn fire(keygate: &Keygate, session: &Session) {
    match keygate.gate().auto_lock_fire(&session.ticket()) {
        Ok(true) => info!("auto-locked session for key {}", session.key_id),
        Ok(false) => info!(
            "session for key {} already ended; nothing to lock",
            session.key_id
        ),
        Err(err) => warn!("[{}] auto-lock failed: {err}", err.code()),
    }
}
