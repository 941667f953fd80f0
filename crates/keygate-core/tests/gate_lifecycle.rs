use chrono::{Duration, Local, TimeZone};
use keygate_core::{
    AuditAction, Check, Clock, Credentials, GateStatus, Keygate, KeygateConfig, KeygateResult,
    ManualClock, Operator, UnlockOutcome, Validation,
};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

fn test_config(root: &Path) -> KeygateConfig {
    let mut config = KeygateConfig::default_for(root);
    config.crypto.kdf_iterations = 1;
    config
}

fn open_at(root: &Path, clock: Arc<ManualClock>) -> KeygateResult<Keygate> {
    Keygate::with_clock(
        Arc::new(test_config(root)),
        clock,
        Operator::new("ops", "gate01"),
    )
}

fn start_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Local.with_ymd_and_hms(2026, 10, 18, 14, 0, 0).unwrap(),
    ))
}

#[test]
fn thousand_ids_in_one_second_are_distinct() -> KeygateResult<()> {
    let dir = tempdir().unwrap();
    let keygate = open_at(dir.path(), start_clock())?;

    let mut ids = HashSet::new();
    for _ in 0..1000 {
        ids.insert(keygate.generate(Some(7))?.id);
    }
    assert_eq!(ids.len(), 1000);
    assert_eq!(keygate.store().len()?, 1000);
    Ok(())
}

#[test]
fn generate_validate_revoke_scenario() -> KeygateResult<()> {
    let dir = tempdir().unwrap();
    let keygate = open_at(dir.path(), start_clock())?;

    let key = keygate.generate(Some(7))?;
    assert_eq!(keygate.validate(&key.id, &key.secret)?, Validation::Valid);
    assert_eq!(
        keygate.validate(&key.id, &format!("{}x", key.secret.as_str()))?,
        Validation::Invalid
    );
    assert_eq!(
        keygate.validate("nonexistent", &key.secret)?,
        Validation::Invalid
    );

    keygate.revoke(Some(&key.id))?;
    assert_eq!(keygate.validate(&key.id, &key.secret)?, Validation::Invalid);
    assert!(keygate.list()?.is_empty());
    Ok(())
}

#[test]
fn session_lifecycle_with_auto_lock() -> KeygateResult<()> {
    let dir = tempdir().unwrap();
    let clock = start_clock();
    let keygate = open_at(dir.path(), clock.clone())?;
    let key = keygate.generate(None)?;

    let outcome = keygate.unlock(&mut vec![Credentials::new(
        key.id.clone(),
        key.secret.as_str(),
    )])?;
    assert!(outcome.is_unlocked());

    let mut last_elapsed = Duration::zero();
    for _ in 0..3 {
        clock.advance(Duration::hours(2));
        match keygate.status()? {
            GateStatus::Unlocked { elapsed, .. } => {
                assert!(elapsed > last_elapsed);
                last_elapsed = elapsed;
            }
            GateStatus::Locked => panic!("gate locked early"),
        }
    }

    clock.advance(Duration::hours(2) + Duration::seconds(1));
    assert_eq!(keygate.check()?, Check::Locked);

    let today = clock.now().date_naive();
    let lines = keygate.audit().entries_for(today).unwrap();
    let tag = format!("[{}]", AuditAction::SystemLock);
    assert!(lines.iter().any(|l| l.contains(&tag) && l.contains("automatic")));
    Ok(())
}

#[test]
fn lockout_is_advisory_across_calls() -> KeygateResult<()> {
    let dir = tempdir().unwrap();
    let keygate = open_at(dir.path(), start_clock())?;
    let key = keygate.generate(None)?;
    let wrong = || Credentials::new(key.id.clone(), "guess");

    let outcome = keygate.unlock(&mut vec![wrong(), wrong(), wrong()])?;
    assert_eq!(outcome, UnlockOutcome::LockedOut { attempts: 3 });
    assert!(keygate.gate().lockout_marker()?.is_some());

    let outcome = keygate.unlock(&mut vec![Credentials::new(
        key.id.clone(),
        key.secret.as_str(),
    )])?;
    assert!(outcome.is_unlocked());
    Ok(())
}

#[test]
fn sessions_survive_across_instances_and_expire_lazily() -> KeygateResult<()> {
    let dir = tempdir().unwrap();
    let clock = start_clock();
    {
        let keygate = open_at(dir.path(), clock.clone())?;
        let key = keygate.generate(None)?;
        keygate.unlock(&mut vec![Credentials::new(
            key.id.clone(),
            key.secret.as_str(),
        )])?;
    }

    let later = open_at(dir.path(), clock.clone())?;
    assert_eq!(later.check()?, Check::Valid);

    clock.advance(Duration::hours(9));
    let after = open_at(dir.path(), clock)?;
    assert_eq!(after.check()?, Check::Locked);
    assert!(!after.gate().session_path().exists());
    Ok(())
}

#[test]
fn concurrent_generate_and_revoke_lose_nothing() -> KeygateResult<()> {
    let dir = tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let seed = open_at(&root, start_clock())?;
    let doomed: Vec<String> = (0..20)
        .map(|_| seed.generate(None).map(|k| k.id))
        .collect::<KeygateResult<_>>()?;

    let writer_root = root.clone();
    let writer = thread::spawn(move || -> KeygateResult<Vec<String>> {
        let keygate = open_at(&writer_root, start_clock())?;
        (0..40).map(|_| keygate.generate(None).map(|k| k.id)).collect()
    });
    let revoker_root = root.clone();
    let revoker = thread::spawn(move || -> KeygateResult<()> {
        let keygate = open_at(&revoker_root, start_clock())?;
        for id in &doomed {
            keygate.revoke(Some(id))?;
        }
        Ok(())
    });

    let added = writer.join().unwrap()?;
    revoker.join().unwrap()?;

    let listed: HashSet<String> = seed.list()?.into_iter().map(|k| k.id).collect();
    let expected: HashSet<String> = added.into_iter().collect();
    assert_eq!(listed, expected);
    Ok(())
}

#[test]
fn first_run_creates_private_layout() -> KeygateResult<()> {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempdir().unwrap();
    let keygate = open_at(dir.path(), start_clock())?;
    let config = keygate.config();

    let master = fs::read_to_string(config.master_key_path())?;
    assert_eq!(master.lines().count(), 1);
    for path in [config.master_key_path(), config.store_path()] {
        assert_eq!(fs::metadata(&path)?.permissions().mode() & 0o777, 0o600);
    }
    assert_eq!(fs::read(config.store_path())?, b"");
    Ok(())
}
