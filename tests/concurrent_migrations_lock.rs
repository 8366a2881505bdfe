use anyhow::{Context, Result};

#[cfg(unix)]
use fs2::FileExt;
#[cfg(unix)]
use std::fs::OpenOptions;

use rusqlite::OptionalExtension;
use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};
use tempfile::Builder as TempBuilder;

/// Exercises the same cross-process advisory lock `SqliteKvStore::open` takes
/// before running migrations: a second process opening the same database
/// file should block until the first releases the lock, not race it.
#[test]
fn test_concurrent_migrations_file_lock() -> Result<()> {
    let tmp_db_dir = TempBuilder::new().prefix("authproxy_test_db").tempdir()?;
    let db_path = tmp_db_dir.path().join("concurrent_test.db");

    let test_exe = std::env::current_exe().context("failed to locate current test executable")?;

    // Same derivation as SqliteKvStore::lock_path.
    let lock_path = PathBuf::from(format!("{}.migration.lock", db_path.display()));
    let signal_file = tmp_db_dir.path().join("locker.ready");
    if signal_file.exists() {
        let _ = std::fs::remove_file(&signal_file);
    }

    let hold_ms: u64 = 1000;
    let mut locker_child = Command::new(&test_exe)
        .arg("child_lock_helper")
        .env("CHILD_LOCKER_PATH", &lock_path)
        .env("CHILD_HOLD_MS", hold_ms.to_string())
        .env("CHILD_SIGNAL_FILE", &signal_file)
        .spawn()
        .with_context(|| format!("spawning locker child via {}", test_exe.display()))?;

    let started = Instant::now();
    let ready_timeout = Duration::from_secs(5);
    loop {
        if signal_file.exists() {
            break;
        }
        if started.elapsed() > ready_timeout {
            let _ = locker_child.kill();
            return Err(anyhow::anyhow!(
                "timed out waiting for locker child to become ready"
            ));
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    let start = Instant::now();
    let apply_output = Command::new(&test_exe)
        .arg("child_apply_migrations")
        .env("CHILD_APPLY_DB", &db_path)
        .output()
        .with_context(|| format!("running migration apply child via {}", test_exe.display()))?;
    let elapsed = start.elapsed();

    if !apply_output.status.success() {
        let stdout = String::from_utf8_lossy(&apply_output.stdout);
        let stderr = String::from_utf8_lossy(&apply_output.stderr);
        return Err(anyhow::anyhow!(
            "migration apply failed (status: {:?})\nstdout:\n{}\nstderr:\n{}",
            apply_output.status.code(),
            stdout,
            stderr
        ));
    }

    assert!(
        elapsed >= Duration::from_millis(900),
        "migration apply did not wait for the locker ({:?} < 900ms)",
        elapsed
    );

    let conn = rusqlite::Connection::open(&db_path)?;
    let mut stmt =
        conn.prepare("SELECT name FROM sqlite_master WHERE type='table' AND name='kv_records'")?;
    let found: Option<String> = stmt.query_row([], |r| r.get(0)).optional()?;
    assert!(found.is_some(), "expected kv_records table to exist");

    let locker_status = locker_child
        .wait()
        .with_context(|| "waiting for locker child to exit")?;
    assert!(
        locker_status.success(),
        "locker child failed: {:?}",
        locker_status
    );

    Ok(())
}

/// Helper invoked as a separate process: when `CHILD_LOCKER_PATH` is set,
/// takes an exclusive lock on it, signals readiness, holds it for
/// `CHILD_HOLD_MS`, then releases it. No-op under the normal test run.
#[test]
fn child_lock_helper() -> Result<()> {
    let lock_path_var = match std::env::var_os("CHILD_LOCKER_PATH") {
        Some(p) => p,
        None => return Ok(()),
    };
    let lock_path = PathBuf::from(lock_path_var);
    let hold_ms: u64 = std::env::var("CHILD_HOLD_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);
    let signal_file = std::env::var_os("CHILD_SIGNAL_FILE").map(PathBuf::from);

    #[cfg(unix)]
    {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("opening lock file {}", lock_path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("locking file {}", lock_path.display()))?;

        if let Some(sig) = signal_file.clone() {
            let _ = std::fs::write(&sig, "locked");
        }

        std::thread::sleep(Duration::from_millis(hold_ms));

        FileExt::unlock(&file).with_context(|| format!("unlocking file {}", lock_path.display()))?;
    }

    #[cfg(not(unix))]
    {
        let _ = (lock_path, hold_ms, signal_file);
    }

    Ok(())
}

/// Helper invoked as a separate process: opens `CHILD_APPLY_DB` via
/// `SqliteKvStore::open`, which blocks on the migration lock and then runs
/// pending migrations. No-op under the normal test run.
#[test]
fn child_apply_migrations() -> Result<()> {
    let db_path_os = match std::env::var_os("CHILD_APPLY_DB") {
        Some(p) => p,
        None => return Ok(()),
    };
    let db_path = PathBuf::from(db_path_os);

    let _store = authproxy::kv::sqlite::SqliteKvStore::open(&db_path)
        .with_context(|| format!("applying migrations for {}", db_path.display()))?;
    Ok(())
}
