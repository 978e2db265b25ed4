// SPDX-License-Identifier: GPL-3.0-only

//! Time source and bounded polling

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::{Result, SysError};

/// Pacman's database lock
pub const PACMAN_LOCK: &str = "/var/lib/pacman/db.lck";
pub const PACMAN_LOCK_POLL: Duration = Duration::from_millis(250);
pub const PACMAN_LOCK_TIMEOUT: Duration = Duration::from_secs(10 * 60);

pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Call `check` every `interval` until it returns true or `timeout` elapses
pub fn poll_until(
    clock: &dyn Clock,
    what: &str,
    timeout: Duration,
    interval: Duration,
    mut check: impl FnMut() -> Result<bool>,
) -> Result<()> {
    let deadline = clock.now() + timeout;
    loop {
        if check()? {
            return Ok(());
        }
        if clock.now() >= deadline {
            return Err(SysError::LockTimeout(timeout, what.to_string()));
        }
        clock.sleep(interval);
    }
}

/// Block until no other package manager holds the database lock
pub fn wait_for_pacman_lock(clock: &dyn Clock, lock: &Path) -> Result<()> {
    if lock.exists() {
        info!("Pacman is running, waiting for it to release {}", lock.display());
    }
    poll_until(clock, "the pacman lock", PACMAN_LOCK_TIMEOUT, PACMAN_LOCK_POLL, || {
        Ok(!lock.exists())
    })?;
    debug!("Pacman lock is free");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::testing::FakeClock;

    #[test]
    fn poll_times_out_on_fake_clock() {
        let clock = FakeClock::new();
        let err = poll_until(&clock, "never", Duration::from_secs(5), Duration::from_secs(1), || {
            Ok(false)
        })
        .unwrap_err();
        assert!(matches!(err, SysError::LockTimeout(_, ref what) if what == "never"));
        assert!(clock.elapsed() >= Duration::from_secs(5));
    }

    #[test]
    fn poll_returns_once_condition_holds() {
        let clock = FakeClock::new();
        let mut remaining = 3;
        poll_until(&clock, "countdown", Duration::from_secs(60), Duration::from_secs(1), || {
            remaining -= 1;
            Ok(remaining == 0)
        })
        .unwrap();
        assert_eq!(clock.elapsed(), Duration::from_secs(2));
    }

    #[test]
    fn lock_wait_times_out_while_lock_exists() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("db.lck");
        fs::write(&lock, "").unwrap();

        let clock = FakeClock::new();
        assert!(wait_for_pacman_lock(&clock, &lock).is_err());
        assert!(clock.elapsed() >= PACMAN_LOCK_TIMEOUT);

        fs::remove_file(&lock).unwrap();
        assert!(wait_for_pacman_lock(&clock, &lock).is_ok());
    }
}
