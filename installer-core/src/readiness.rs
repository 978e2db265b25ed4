// SPDX-License-Identifier: GPL-3.0-only

//! Waiting for the live environment to settle before strapping
//!
//! The clock, the mirror list and the keyring are all updated by services the
//! live image starts on its own. None of these waits is fatal; a timeout is
//! logged and the installation goes on.

use std::time::Duration;

use installer_sys::{Cmd, poll_until};
use tracing::{info, warn};

use crate::host::Host;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const NTP_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const NTP_SLOW_AFTER: Duration = Duration::from_secs(5);
const REFLECTOR_TIMEOUT: Duration = Duration::from_secs(60);
const WKD_TIMER_TIMEOUT: Duration = Duration::from_secs(60);
const WKD_SERVICE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const REFLECTOR_UNIT: &str = "reflector.service";
const WKD_TIMER: &str = "archlinux-keyring-wkd-sync.timer";
const WKD_SERVICE: &str = "archlinux-keyring-wkd-sync.service";

/// Which waits to skip
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadinessOptions {
    pub skip_ntp: bool,
    pub skip_wkd: bool,

    /// No network: mirror selection never runs
    pub offline: bool,
}

/// How a wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Done,
    Failed,
    TimedOut,
    Skipped,
}

/// `SubState` of a unit, empty when systemctl cannot tell
fn service_state(host: &Host<'_>, unit: &str) -> String {
    host.runner
        .output(
            &Cmd::new("systemctl")
                .args(["show", "--no-pager", "-p", "SubState", "--value"])
                .arg(unit),
        )
        .unwrap_or_default()
}

fn service_started(host: &Host<'_>, unit: &str) -> bool {
    let stamp = host
        .runner
        .output(
            &Cmd::new("systemctl")
                .args(["show", "--property=ActiveEnterTimestamp", "--no-pager"])
                .arg(unit),
        )
        .unwrap_or_default();
    !stamp.trim_start_matches("ActiveEnterTimestamp=").is_empty()
}

fn is_finished(state: &str) -> bool {
    matches!(state, "dead" | "failed" | "exited")
}

/// Wait for a oneshot unit to leave its running state
fn wait_for_service(host: &Host<'_>, unit: &str, timeout: Duration) -> WaitOutcome {
    let mut last = String::new();
    let waited = poll_until(host.clock, unit, timeout, POLL_INTERVAL, || {
        last = service_state(host, unit);
        Ok(is_finished(&last))
    });
    match waited {
        Err(_) => WaitOutcome::TimedOut,
        Ok(()) if last == "failed" => WaitOutcome::Failed,
        Ok(()) => WaitOutcome::Done,
    }
}

pub fn wait_for_ntp(host: &Host<'_>) -> WaitOutcome {
    info!("Waiting for NTP time synchronization...");
    let started = host.clock.now();
    let mut notified = false;

    let waited = poll_until(host.clock, "NTP synchronization", NTP_TIMEOUT, POLL_INTERVAL, || {
        if !notified && host.clock.now().duration_since(started) > NTP_SLOW_AFTER {
            notified = true;
            warn!("NTP sync taking longer than expected, still waiting...");
        }
        let synced = host
            .runner
            .output(&Cmd::new("timedatectl").args(["show", "--property=NTPSynchronized", "--value"]))
            .unwrap_or_default();
        Ok(synced == "yes")
    });

    match waited {
        Ok(()) => {
            info!("NTP time synchronization completed");
            WaitOutcome::Done
        }
        Err(_) => {
            warn!("NTP did not synchronize within {NTP_TIMEOUT:?}, continuing anyway");
            WaitOutcome::TimedOut
        }
    }
}

pub fn wait_for_reflector(host: &Host<'_>) -> WaitOutcome {
    info!("Waiting for reflector mirror selection...");
    let outcome = wait_for_service(host, REFLECTOR_UNIT, REFLECTOR_TIMEOUT);
    match outcome {
        WaitOutcome::TimedOut => warn!("Reflector did not complete within 60 seconds, continuing anyway..."),
        WaitOutcome::Failed => warn!("Reflector mirror selection failed"),
        _ => info!("Reflector mirror selection completed"),
    }
    outcome
}

pub fn wait_for_keyring(host: &Host<'_>) -> WaitOutcome {
    info!("Waiting for Arch Linux keyring sync...");
    let timer = poll_until(host.clock, WKD_TIMER, WKD_TIMER_TIMEOUT, POLL_INTERVAL, || {
        Ok(service_started(host, WKD_TIMER))
    });
    if timer.is_err() {
        warn!("{WKD_TIMER} never started, continuing anyway");
        return WaitOutcome::TimedOut;
    }

    let outcome = wait_for_service(host, WKD_SERVICE, WKD_SERVICE_TIMEOUT);
    match outcome {
        WaitOutcome::TimedOut => warn!("Arch Linux keyring sync is still running, continuing anyway"),
        WaitOutcome::Failed => warn!("Arch Linux keyring sync failed"),
        _ => info!("Arch Linux keyring sync completed"),
    }
    outcome
}

/// Run every wait `options` leaves enabled
pub fn sanity_check(host: &Host<'_>, options: ReadinessOptions) -> [WaitOutcome; 3] {
    let ntp = if options.skip_ntp {
        info!("Skipping NTP time sync (may cause issues if system time is incorrect)");
        WaitOutcome::Skipped
    } else {
        wait_for_ntp(host)
    };

    let reflector = if !options.offline && std::env::consts::ARCH == "x86_64" {
        wait_for_reflector(host)
    } else {
        info!("Skipping reflector (offline mode or non-x86_64 architecture)");
        WaitOutcome::Skipped
    };

    let keyring = if options.skip_wkd {
        WaitOutcome::Skipped
    } else {
        wait_for_keyring(host)
    };

    [ntp, reflector, keyring]
}

#[cfg(test)]
mod tests {
    use installer_sys::CommandOutput;
    use installer_sys::Firmware;
    use installer_sys::testing::{FakeClock, RecordingInstaller, ScriptedRunner, StaticDevices};

    use super::*;

    struct Env {
        runner: ScriptedRunner,
        devices: StaticDevices,
        packages: RecordingInstaller,
        clock: FakeClock,
    }

    impl Env {
        fn new(runner: ScriptedRunner) -> Self {
            Self {
                runner,
                devices: StaticDevices::default(),
                packages: RecordingInstaller::default(),
                clock: FakeClock::new(),
            }
        }

        fn host(&self) -> Host<'_> {
            Host {
                runner: &self.runner,
                devices: &self.devices,
                packages: &self.packages,
                clock: &self.clock,
                firmware: Firmware::UEFI64,
                cpu: None,
            }
        }
    }

    #[test]
    fn ntp_polls_until_synchronized() {
        let env = Env::new(
            ScriptedRunner::new()
                .respond_once("timedatectl", CommandOutput::stdout("no\n"))
                .respond_once("timedatectl", CommandOutput::stdout("no\n"))
                .respond("timedatectl", CommandOutput::stdout("yes\n")),
        );
        assert_eq!(wait_for_ntp(&env.host()), WaitOutcome::Done);
        assert_eq!(env.runner.count("timedatectl"), 3);
        assert_eq!(env.clock.elapsed(), Duration::from_secs(2));
    }

    #[test]
    fn ntp_gives_up_without_failing() {
        let env = Env::new(ScriptedRunner::new().respond("timedatectl", CommandOutput::stdout("no")));
        assert_eq!(wait_for_ntp(&env.host()), WaitOutcome::TimedOut);
        assert!(env.clock.elapsed() >= NTP_TIMEOUT);
    }

    #[test]
    fn failed_reflector_is_reported() {
        let env = Env::new(
            ScriptedRunner::new()
                .respond_once("systemctl show", CommandOutput::stdout("running"))
                .respond("systemctl show", CommandOutput::stdout("failed")),
        );
        assert_eq!(wait_for_reflector(&env.host()), WaitOutcome::Failed);
        assert_eq!(
            env.runner.rendered()[0],
            "systemctl show --no-pager -p SubState --value reflector.service"
        );
    }

    #[test]
    fn keyring_waits_for_timer_then_service() {
        let env = Env::new(
            ScriptedRunner::new()
                .respond_once(
                    "systemctl show --property=ActiveEnterTimestamp",
                    CommandOutput::stdout("ActiveEnterTimestamp="),
                )
                .respond(
                    "systemctl show --property=ActiveEnterTimestamp",
                    CommandOutput::stdout("ActiveEnterTimestamp=Thu 2026-10-15 10:00:00 UTC"),
                )
                .respond("systemctl show --no-pager -p SubState", CommandOutput::stdout("exited")),
        );
        assert_eq!(wait_for_keyring(&env.host()), WaitOutcome::Done);
        assert_eq!(env.runner.count("systemctl show --property=ActiveEnterTimestamp"), 2);
        assert!(env.runner.rendered().last().unwrap().ends_with(WKD_SERVICE));
    }

    #[test]
    fn everything_skipped() {
        let env = Env::new(ScriptedRunner::new());
        let outcome = sanity_check(
            &env.host(),
            ReadinessOptions {
                skip_ntp: true,
                skip_wkd: true,
                offline: true,
            },
        );
        assert_eq!(outcome, [WaitOutcome::Skipped; 3]);
        assert!(env.runner.rendered().is_empty());
    }
}
