//! Remote script payloads
//!
//! These are opaque to the orchestrator: they are assembled into argv and
//! shipped as is. Only the health poll wrapper is generated here.

use std::time::Duration;

/// Idempotent OS preparation script run before preflight
pub const INSTALL_PREREQS_SCRIPT: &str = include_str!("scripts/install_prereqs.sh");

/// Marker left on a host once the prerequisite script succeeded
pub const PREREQS_MARKER: &str = "/opt/dcos-prereqs.installed";

/// Check runner invoked by postflight polls
pub const CHECK_RUNNER_CMD: &str = "/opt/mesosphere/bin/dcos-diagnostics check";

/// Attempts made by a postflight poll before giving up
pub const POLL_ATTEMPTS: u32 = 900;

/// Seconds slept between postflight poll attempts
pub const POLL_INTERVAL_SECS: u32 = 1;

/// Shell loop running `check` until it succeeds, at most `attempts` times.
///
/// Prints the output of the last attempt and exits with its status, so an
/// exhausted budget reports the last observed failure.
#[must_use]
pub fn health_poll(check: &str, attempts: u32, interval_secs: u32) -> String {
    format!(
        r#"
T={attempts}
until OUT=$({check}); RETCODE=$?; [ "$RETCODE" -eq 0 ]; do
    T=$((T-1))
    if [ "$T" -le 0 ]; then
        break
    fi
    sleep {interval_secs}
done
echo "$OUT"
exit $RETCODE"#
    )
}

/// Check command for the given check type, run through the cluster shell
#[must_use]
pub fn check_command(check_type: &str) -> String {
    format!("sudo /opt/mesosphere/bin/dcos-shell {CHECK_RUNNER_CMD} {check_type}")
}

/// Upper bound on how long a poll built with these parameters may run
#[must_use]
pub fn poll_budget(attempts: u32, interval_secs: u32) -> Duration {
    Duration::from_secs(u64::from(attempts) * u64::from(interval_secs))
}
