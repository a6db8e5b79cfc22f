//! The tick driver process.
//!
//! Forked from the supervisor, it periodically resumes every worker listed
//! in the wakeup table. It owns nothing: the settings and the table are the
//! supervisor's regions, mapped before the fork.

use std::thread;
use std::time::Duration;

use region::{SettingsRegion, WakeupTable};

/// Drive ticks until the supervisor goes away or a region is lost.
///
/// The period is re-read every iteration, so a timer change takes effect on
/// the next sleep, never the current one. Each enrolled worker receives at
/// most one resume signal per period.
pub fn run(settings: &SettingsRegion, wakeup: &WakeupTable, supervisor: i32) -> i32 {
    loop {
        let period = match settings.load() {
            Ok(s) => s.tick_period_ms,
            Err(e) => {
                tracing::error!(error = %e, "Settings region lost");
                return 1;
            }
        };

        let resumed = wakeup.visit_enabled(|pid| {
            // SAFETY: We're just using c-apis as intended.
            unsafe {
                if libc::kill(pid, libc::SIGCONT) == -1 {
                    tracing::debug!(pid, "Worker did not take its resume signal");
                }
            }
        });

        match resumed {
            Ok(n) if n > 0 => tracing::trace!(resumed = n, "tick"),
            Ok(..) => {}
            Err(e) => {
                tracing::error!(error = %e, "Wakeup table lost");
                return 1;
            }
        }

        thread::sleep(Duration::from_millis(period.max(1) as u64));

        // SAFETY: A zero signal only probes for existence.
        if unsafe { libc::kill(supervisor, 0) } != 0 {
            return 0;
        }
    }
}
