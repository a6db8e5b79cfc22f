//! Wall-clock formatting shared by the host log sink and the session
//! directory name.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{Local, Offset, TimeDelta, Utc};

/// The stamp format used for session directories and log lines.
pub const STAMP_FORMAT: &str = "%Y-%m-%d-(%a)-%H:%M:%S";

/// The host's timezone offset in seconds east of UTC.
///
/// Captured once at startup and published to workers through the settings
/// region, so every process stamps with the same clock.
pub fn tz_offset_seconds() -> i64 {
    i64::from(Local::now().offset().fix().local_minus_utc())
}

/// The current time formatted with [`STAMP_FORMAT`], shifted by the given
/// offset.
pub fn stamp(tz_offset: i64) -> String {
    (Utc::now() + TimeDelta::seconds(tz_offset))
        .format(STAMP_FORMAT)
        .to_string()
}

/// Create the per-session log directory `<root>/Logs/<stamp>/`.
pub fn create_session_dir(root: &Path, tz_offset: i64) -> io::Result<PathBuf> {
    let dir = root.join("Logs").join(stamp(tz_offset));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
