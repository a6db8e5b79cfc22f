use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use chrono::{TimeDelta, Utc};

/// The format both the host and the workers stamp log lines with.
pub(crate) const STAMP_FORMAT: &str = "%Y-%m-%d-(%a)-%H:%M:%S";

/// The per-node debug log sink.
///
/// Lines are `<stamp>:<message>` in the host's local time. The stamp string
/// is rebuilt at most once per second.
#[derive(Debug)]
pub(crate) struct NodeLog {
    file: Option<File>,
    cached_sec: i64,
    cached: String,
}

impl NodeLog {
    /// A log which swallows everything.
    pub(crate) fn closed() -> Self {
        Self {
            file: None,
            cached_sec: i64::MIN,
            cached: String::new(),
        }
    }

    /// Open the log file the host assigned, appending after whatever the
    /// stderr capture has already written.
    pub(crate) fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            file: Some(file),
            cached_sec: i64::MIN,
            cached: String::new(),
        })
    }

    /// Append one stamped line and flush it.
    pub(crate) fn write(&mut self, tz_offset: i64, message: &str) {
        let Some(file) = &mut self.file else {
            return;
        };

        let now = Utc::now();

        if now.timestamp() != self.cached_sec {
            // Shift by the published offset rather than a timezone object;
            // the host did the same when it picked the log directory name.
            let local = now + TimeDelta::seconds(tz_offset);
            self.cached = local.format(STAMP_FORMAT).to_string();
            self.cached_sec = now.timestamp();
        }

        _ = writeln!(file, "{}:{message}", self.cached);
        _ = file.flush();
    }
}
