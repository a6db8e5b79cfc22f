mod clock;
mod command;
mod console;
mod graph;
mod persist;
mod spawn;
mod supervisor;
mod tick;

use std::io;
use std::path::Path;

use anyhow::{Result, bail};
use protocol::Channel;

fn main() -> Result<()> {
    let mut no_log = false;

    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--no-log" => no_log = true,
            arg => bail!("Unknown argument {arg}, usage: flowmesh [--no-log]"),
        }
    }

    let tz_offset = clock::tz_offset_seconds();
    let session_dir = clock::create_session_dir(Path::new("."), tz_offset)?;

    let (front, back) = Channel::pair()?;

    // SAFETY: The child takes its half of the channel straight into the
    // supervisor loop; the single-threaded front-end continues past it.
    let supervisor_pid = unsafe { libc::fork() };

    if supervisor_pid == -1 {
        bail!(io::Error::last_os_error());
    }

    if supervisor_pid == 0 {
        drop(front);
        std::process::exit(supervisor::run(back, session_dir, no_log));
    }

    drop(back);

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let result = console::run(front);

    // Closing the channel told the supervisor to shut down; collect it.
    let mut status = 0;

    // SAFETY: We're just using c-apis as intended.
    unsafe {
        libc::waitpid(supervisor_pid, &mut status, 0);
    }

    result
}
