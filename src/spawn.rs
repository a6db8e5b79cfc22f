//! Worker process spawning.
//!
//! A worker gets fd 0 and 1 as the framed channels to the host and fd 2
//! pointed at its log file; everything else is the exec'd executable's
//! business.

use std::ffi::CString;
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use protocol::Channel;

/// Host-side options recognized in a worker's argv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOptions {
    /// The node name: the executable stem unless `-name` overrides it.
    pub name: String,
    /// `-csv` switches the log file extension.
    pub csv: bool,
    /// The argv handed to the executable, options included.
    pub args: Vec<String>,
}

impl WorkerOptions {
    /// Derive the options from the executable path and raw argv.
    pub fn parse(path: &str, args: Vec<String>) -> Self {
        let mut name = Path::new(path)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| String::from("node"));

        let mut csv = false;
        let mut it = args.iter();

        while let Some(arg) = it.next() {
            match arg.as_str() {
                "-name" => {
                    if let Some(value) = it.next() {
                        name = value.clone();
                    }
                }
                "-csv" => csv = true,
                _ => {}
            }
        }

        Self { name, csv, args }
    }

    /// The log file for this worker inside the session directory.
    ///
    /// The `.csv` variant is a fresh path; nothing rewrites the `.txt` name
    /// in place.
    pub fn log_path(&self, session_dir: &Path) -> PathBuf {
        let ext = if self.csv { "csv" } else { "txt" };
        session_dir.join(&self.name).with_extension(ext)
    }
}

/// A spawned worker, not yet through any handshake.
#[derive(Debug)]
pub struct SpawnedWorker {
    pub pid: i32,
    pub channel: Channel,
}

/// Fork and exec a worker with the fd layout of the worker contract.
pub fn spawn(path: &str, options: &WorkerOptions, log_path: &Path) -> Result<SpawnedWorker> {
    let log = File::create(log_path)
        .with_context(|| format!("Opening log file {}", log_path.display()))?;

    let exec_path = CString::new(path).context("Executable path contains NUL")?;

    let mut argv_owned = Vec::with_capacity(options.args.len() + 1);
    argv_owned.push(exec_path.clone());

    for arg in &options.args {
        argv_owned.push(CString::new(arg.as_str()).context("Argument contains NUL")?);
    }

    let mut argv: Vec<*const libc::c_char> =
        argv_owned.iter().map(|arg| arg.as_ptr()).collect();
    argv.push(std::ptr::null());

    let (worker_read, host_write) = pipe()?;
    let (host_read, worker_write) = pipe()?;

    // SAFETY: The child performs only async-signal-safe calls between fork
    // and exec; every allocation above happened before the fork.
    let pid = unsafe { libc::fork() };

    if pid == -1 {
        return Err(std::io::Error::last_os_error()).context("fork failed");
    }

    if pid == 0 {
        // SAFETY: Child side; dup2/close/execv only, then _exit.
        unsafe {
            // The originals are close-on-exec; dup2 clears the flag on the
            // standard fds, so only those survive into the executable.
            if libc::dup2(worker_read.as_raw_fd(), libc::STDIN_FILENO) == -1
                || libc::dup2(worker_write.as_raw_fd(), libc::STDOUT_FILENO) == -1
                || libc::dup2(log.as_raw_fd(), libc::STDERR_FILENO) == -1
            {
                libc::_exit(126);
            }

            libc::execv(exec_path.as_ptr(), argv.as_ptr());
            libc::_exit(127);
        }
    }

    drop(worker_read);
    drop(worker_write);
    drop(log);

    let channel = Channel::new(host_read, host_write);

    channel
        .set_read_nonblocking(true)
        .context("Marking the worker channel non-blocking")?;

    tracing::debug!(pid, path, "spawned worker");

    Ok(SpawnedWorker { pid, channel })
}

fn pipe() -> Result<(OwnedFd, OwnedFd)> {
    use std::os::fd::FromRawFd;

    // SAFETY: We're just using c-apis as intended.
    unsafe {
        let mut fds = [0i32; 2];

        if libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) == -1 {
            bail!(std::io::Error::last_os_error());
        }

        Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::WorkerOptions;

    fn options(args: &[&str]) -> WorkerOptions {
        WorkerOptions::parse("/bin/source", args.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn name_defaults_to_executable_stem() {
        assert_eq!(options(&[]).name, "source");
    }

    #[test]
    fn name_option_overrides() {
        let opts = options(&["-name", "src", "--verbose"]);
        assert_eq!(opts.name, "src");
        assert_eq!(opts.args.len(), 3);
    }

    #[test]
    fn csv_switches_log_extension() {
        let session = Path::new("/tmp/session");
        assert_eq!(
            options(&[]).log_path(session),
            session.join("source.txt")
        );
        assert_eq!(
            options(&["-csv"]).log_path(session),
            session.join("source.csv")
        );
    }
}
