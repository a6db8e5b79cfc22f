use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use protocol::handshake::{self, MAX_PATH, MESSAGE_DEADLINE};
use protocol::{Channel, Deadline, Direction, PipeDecl, Unit};
use region::{Mode, RegionIds, Settings, SettingsRegion};
use tracing::Level;

use crate::{NodeLog, PipeSlot, ReadStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Pipes may still be declared; no host contact yet.
    Uninitialized,
    /// The init handshake is done.
    Configured,
    /// The begin handshake is done; data may flow.
    Running,
}

/// The worker half of the runtime.
///
/// Owns the channel to the host, the pipe table, the settings snapshot and
/// the debug log. Operations are legal only in the states they document;
/// anywhere else they fail without side effect.
#[derive(Debug)]
pub struct NodeContext {
    state: State,
    channel: Option<Channel>,
    pipes: Vec<PipeSlot>,
    settings: Option<SettingsRegion>,
    snapshot: Settings,
    parent: i32,
    log: NodeLog,
}

impl NodeContext {
    /// Construct an empty context. The host is not contacted until
    /// [`init`].
    ///
    /// [`init`]: NodeContext::init
    pub fn new() -> Self {
        Self {
            state: State::Uninitialized,
            channel: None,
            pipes: Vec::new(),
            settings: None,
            snapshot: Settings {
                no_log: 1,
                tz_offset: 0,
                tick_period_ms: 100,
            },
            parent: 0,
            log: NodeLog::closed(),
        }
    }

    /// Construct a context speaking over an explicit channel instead of the
    /// standard streams.
    #[cfg(test)]
    pub(crate) fn with_channel(channel: Channel) -> Self {
        let mut this = Self::new();
        this.channel = Some(channel);
        this
    }

    /// Declare a pipe. Legal only before [`init`].
    ///
    /// `initial` stages a starting payload for a CONST pipe; it is copied
    /// into the shared region during [`begin`]. Returns the pipe id used by
    /// [`read`] and [`write`].
    ///
    /// [`init`]: NodeContext::init
    /// [`begin`]: NodeContext::begin
    /// [`read`]: NodeContext::read
    /// [`write`]: NodeContext::write
    pub fn add_pipe(
        &mut self,
        name: &str,
        direction: Direction,
        unit: Unit,
        length: u16,
        initial: Option<&[u8]>,
    ) -> Result<usize> {
        ensure!(
            self.state == State::Uninitialized,
            "Pipes can only be declared before init"
        );
        ensure!(length > 0, "Pipe length must be at least 1");
        ensure!(!name.is_empty(), "Pipe name must not be empty");
        ensure!(
            self.pipes.len() < usize::from(u16::MAX),
            "Pipe table is full"
        );
        ensure!(
            self.pipes.iter().all(|p| p.decl.name != name),
            "Pipe {name} is already declared"
        );

        let decl = PipeDecl {
            direction,
            unit,
            length,
            name: name.to_owned(),
        };

        let staged = match initial {
            Some(bytes) => {
                ensure!(
                    direction == Direction::Const,
                    "Only CONST pipes take an initial value"
                );
                ensure!(
                    bytes.len() == decl.byte_size(),
                    "Initial value must be {} bytes, got {}",
                    decl.byte_size(),
                    bytes.len()
                );
                Some(bytes.to_vec())
            }
            None => None,
        };

        self.pipes.push(PipeSlot::new(decl, staged));
        Ok(self.pipes.len() - 1)
    }

    /// Perform the init handshake: announce the declared pipes, receive the
    /// settings region and the log file path.
    #[tracing::instrument(skip(self), ret(level = Level::DEBUG))]
    pub fn init(&mut self) -> Result<()> {
        ensure!(
            self.state == State::Uninitialized,
            "init is only legal once, before begin"
        );

        let mut channel = match self.channel.take() {
            Some(channel) => channel,
            None => Channel::stdio().context("Opening the host channel")?,
        };

        channel.set_read_nonblocking(true)?;

        // SAFETY: We're just using c-apis as intended.
        self.parent = unsafe { libc::getppid() };

        handshake::write_magic(&mut channel, handshake::INIT_HEAD)?;

        let (sem, shm) =
            handshake::read_region_ids(&mut channel, Deadline::after(MESSAGE_DEADLINE))?;
        let log_path =
            PathBuf::from(channel.read_cstr(MAX_PATH, Deadline::after(MESSAGE_DEADLINE))?);

        let count = self.pipes.len() as u16;
        channel.write_u16(count)?;

        for pipe in &self.pipes {
            handshake::write_decl(&mut channel, &pipe.decl)?;
        }

        handshake::write_magic(&mut channel, handshake::INIT_EOF)?;

        let settings = SettingsRegion::open(RegionIds { sem, shm })
            .context("Opening the settings region")?;
        self.snapshot = settings.load()?;

        if self.snapshot.no_log == 0 {
            self.log = match NodeLog::open(&log_path) {
                Ok(log) => log,
                Err(e) => {
                    tracing::warn!(path = %log_path.display(), error = %e, "No debug log");
                    NodeLog::closed()
                }
            };
        }

        self.settings = Some(settings);
        self.channel = Some(channel);
        self.state = State::Configured;
        Ok(())
    }

    /// Perform the begin handshake: receive a data region for every non-IN
    /// pipe, install staged constants, enter the running state.
    #[tracing::instrument(skip(self), ret(level = Level::DEBUG))]
    pub fn begin(&mut self) -> Result<()> {
        ensure!(self.state == State::Configured, "begin requires init first");

        let Some(channel) = &mut self.channel else {
            bail!("Host channel is gone");
        };

        handshake::write_magic(channel, handshake::BEGIN_HEAD)?;

        for pipe in &mut self.pipes {
            if pipe.decl.direction == Direction::In {
                continue;
            }

            let (sem, shm) =
                handshake::read_region_ids(channel, Deadline::after(MESSAGE_DEADLINE))?;

            pipe.attach(RegionIds { sem, shm }, Mode::ReadWrite)
                .with_context(|| format!("Attaching pipe {}", pipe.decl.name))?;

            if pipe.decl.direction == Direction::Const {
                pipe.install_staged()
                    .with_context(|| format!("Installing constant {}", pipe.decl.name))?;
            }
        }

        handshake::write_magic(channel, handshake::BEGIN_EOF)?;

        self.state = State::Running;
        Ok(())
    }

    /// Read an IN or CONST pipe into `buf`, which must be exactly the
    /// pipe's payload size. Legal only while running.
    ///
    /// An IN pipe with no upstream reads as [`ReadStatus::NoData`].
    pub fn read(&mut self, pipe: usize, buf: &mut [u8]) -> Result<ReadStatus> {
        ensure!(self.state == State::Running, "read requires begin first");

        let Some(slot) = self.pipes.get_mut(pipe) else {
            bail!("Unknown pipe id {pipe}");
        };

        ensure!(
            slot.decl.direction != Direction::Out,
            "Pipe {} is write-only",
            slot.decl.name
        );
        ensure!(
            buf.len() == slot.decl.byte_size(),
            "Pipe {} payload is {} bytes, buffer is {}",
            slot.decl.name,
            slot.decl.byte_size(),
            buf.len()
        );

        Ok(slot.read_into(buf)?)
    }

    /// Write `buf` to an OUT pipe, which must be exactly the pipe's payload
    /// size. Legal only while running.
    pub fn write(&mut self, pipe: usize, buf: &[u8]) -> Result<()> {
        ensure!(self.state == State::Running, "write requires begin first");

        let Some(slot) = self.pipes.get_mut(pipe) else {
            bail!("Unknown pipe id {pipe}");
        };

        ensure!(
            slot.decl.direction == Direction::Out,
            "Pipe {} is not an output",
            slot.decl.name
        );
        ensure!(
            buf.len() == slot.decl.byte_size(),
            "Pipe {} payload is {} bytes, buffer is {}",
            slot.decl.name,
            slot.decl.byte_size(),
            buf.len()
        );

        slot.write_from(buf)?;
        Ok(())
    }

    /// Per-tick housekeeping: apply pending rerouting messages, refresh the
    /// settings snapshot, and confirm the host is still alive.
    ///
    /// Must run before `read`/`write` in each tick so reroutes are never
    /// applied late.
    pub fn poll(&mut self) -> Result<()> {
        ensure!(self.state == State::Running, "poll requires begin first");

        loop {
            let Some(channel) = &mut self.channel else {
                bail!("Host channel is gone");
            };

            let index = match channel.read_u16(Deadline::after(Duration::ZERO)) {
                Ok(index) => index,
                Err(e) if e.is_timed_out() => break,
                Err(e) => return Err(e).context("Reading rerouting message"),
            };

            let (sem, shm) =
                handshake::read_region_ids(channel, Deadline::after(MESSAGE_DEADLINE))?;
            self.apply_reroute(index, sem, shm)?;
        }

        if let Some(settings) = &self.settings {
            self.snapshot = settings.load().context("Refreshing settings")?;
        }

        // SAFETY: A zero signal only probes for existence.
        if unsafe { libc::kill(self.parent, 0) } != 0 {
            bail!("Host process is gone");
        }

        Ok(())
    }

    /// Park the process until the tick driver resumes it.
    pub fn wait(&self) -> Result<()> {
        ensure!(self.state == State::Running, "wait requires begin first");

        // SAFETY: Stopping ourselves is always sound; the tick driver sends
        // the continue signal.
        unsafe {
            if libc::raise(libc::SIGSTOP) != 0 {
                bail!(std::io::Error::last_os_error());
            }
        }

        Ok(())
    }

    /// The current tick period in milliseconds, from the settings snapshot
    /// taken by the last [`poll`].
    ///
    /// [`poll`]: NodeContext::poll
    #[inline]
    pub fn period(&self) -> i64 {
        self.snapshot.tick_period_ms
    }

    /// Append a stamped line to the per-node log. No-op while logging is
    /// disabled host-wide.
    pub fn debug_log(&mut self, message: &str) {
        if self.snapshot.no_log != 0 {
            return;
        }

        self.log.write(self.snapshot.tz_offset, message);
    }

    #[tracing::instrument(skip(self))]
    fn apply_reroute(&mut self, index: u16, sem: i32, shm: i32) -> Result<()> {
        let Some(slot) = self.pipes.get_mut(usize::from(index)) else {
            bail!("Rerouting message for unknown pipe {index}");
        };

        ensure!(
            slot.decl.direction == Direction::In,
            "Rerouting message for non-IN pipe {}",
            slot.decl.name
        );

        slot.release();

        let line = if sem == 0 && shm == 0 {
            format!("Pipe[{}] disconnected", slot.decl.name)
        } else {
            slot.attach(RegionIds { sem, shm }, Mode::ReadOnly)
                .with_context(|| format!("Attaching upstream of {}", slot.decl.name))?;
            format!("Pipe[{}] connected", slot.decl.name)
        };

        self.debug_log(&line);
        Ok(())
    }
}

impl Default for NodeContext {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}
