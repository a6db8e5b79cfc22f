//! The supervisor process: owns the graph, the shared regions and the
//! worker lifecycle.
//!
//! Forked from the front-end, it loops at a ~1 ms cadence over three
//! passes: activate inactive nodes, reap dead workers, and serve one
//! operator command.

use std::fs::File;
use std::path::PathBuf;
use std::ptr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use protocol::handshake::{self, MESSAGE_DEADLINE};
use protocol::{Channel, Deadline, Direction, Op};
use region::{Settings, SettingsRegion, SharedRegion, WakeupTable};
use slab::Slab;

use crate::graph::NodeRecord;
use crate::{clock, command, tick};

/// The tick period a fresh supervisor publishes.
const DEFAULT_PERIOD_MS: i64 = 100;

/// How long the command pass waits for an opcode before yielding.
const COMMAND_PROBE: Duration = Duration::from_micros(100);

/// How long the activation pass waits for a worker's begin announcement.
const BEGIN_PROBE: Duration = Duration::from_millis(1);

/// Idle sleep when no command arrived.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Run the supervisor to completion and produce its exit code.
///
/// Exit codes: 0 on clean shutdown, 1 when startup resources (including the
/// tick driver fork) fail, -1 when the log sink cannot be opened.
pub fn run(channel: Channel, session_dir: PathBuf, no_log: bool) -> i32 {
    let log_file = match File::create(session_dir.join("NodeSystem.txt")) {
        Ok(file) => file,
        Err(..) => return -1,
    };

    tracing_subscriber::fmt()
        .with_writer(Arc::new(log_file))
        .with_ansi(false)
        .init();

    let settings = SettingsRegion::create(Settings {
        no_log: no_log as i32,
        tz_offset: clock::tz_offset_seconds(),
        tick_period_ms: DEFAULT_PERIOD_MS,
    });

    let settings = match settings {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!(error = %e, "No settings region");
            return 1;
        }
    };

    let wakeup = match WakeupTable::create() {
        Ok(wakeup) => wakeup,
        Err(e) => {
            tracing::error!(error = %e, "No wakeup table");
            _ = settings.destroy();
            return 1;
        }
    };

    // SAFETY: We're just using c-apis as intended.
    let supervisor_pid = unsafe { libc::getpid() };

    // SAFETY: The child moves straight into the tick loop and exits from
    // it; it never touches the graph.
    let tick_pid = unsafe { libc::fork() };

    if tick_pid == -1 {
        tracing::error!("Tick driver fork failed");
        _ = wakeup.destroy();
        _ = settings.destroy();
        return 1;
    }

    if tick_pid == 0 {
        std::process::exit(tick::run(&settings, &wakeup, supervisor_pid));
    }

    if let Err(e) = channel.set_read_nonblocking(true) {
        tracing::error!(error = %e, "Operator channel unusable");
        _ = wakeup.destroy();
        _ = settings.destroy();
        return 1;
    }

    tracing::info!(pid = supervisor_pid, tick_pid, "supervisor up");

    let supervisor = Supervisor {
        channel,
        settings,
        wakeup,
        inactive: Vec::new(),
        active: Slab::new(),
        session_dir,
        tick_pid,
    };

    supervisor.main_loop()
}

enum Activation {
    /// The worker has not announced begin yet.
    Pending,
    /// The node moved to the active set.
    Activated,
    /// The node was killed and dropped.
    Failed,
}

pub struct Supervisor {
    pub(crate) channel: Channel,
    pub(crate) settings: SettingsRegion,
    pub(crate) wakeup: WakeupTable,
    pub(crate) inactive: Vec<NodeRecord>,
    pub(crate) active: Slab<NodeRecord>,
    pub(crate) session_dir: PathBuf,
    tick_pid: i32,
}

impl Supervisor {
    fn main_loop(mut self) -> i32 {
        loop {
            self.activation_pass();
            self.liveness_pass();

            if !self.command_pass() {
                break;
            }
        }

        self.shutdown();
        0
    }

    /// Test if any known node, active or inactive, carries the name.
    pub(crate) fn name_exists(&self, name: &str) -> bool {
        self.inactive.iter().any(|n| n.name == name)
            || self.active.iter().any(|(_, n)| n.name == name)
    }

    /// Find an active node by name.
    pub(crate) fn find_active(&self, name: &str) -> Option<usize> {
        self.active
            .iter()
            .find(|(_, n)| n.name == name)
            .map(|(key, _)| key)
    }

    /// Take every inactive node through the begin handshake if it is ready
    /// for it.
    fn activation_pass(&mut self) {
        let mut index = 0;

        while index < self.inactive.len() {
            match self.try_activate(index) {
                Activation::Pending => index += 1,
                Activation::Activated | Activation::Failed => {}
            }
        }
    }

    fn try_activate(&mut self, index: usize) -> Activation {
        match Self::phase_begin(&mut self.inactive[index]) {
            Ok(false) => Activation::Pending,
            Ok(true) => {
                let node = self.inactive.remove(index);
                // The pid is read before the record moves anywhere.
                let pid = node.pid;

                match self.wakeup.enroll(pid) {
                    Ok(true) => {
                        tracing::info!(node = %node.name, pid, "node active");
                        self.active.insert(node);
                        Activation::Activated
                    }
                    Ok(false) | Err(..) => {
                        tracing::warn!(node = %node.name, "Wakeup enrollment failed");
                        Self::kill_node(node);
                        Activation::Failed
                    }
                }
            }
            Err(e) => {
                let node = self.inactive.remove(index);
                tracing::warn!(node = %node.name, error = %e, "Begin handshake failed");
                Self::kill_node(node);
                Activation::Failed
            }
        }
    }

    /// Drive the host side of the begin handshake.
    ///
    /// `Ok(false)` means the worker has not sent its announcement yet; once
    /// the head arrives the rest of the phase runs under the 1 s message
    /// deadline and any fault is hard.
    fn phase_begin(node: &mut NodeRecord) -> Result<bool> {
        let head = match node.channel.read_u32(Deadline::after(BEGIN_PROBE)) {
            Ok(head) => head,
            Err(e) if e.is_timed_out() => return Ok(false),
            Err(e) => return Err(e).context("Reading begin announcement"),
        };

        if head != handshake::BEGIN_HEAD {
            bail!("Bad begin announcement {head:#010x}");
        }

        for pipe in &mut node.pipes {
            if pipe.decl.direction == Direction::In {
                continue;
            }

            let region = SharedRegion::create(pipe.decl.region_size())
                .with_context(|| format!("Creating region for pipe {}", pipe.decl.name))?;

            let ids = region.ids();
            pipe.region = Some(region);

            handshake::write_region_ids(&mut node.channel, ids.sem, ids.shm)?;
        }

        handshake::expect_magic(
            &mut node.channel,
            handshake::BEGIN_EOF,
            Deadline::after(MESSAGE_DEADLINE),
        )?;
        Ok(true)
    }

    /// Reap exited children, then drop every node whose process is gone.
    fn liveness_pass(&mut self) {
        // SAFETY: We're just using c-apis as intended.
        unsafe {
            while libc::waitpid(-1, ptr::null_mut(), libc::WNOHANG) > 0 {}
        }

        let dead: Vec<usize> = self
            .active
            .iter()
            .filter(|(_, node)| !alive(node.pid))
            .map(|(key, _)| key)
            .collect();

        for key in dead {
            let mut node = self.active.remove(key);
            tracing::warn!(node = %node.name, pid = node.pid, "worker died");

            if let Err(e) = self.wakeup.withdraw(node.pid) {
                tracing::warn!(error = %e, "Wakeup withdrawal failed");
            }

            node.destroy_regions();
            self.disconnect_consumers_of(&node.name);
        }

        let mut index = 0;

        while index < self.inactive.len() {
            if alive(self.inactive[index].pid) {
                index += 1;
                continue;
            }

            let mut node = self.inactive.remove(index);
            tracing::warn!(node = %node.name, "worker died before activation");
            node.destroy_regions();
        }
    }

    /// Route every IN pipe fed by the named node back to "no upstream".
    fn disconnect_consumers_of(&mut self, dead: &str) {
        for (_, node) in self.active.iter_mut() {
            for index in 0..node.pipes.len() {
                let fed_by_dead = node.pipes[index]
                    .peer
                    .as_ref()
                    .is_some_and(|(peer, _)| peer == dead);

                if !fed_by_dead {
                    continue;
                }

                node.pipes[index].peer = None;

                if let Err(e) = send_reroute(&mut node.channel, index as u16, 0, 0) {
                    tracing::warn!(node = %node.name, error = %e, "Reroute failed");
                }
            }
        }
    }

    /// Serve at most one operator command. `false` ends the supervisor.
    fn command_pass(&mut self) -> bool {
        let raw = match self.channel.read_u8(Deadline::after(COMMAND_PROBE)) {
            Ok(raw) => raw,
            Err(e) if e.is_timed_out() => {
                thread::sleep(IDLE_SLEEP);
                return true;
            }
            Err(e) => {
                tracing::info!(error = %e, "Operator channel closed");
                return false;
            }
        };

        let op = match Op::from_raw(raw) {
            Ok(op) => op,
            Err(e) => {
                tracing::error!(error = %e, "Operator channel desynchronized");
                return false;
            }
        };

        match command::dispatch(self, op) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(?op, error = %e, "Command channel failed");
                false
            }
        }
    }

    /// Kill every worker, release every region, stop the tick driver.
    fn shutdown(mut self) {
        tracing::info!("shutting down");

        for node in self.inactive.drain(..) {
            Self::kill_node(node);
        }

        let keys: Vec<usize> = self.active.iter().map(|(key, _)| key).collect();

        for key in keys {
            let node = self.active.remove(key);
            Self::kill_node(node);
        }

        // SAFETY: We're just using c-apis as intended.
        unsafe {
            libc::kill(self.tick_pid, libc::SIGKILL);
            libc::waitpid(self.tick_pid, ptr::null_mut(), 0);
        }

        if let Err(e) = self.wakeup.destroy() {
            tracing::warn!(error = %e, "Leaked wakeup table");
        }

        if let Err(e) = self.settings.destroy() {
            tracing::warn!(error = %e, "Leaked settings region");
        }
    }

    /// Kill a worker and release everything it owned.
    fn kill_node(mut node: NodeRecord) {
        // SAFETY: We're just using c-apis as intended.
        unsafe {
            if libc::kill(node.pid, libc::SIGKILL) == 0 {
                libc::waitpid(node.pid, ptr::null_mut(), 0);
            }
        }

        node.destroy_regions();
    }
}

/// Probe a process with a zero signal.
fn alive(pid: i32) -> bool {
    // SAFETY: A zero signal only probes for existence.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Write one rerouting triple to a consumer's stdin.
pub(crate) fn send_reroute(
    channel: &mut Channel,
    pipe_index: u16,
    sem: i32,
    shm: i32,
) -> Result<()> {
    channel.write_u16(pipe_index)?;
    channel.write_i32(sem)?;
    channel.write_i32(shm)?;
    Ok(())
}
