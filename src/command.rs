//! The operator command dispatcher, host side.
//!
//! Each handler reads its request body, performs the operation against the
//! supervisor state, and writes the response. Graph-level failures travel
//! back as negative status integers; only channel-level faults escape as
//! errors, which end the supervisor.

use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::ptr;

use anyhow::{Context, Result, bail};
use protocol::handshake::{self, MAX_NAME, MAX_PATH, MESSAGE_DEADLINE};
use protocol::{Deadline, Direction, Op};
use region::{Mode, SharedRegion};

use crate::graph::{self, NodeRecord, PipeState};
use crate::persist::{GraphFile, SavedConnection, SavedConstant, SavedNode};
use crate::spawn::{self, WorkerOptions};
use crate::supervisor::{Supervisor, send_reroute};

/// The longest accepted constant value text.
const MAX_VALUE: usize = 64;

/// The largest constant payload a LOAD request may carry: the widest unit
/// at the maximum pipe length.
const MAX_PAYLOAD: i32 = 8 * u16::MAX as i32;

fn deadline() -> Deadline {
    Deadline::after(MESSAGE_DEADLINE)
}

/// Serve one opcode.
pub fn dispatch(sup: &mut Supervisor, op: Op) -> Result<()> {
    tracing::debug!(?op, "command");

    match op {
        Op::AddNode => add_node(sup),
        Op::ListNodes => list_nodes(sup),
        Op::Connect => connect(sup),
        Op::Disconnect => disconnect(sup),
        Op::SetConst => set_const(sup),
        Op::GetConst => get_const(sup),
        Op::NodeNames => node_names(sup),
        Op::PipeNames => pipe_names(sup),
        Op::Save => save(sup),
        Op::Load => load(sup),
        Op::TimerRun => timer_enable(sup, true),
        Op::TimerStop => timer_enable(sup, false),
        Op::TimerSet => timer_set(sup),
        Op::TimerGet => timer_get(sup),
    }
}

fn add_node(sup: &mut Supervisor) -> Result<()> {
    let path = sup.channel.read_cstr(MAX_PATH, deadline())?;
    let argc = sup.channel.read_u16(deadline())?;

    let mut args = Vec::with_capacity(usize::from(argc));

    for _ in 0..argc {
        args.push(sup.channel.read_cstr(MAX_PATH, deadline())?);
    }

    let options = WorkerOptions::parse(&path, args);

    let result = match add_node_inner(sup, &path, options) {
        Ok(()) => 0,
        Err(e) => {
            tracing::warn!(%path, error = %e, "AddNode rejected");
            -1
        }
    };

    sup.channel.write_i32(result)?;
    Ok(())
}

fn add_node_inner(sup: &mut Supervisor, path: &str, options: WorkerOptions) -> Result<()> {
    if sup.name_exists(&options.name) {
        bail!("Node {} already exists", options.name);
    }

    let log_path = options.log_path(&sup.session_dir);
    let worker = spawn::spawn(path, &options, &log_path)?;

    match phase_init(sup, worker, path, options, log_path) {
        Ok(node) => {
            tracing::info!(node = %node.name, pid = node.pid, "node added");
            sup.inactive.push(node);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Drive the host side of the init handshake for a fresh worker.
///
/// Any fault kills the worker; a node that cannot describe itself within
/// the deadline never becomes a record.
fn phase_init(
    sup: &mut Supervisor,
    mut worker: spawn::SpawnedWorker,
    path: &str,
    options: WorkerOptions,
    log_path: std::path::PathBuf,
) -> Result<NodeRecord> {
    let result = (|| -> Result<Vec<PipeState>> {
        handshake::expect_magic(&mut worker.channel, handshake::INIT_HEAD, deadline())?;

        let ids = sup.settings.ids();
        handshake::write_region_ids(&mut worker.channel, ids.sem, ids.shm)?;
        worker.channel.write_cstr(&log_path.to_string_lossy())?;

        let count = worker.channel.read_u16(deadline())?;
        let mut pipes = Vec::with_capacity(usize::from(count));

        for _ in 0..count {
            let decl = handshake::read_decl(&mut worker.channel, deadline())?;

            if pipes.iter().any(|p: &PipeState| p.decl.name == decl.name) {
                bail!("Pipe {} declared twice", decl.name);
            }

            pipes.push(PipeState::new(decl));
        }

        handshake::expect_magic(&mut worker.channel, handshake::INIT_EOF, deadline())?;
        Ok(pipes)
    })();

    match result {
        Ok(pipes) => Ok(NodeRecord {
            pid: worker.pid,
            name: options.name,
            path: path.to_owned(),
            channel: worker.channel,
            log_path,
            pipes,
        }),
        Err(e) => {
            // SAFETY: We're just using c-apis as intended.
            unsafe {
                if libc::kill(worker.pid, libc::SIGKILL) == 0 {
                    libc::waitpid(worker.pid, ptr::null_mut(), 0);
                }
            }

            Err(e).context("Init handshake failed")
        }
    }
}

fn list_nodes(sup: &mut Supervisor) -> Result<()> {
    let Supervisor {
        channel, active, ..
    } = sup;

    channel.write_u16(active.len() as u16)?;

    for (_, node) in active.iter() {
        channel.write_cstr(&node.name)?;
        channel.write_cstr(&node.path)?;
        channel.write_u16(node.pipes.len() as u16)?;

        for pipe in &node.pipes {
            channel.write_cstr(&pipe.decl.name)?;
            channel.write_u8(pipe.decl.direction.into_raw())?;
            channel.write_u8(pipe.decl.unit.into_raw())?;
            channel.write_u16(pipe.decl.length)?;

            match &pipe.peer {
                Some((peer_node, peer_pipe)) => {
                    channel.write_u8(1)?;
                    channel.write_cstr(peer_node)?;
                    channel.write_cstr(peer_pipe)?;
                }
                None => channel.write_u8(0)?,
            }
        }
    }

    Ok(())
}

fn connect(sup: &mut Supervisor) -> Result<()> {
    let in_node = sup.channel.read_cstr(MAX_NAME, deadline())?;
    let in_pipe = sup.channel.read_cstr(MAX_NAME, deadline())?;
    let out_node = sup.channel.read_cstr(MAX_NAME, deadline())?;
    let out_pipe = sup.channel.read_cstr(MAX_NAME, deadline())?;

    let result = match connect_inner(sup, &in_node, &in_pipe, &out_node, &out_pipe) {
        Ok(()) => 0,
        Err(e) => {
            tracing::warn!(%in_node, %in_pipe, %out_node, %out_pipe, error = %e, "Connect rejected");
            -1
        }
    };

    sup.channel.write_i32(result)?;
    Ok(())
}

fn connect_inner(
    sup: &mut Supervisor,
    in_node: &str,
    in_pipe: &str,
    out_node: &str,
    out_pipe: &str,
) -> Result<()> {
    let Some(in_key) = sup.find_active(in_node) else {
        bail!("Unknown node {in_node}");
    };

    let Some(out_key) = sup.find_active(out_node) else {
        bail!("Unknown node {out_node}");
    };

    let (in_index, ids) = {
        let consumer = &sup.active[in_key];
        let producer = &sup.active[out_key];

        let Some(in_index) = consumer.pipe_index(in_pipe) else {
            bail!("Node {in_node} has no pipe {in_pipe}");
        };

        let Some(out_index) = producer.pipe_index(out_pipe) else {
            bail!("Node {out_node} has no pipe {out_pipe}");
        };

        graph::validate_connection(
            &consumer.pipes[in_index].decl,
            &producer.pipes[out_index].decl,
        )?;

        let Some(region) = &producer.pipes[out_index].region else {
            bail!("Pipe {out_node}.{out_pipe} has no region");
        };

        (in_index, region.ids())
    };

    let consumer = &mut sup.active[in_key];
    send_reroute(&mut consumer.channel, in_index as u16, ids.sem, ids.shm)?;
    consumer.pipes[in_index].peer = Some((out_node.to_owned(), out_pipe.to_owned()));

    tracing::info!(%in_node, %in_pipe, %out_node, %out_pipe, "connected");
    Ok(())
}

fn disconnect(sup: &mut Supervisor) -> Result<()> {
    let in_node = sup.channel.read_cstr(MAX_NAME, deadline())?;
    let in_pipe = sup.channel.read_cstr(MAX_NAME, deadline())?;

    let result = match disconnect_inner(sup, &in_node, &in_pipe) {
        Ok(()) => 0,
        Err(e) => {
            tracing::warn!(%in_node, %in_pipe, error = %e, "Disconnect rejected");
            -1
        }
    };

    sup.channel.write_i32(result)?;
    Ok(())
}

fn disconnect_inner(sup: &mut Supervisor, in_node: &str, in_pipe: &str) -> Result<()> {
    let Some(key) = sup.find_active(in_node) else {
        bail!("Unknown node {in_node}");
    };

    let node = &mut sup.active[key];

    let Some(index) = node.pipe_index(in_pipe) else {
        bail!("Node {in_node} has no pipe {in_pipe}");
    };

    if node.pipes[index].decl.direction != Direction::In {
        bail!("Pipe {in_node}.{in_pipe} is not an input");
    }

    // An unconnected input takes the message harmlessly.
    send_reroute(&mut node.channel, index as u16, 0, 0)?;
    node.pipes[index].peer = None;

    tracing::info!(%in_node, %in_pipe, "disconnected");
    Ok(())
}

fn set_const(sup: &mut Supervisor) -> Result<()> {
    let node = sup.channel.read_cstr(MAX_NAME, deadline())?;
    let pipe = sup.channel.read_cstr(MAX_NAME, deadline())?;
    let count = sup.channel.read_i32(deadline())?;

    let target = sup.find_active(&node).and_then(|key| {
        let index = sup.active[key].pipe_index(&pipe)?;
        let decl = &sup.active[key].pipes[index].decl;

        (decl.direction == Direction::Const && count == i32::from(decl.length))
            .then_some((key, index))
    });

    // Phase 1: the operator sends no values unless the pipe checks out.
    let Some((key, index)) = target else {
        tracing::warn!(%node, %pipe, count, "SetConst rejected in phase 1");
        sup.channel.write_i32(-1)?;
        return Ok(());
    };

    sup.channel.write_i32(0)?;

    let mut texts = Vec::with_capacity(count as usize);

    for _ in 0..count {
        texts.push(sup.channel.read_cstr(MAX_VALUE, deadline())?);
    }

    let result = match set_const_apply(sup, key, index, &texts) {
        Ok(()) => 0,
        Err(e) => {
            tracing::warn!(%node, %pipe, error = %e, "SetConst rejected in phase 2");
            -1
        }
    };

    sup.channel.write_i32(result)?;
    Ok(())
}

/// Parse every value, then publish the payload in one locked write. A
/// single bad value leaves the region untouched.
fn set_const_apply(sup: &Supervisor, key: usize, index: usize, texts: &[String]) -> Result<()> {
    let pipe = &sup.active[key].pipes[index];
    let unit = pipe.decl.unit;
    let width = unit.size();

    let mut payload = vec![0u8; pipe.decl.byte_size()];

    for (slot, text) in texts.iter().enumerate() {
        unit.parse(text, &mut payload[slot * width..(slot + 1) * width])?;
    }

    let Some(region) = &pipe.region else {
        bail!("Pipe has no region");
    };

    write_payload(region, &payload)
}

/// Bump the version byte and replace the payload under the region lock.
fn write_payload(region: &SharedRegion, payload: &[u8]) -> Result<()> {
    let map = region.attach(Mode::ReadWrite)?;

    {
        let _guard = region.lock()?;
        map.set_byte_at(0, map.byte_at(0).wrapping_add(1));
        map.write_at(1, payload);
    }

    map.detach()?;
    Ok(())
}

/// Copy the payload out under the region lock.
fn read_payload(region: &SharedRegion, size: usize) -> Result<Vec<u8>> {
    let map = region.attach(Mode::ReadOnly)?;
    let mut payload = vec![0u8; size];

    {
        let _guard = region.lock()?;
        map.read_at(1, &mut payload);
    }

    map.detach()?;
    Ok(payload)
}

fn get_const(sup: &mut Supervisor) -> Result<()> {
    let node = sup.channel.read_cstr(MAX_NAME, deadline())?;
    let pipe = sup.channel.read_cstr(MAX_NAME, deadline())?;

    let values = match get_const_inner(sup, &node, &pipe) {
        Ok(values) => values,
        Err(e) => {
            tracing::warn!(%node, %pipe, error = %e, "GetConst rejected");
            sup.channel.write_i32(-1)?;
            return Ok(());
        }
    };

    sup.channel.write_i32(values.len() as i32)?;

    for value in values {
        sup.channel.write_cstr(&value)?;
    }

    Ok(())
}

fn get_const_inner(sup: &Supervisor, node: &str, pipe: &str) -> Result<Vec<String>> {
    let Some(key) = sup.find_active(node) else {
        bail!("Unknown node {node}");
    };

    let record = &sup.active[key];

    let Some(index) = record.pipe_index(pipe) else {
        bail!("Node {node} has no pipe {pipe}");
    };

    let state = &record.pipes[index];

    if state.decl.direction != Direction::Const {
        bail!("Pipe {node}.{pipe} is not a constant");
    }

    let Some(region) = &state.region else {
        bail!("Pipe {node}.{pipe} has no region");
    };

    let payload = read_payload(region, state.decl.byte_size())?;
    let unit = state.decl.unit;
    let width = unit.size();

    Ok(payload
        .chunks_exact(width)
        .map(|chunk| unit.format(chunk))
        .collect())
}

fn node_names(sup: &mut Supervisor) -> Result<()> {
    let Supervisor {
        channel, active, ..
    } = sup;

    channel.write_u16(active.len() as u16)?;

    for (_, node) in active.iter() {
        channel.write_cstr(&node.name)?;
    }

    Ok(())
}

fn pipe_names(sup: &mut Supervisor) -> Result<()> {
    let node = sup.channel.read_cstr(MAX_NAME, deadline())?;

    let names: Vec<String> = match sup.find_active(&node) {
        Some(key) => sup.active[key]
            .pipes
            .iter()
            .map(|p| p.decl.name.clone())
            .collect(),
        None => Vec::new(),
    };

    sup.channel.write_u16(names.len() as u16)?;

    for name in names {
        sup.channel.write_cstr(&name)?;
    }

    Ok(())
}

fn save(sup: &mut Supervisor) -> Result<()> {
    let path = sup.channel.read_cstr(MAX_PATH, deadline())?;

    let result = match save_inner(sup, &path) {
        Ok(()) => 0,
        Err(e) => {
            tracing::warn!(%path, error = %e, "Save failed");
            -1
        }
    };

    sup.channel.write_i32(result)?;
    Ok(())
}

fn save_inner(sup: &Supervisor, path: &str) -> Result<()> {
    let mut graph = GraphFile::default();

    for (_, node) in sup.active.iter() {
        graph.nodes.push(SavedNode {
            path: node.path.clone(),
            name: node.name.clone(),
        });

        for pipe in &node.pipes {
            if let Some((out_node, out_pipe)) = &pipe.peer {
                graph.connections.push(SavedConnection {
                    in_node: node.name.clone(),
                    in_pipe: pipe.decl.name.clone(),
                    out_node: out_node.clone(),
                    out_pipe: out_pipe.clone(),
                });
            }

            if pipe.decl.direction == Direction::Const {
                let Some(region) = &pipe.region else {
                    continue;
                };

                graph.constants.push(SavedConstant {
                    node: node.name.clone(),
                    pipe: pipe.decl.name.clone(),
                    payload: read_payload(region, pipe.decl.byte_size())?,
                });
            }
        }
    }

    let file = File::create(path).with_context(|| format!("Creating {path}"))?;
    let mut out = BufWriter::new(file);
    graph.write(&mut out)?;
    out.flush()?;
    Ok(())
}

fn load(sup: &mut Supervisor) -> Result<()> {
    let node = sup.channel.read_cstr(MAX_NAME, deadline())?;
    let pipe = sup.channel.read_cstr(MAX_NAME, deadline())?;
    let size = sup.channel.read_i32(deadline())?;

    if !(0..=MAX_PAYLOAD).contains(&size) {
        bail!("Load payload size {size} out of range");
    }

    let mut payload = vec![0u8; size as usize];
    sup.channel.read_exact(&mut payload, deadline())?;

    let result = match load_inner(sup, &node, &pipe, &payload) {
        Ok(()) => 0,
        Err(e) => {
            tracing::warn!(%node, %pipe, error = %e, "Load rejected");
            -1
        }
    };

    sup.channel.write_i32(result)?;
    Ok(())
}

fn load_inner(sup: &Supervisor, node: &str, pipe: &str, payload: &[u8]) -> Result<()> {
    let Some(key) = sup.find_active(node) else {
        bail!("Unknown node {node}");
    };

    let record = &sup.active[key];

    let Some(index) = record.pipe_index(pipe) else {
        bail!("Node {node} has no pipe {pipe}");
    };

    let state = &record.pipes[index];

    if state.decl.direction != Direction::Const {
        bail!("Pipe {node}.{pipe} is not a constant");
    }

    if payload.len() != state.decl.byte_size() {
        bail!(
            "Payload is {} bytes, pipe takes {}",
            payload.len(),
            state.decl.byte_size()
        );
    }

    let Some(region) = &state.region else {
        bail!("Pipe {node}.{pipe} has no region");
    };

    write_payload(region, payload)
}

fn timer_enable(sup: &mut Supervisor, enabled: bool) -> Result<()> {
    if let Err(e) = sup.wakeup.set_enabled(enabled) {
        tracing::error!(error = %e, "Timer flag unreachable");
    }

    Ok(())
}

fn timer_set(sup: &mut Supervisor) -> Result<()> {
    let period = sup.channel.read_i64(deadline())?;

    if let Err(e) = sup.settings.update(|s| s.tick_period_ms = period) {
        tracing::error!(error = %e, "Settings unreachable");
    } else {
        tracing::info!(period, "tick period set");
    }

    Ok(())
}

fn timer_get(sup: &mut Supervisor) -> Result<()> {
    let period = match sup.settings.load() {
        Ok(settings) => settings.tick_period_ms,
        Err(e) => {
            tracing::error!(error = %e, "Settings unreachable");
            -1
        }
    };

    sup.channel.write_i64(period)?;
    Ok(())
}
