//! The operator front-end: a line console speaking the command protocol to
//! the supervisor.

use std::fs::File;
use std::io::{BufRead, BufReader};

use anyhow::{Context, Result, bail};
use protocol::{Channel, Deadline, Direction, Op, Unit};

use crate::persist::GraphFile;

/// The operator side of the command channel.
pub struct Client {
    channel: Channel,
}

/// One pipe as reported by a LIST_NODES response.
#[derive(Debug)]
pub struct PipeInfo {
    pub name: String,
    pub direction: Direction,
    pub unit: Unit,
    pub length: u16,
    pub peer: Option<(String, String)>,
}

/// One node as reported by a LIST_NODES response.
#[derive(Debug)]
pub struct NodeInfo {
    pub name: String,
    pub path: String,
    pub pipes: Vec<PipeInfo>,
}

impl Client {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    /// Responses may lag behind worker handshakes, so waits are unbounded.
    fn deadline() -> Deadline {
        Deadline::none()
    }

    pub fn add_node(&mut self, path: &str, args: &[String]) -> Result<i32> {
        self.channel.write_u8(Op::AddNode.into_raw())?;
        self.channel.write_cstr(path)?;
        self.channel.write_u16(args.len() as u16)?;

        for arg in args {
            self.channel.write_cstr(arg)?;
        }

        Ok(self.channel.read_i32(Self::deadline())?)
    }

    pub fn list_nodes(&mut self) -> Result<Vec<NodeInfo>> {
        self.channel.write_u8(Op::ListNodes.into_raw())?;

        let deadline = Self::deadline();
        let count = self.channel.read_u16(deadline)?;
        let mut nodes = Vec::with_capacity(usize::from(count));

        for _ in 0..count {
            let name = self.channel.read_cstr(protocol::handshake::MAX_NAME, deadline)?;
            let path = self.channel.read_cstr(protocol::handshake::MAX_PATH, deadline)?;
            let pipe_count = self.channel.read_u16(deadline)?;
            let mut pipes = Vec::with_capacity(usize::from(pipe_count));

            for _ in 0..pipe_count {
                let pipe_name =
                    self.channel.read_cstr(protocol::handshake::MAX_NAME, deadline)?;
                let direction = Direction::from_raw(self.channel.read_u8(deadline)?)?;
                let unit = Unit::from_raw(self.channel.read_u8(deadline)?)?;
                let length = self.channel.read_u16(deadline)?;

                let peer = match self.channel.read_u8(deadline)? {
                    0 => None,
                    _ => {
                        let peer_node = self
                            .channel
                            .read_cstr(protocol::handshake::MAX_NAME, deadline)?;
                        let peer_pipe = self
                            .channel
                            .read_cstr(protocol::handshake::MAX_NAME, deadline)?;
                        Some((peer_node, peer_pipe))
                    }
                };

                pipes.push(PipeInfo {
                    name: pipe_name,
                    direction,
                    unit,
                    length,
                    peer,
                });
            }

            nodes.push(NodeInfo { name, path, pipes });
        }

        Ok(nodes)
    }

    pub fn connect(
        &mut self,
        in_node: &str,
        in_pipe: &str,
        out_node: &str,
        out_pipe: &str,
    ) -> Result<i32> {
        self.channel.write_u8(Op::Connect.into_raw())?;
        self.channel.write_cstr(in_node)?;
        self.channel.write_cstr(in_pipe)?;
        self.channel.write_cstr(out_node)?;
        self.channel.write_cstr(out_pipe)?;
        Ok(self.channel.read_i32(Self::deadline())?)
    }

    pub fn disconnect(&mut self, in_node: &str, in_pipe: &str) -> Result<i32> {
        self.channel.write_u8(Op::Disconnect.into_raw())?;
        self.channel.write_cstr(in_node)?;
        self.channel.write_cstr(in_pipe)?;
        Ok(self.channel.read_i32(Self::deadline())?)
    }

    /// Both phases of a constant write. The values only travel once phase 1
    /// accepts the pipe.
    pub fn set_const(
        &mut self,
        node: &str,
        pipe: &str,
        values: &[String],
    ) -> Result<(i32, Option<i32>)> {
        self.channel.write_u8(Op::SetConst.into_raw())?;
        self.channel.write_cstr(node)?;
        self.channel.write_cstr(pipe)?;
        self.channel.write_i32(values.len() as i32)?;

        let phase1 = self.channel.read_i32(Self::deadline())?;

        if phase1 < 0 {
            return Ok((phase1, None));
        }

        for value in values {
            self.channel.write_cstr(value)?;
        }

        let phase2 = self.channel.read_i32(Self::deadline())?;
        Ok((phase1, Some(phase2)))
    }

    pub fn get_const(&mut self, node: &str, pipe: &str) -> Result<Option<Vec<String>>> {
        self.channel.write_u8(Op::GetConst.into_raw())?;
        self.channel.write_cstr(node)?;
        self.channel.write_cstr(pipe)?;

        let deadline = Self::deadline();
        let count = self.channel.read_i32(deadline)?;

        if count < 0 {
            return Ok(None);
        }

        let mut values = Vec::with_capacity(count as usize);

        for _ in 0..count {
            values.push(self.channel.read_cstr(64, deadline)?);
        }

        Ok(Some(values))
    }

    pub fn node_names(&mut self) -> Result<Vec<String>> {
        self.channel.write_u8(Op::NodeNames.into_raw())?;
        self.read_name_list()
    }

    pub fn pipe_names(&mut self, node: &str) -> Result<Vec<String>> {
        self.channel.write_u8(Op::PipeNames.into_raw())?;
        self.channel.write_cstr(node)?;
        self.read_name_list()
    }

    /// Read a `count: u16` followed by that many C-strings, as returned by
    /// NODE_NAMES and PIPE_NAMES.
    fn read_name_list(&mut self) -> Result<Vec<String>> {
        let deadline = Self::deadline();
        let count = self.channel.read_u16(deadline)?;
        let mut names = Vec::with_capacity(usize::from(count));

        for _ in 0..count {
            names.push(self.channel.read_cstr(protocol::handshake::MAX_NAME, deadline)?);
        }

        Ok(names)
    }

    pub fn save(&mut self, path: &str) -> Result<i32> {
        self.channel.write_u8(Op::Save.into_raw())?;
        self.channel.write_cstr(path)?;
        Ok(self.channel.read_i32(Self::deadline())?)
    }

    pub fn load_const(&mut self, node: &str, pipe: &str, payload: &[u8]) -> Result<i32> {
        self.channel.write_u8(Op::Load.into_raw())?;
        self.channel.write_cstr(node)?;
        self.channel.write_cstr(pipe)?;
        self.channel.write_i32(payload.len() as i32)?;
        self.channel.write_all(payload)?;
        Ok(self.channel.read_i32(Self::deadline())?)
    }

    pub fn timer_run(&mut self) -> Result<()> {
        self.channel.write_u8(Op::TimerRun.into_raw())?;
        Ok(())
    }

    pub fn timer_stop(&mut self) -> Result<()> {
        self.channel.write_u8(Op::TimerStop.into_raw())?;
        Ok(())
    }

    pub fn timer_set(&mut self, period_ms: i64) -> Result<()> {
        self.channel.write_u8(Op::TimerSet.into_raw())?;
        self.channel.write_i64(period_ms)?;
        Ok(())
    }

    pub fn timer_get(&mut self) -> Result<i64> {
        self.channel.write_u8(Op::TimerGet.into_raw())?;
        Ok(self.channel.read_i64(Self::deadline())?)
    }

    /// Restore a saved graph: every node is re-added under its saved name,
    /// every connection re-made, every constant payload re-loaded.
    pub fn load_graph(&mut self, path: &str) -> Result<()> {
        let file = File::open(path).with_context(|| format!("Opening {path}"))?;
        let graph = GraphFile::parse(&mut BufReader::new(file))?;

        for node in &graph.nodes {
            let args = vec![String::from("-name"), node.name.clone()];
            let result = self.add_node(&node.path, &args)?;

            if result < 0 {
                bail!("Adding node {} failed with {result}", node.name);
            }
        }

        for c in &graph.connections {
            let result = self.connect(&c.in_node, &c.in_pipe, &c.out_node, &c.out_pipe)?;

            if result < 0 {
                bail!(
                    "Connecting {}.{} to {}.{} failed with {result}",
                    c.in_node,
                    c.in_pipe,
                    c.out_node,
                    c.out_pipe
                );
            }
        }

        for c in &graph.constants {
            let result = self.load_const(&c.node, &c.pipe, &c.payload)?;

            if result < 0 {
                bail!("Restoring {}.{} failed with {result}", c.node, c.pipe);
            }
        }

        Ok(())
    }
}

/// Split a `node.pipe` reference.
fn split_ref(text: &str) -> Result<(&str, &str)> {
    match text.split_once('.') {
        Some((node, pipe)) if !node.is_empty() && !pipe.is_empty() => Ok((node, pipe)),
        _ => bail!("Expected node.pipe, got {text}"),
    }
}

fn direction_label(direction: Direction) -> &'static str {
    match direction {
        Direction::In => "in",
        Direction::Out => "out",
        Direction::Const => "const",
    }
}

/// Run the interactive console until EOF or `quit`.
pub fn run(channel: Channel) -> Result<()> {
    let mut client = Client::new(channel);
    let stdin = std::io::stdin();

    for line in stdin.lock().lines() {
        let line = line?;

        match execute(&mut client, &line) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("error: {e:#}"),
        }
    }

    Ok(())
}

/// Execute one console line. `false` ends the session.
fn execute(client: &mut Client, line: &str) -> Result<bool> {
    let mut words = line.split_whitespace();

    let Some(command) = words.next() else {
        return Ok(true);
    };

    let rest: Vec<String> = words.map(str::to_owned).collect();

    match (command, rest.as_slice()) {
        ("quit" | "exit", ..) => return Ok(false),
        ("add", [path, args @ ..]) => {
            let result = client.add_node(path, args)?;
            println!("{}", if result >= 0 { "ok" } else { "rejected" });
        }
        ("nodes", ..) => {
            for name in client.node_names()? {
                println!("{name}");
            }
        }
        ("pipes", [node]) => {
            for name in client.pipe_names(node)? {
                println!("{name}");
            }
        }
        ("list", ..) => {
            for node in client.list_nodes()? {
                println!("{} ({})", node.name, node.path);

                for pipe in node.pipes {
                    let peer = match &pipe.peer {
                        Some((n, p)) => format!(" <- {n}.{p}"),
                        None => String::new(),
                    };

                    println!(
                        "  {} {} {}[{}]{}",
                        direction_label(pipe.direction),
                        pipe.unit.name(),
                        pipe.name,
                        pipe.length,
                        peer
                    );
                }
            }
        }
        ("connect", [input, output]) => {
            let (in_node, in_pipe) = split_ref(input)?;
            let (out_node, out_pipe) = split_ref(output)?;
            let result = client.connect(in_node, in_pipe, out_node, out_pipe)?;
            println!("{}", if result >= 0 { "ok" } else { "rejected" });
        }
        ("disconnect", [input]) => {
            let (in_node, in_pipe) = split_ref(input)?;
            let result = client.disconnect(in_node, in_pipe)?;
            println!("{}", if result >= 0 { "ok" } else { "rejected" });
        }
        ("set", [target, values @ ..]) if !values.is_empty() => {
            let (node, pipe) = split_ref(target)?;

            match client.set_const(node, pipe, values)? {
                (0.., Some(0..)) => println!("ok"),
                (phase1, None) => println!("rejected in phase 1 ({phase1})"),
                (_, Some(phase2)) => println!("rejected in phase 2 ({phase2})"),
            }
        }
        ("get", [target]) => {
            let (node, pipe) = split_ref(target)?;

            match client.get_const(node, pipe)? {
                Some(values) => {
                    for value in values {
                        println!("{value}");
                    }
                }
                None => println!("rejected"),
            }
        }
        ("save", [path]) => {
            let result = client.save(path)?;
            println!("{}", if result >= 0 { "ok" } else { "rejected" });
        }
        ("load", [path]) => {
            client.load_graph(path)?;
            println!("ok");
        }
        ("run", ..) => client.timer_run()?,
        ("stop", ..) => client.timer_stop()?,
        ("period", [value]) => client.timer_set(value.parse()?)?,
        ("period", []) => println!("{}", client.timer_get()?),
        ("help", ..) => {
            println!("add <path> [args..]   nodes   pipes <node>   list");
            println!("connect <in.pipe> <out.pipe>   disconnect <in.pipe>");
            println!("set <node.pipe> <v>..   get <node.pipe>");
            println!("save <path>   load <path>   run   stop   period [ms]   quit");
        }
        _ => println!("unknown command, try help"),
    }

    Ok(true)
}
