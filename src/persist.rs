//! The graph save-file codec.
//!
//! A text file of three LF-terminated sections, each closed by a blank
//! line: node path/name pairs, connection name quadruples, and constant
//! payloads stored as raw length-prefixed bytes.

use std::io::{BufRead, Write};

use anyhow::{Context, Result, bail, ensure};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedNode {
    pub path: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedConnection {
    pub in_node: String,
    pub in_pipe: String,
    pub out_node: String,
    pub out_pipe: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedConstant {
    pub node: String,
    pub pipe: String,
    pub payload: Vec<u8>,
}

/// A parsed or to-be-written save file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GraphFile {
    pub nodes: Vec<SavedNode>,
    pub connections: Vec<SavedConnection>,
    pub constants: Vec<SavedConstant>,
}

impl GraphFile {
    /// Serialize to a writer.
    pub fn write(&self, out: &mut impl Write) -> Result<()> {
        for node in &self.nodes {
            writeln!(out, "{}", node.path)?;
            writeln!(out, "{}", node.name)?;
        }

        writeln!(out)?;

        for c in &self.connections {
            writeln!(out, "{}", c.in_node)?;
            writeln!(out, "{}", c.in_pipe)?;
            writeln!(out, "{}", c.out_node)?;
            writeln!(out, "{}", c.out_pipe)?;
        }

        writeln!(out)?;

        for c in &self.constants {
            writeln!(out, "{}", c.node)?;
            writeln!(out, "{}", c.pipe)?;
            writeln!(out, "{}", c.payload.len())?;
            out.write_all(&c.payload)?;
            writeln!(out)?;
        }

        writeln!(out)?;
        Ok(())
    }

    /// Parse from a reader.
    pub fn parse(input: &mut impl BufRead) -> Result<Self> {
        let mut graph = GraphFile::default();

        while let Some(path) = read_line(input)? {
            if path.is_empty() {
                break;
            }

            let Some(name) = read_line(input)? else {
                bail!("Node entry for {path} is missing its name");
            };

            graph.nodes.push(SavedNode { path, name });
        }

        while let Some(in_node) = read_line(input)? {
            if in_node.is_empty() {
                break;
            }

            let (Some(in_pipe), Some(out_node), Some(out_pipe)) =
                (read_line(input)?, read_line(input)?, read_line(input)?)
            else {
                bail!("Truncated connection entry for {in_node}");
            };

            graph.connections.push(SavedConnection {
                in_node,
                in_pipe,
                out_node,
                out_pipe,
            });
        }

        while let Some(node) = read_line(input)? {
            if node.is_empty() {
                break;
            }

            let (Some(pipe), Some(count)) = (read_line(input)?, read_line(input)?) else {
                bail!("Truncated constant entry for {node}");
            };

            let count = count
                .parse::<usize>()
                .with_context(|| format!("Bad byte count for constant {node}.{pipe}"))?;

            let mut payload = vec![0u8; count];
            input.read_exact(&mut payload)?;

            let mut newline = [0u8; 1];
            input.read_exact(&mut newline)?;
            ensure!(
                newline[0] == b'\n',
                "Constant payload for {node}.{pipe} is not newline-terminated"
            );

            graph.constants.push(SavedConstant {
                node,
                pipe,
                payload,
            });
        }

        Ok(graph)
    }
}

/// Read one LF-terminated line as a string, without the terminator.
///
/// Reports `None` at end of file.
fn read_line(input: &mut impl BufRead) -> Result<Option<String>> {
    let mut bytes = Vec::new();
    let n = input.read_until(b'\n', &mut bytes)?;

    if n == 0 {
        return Ok(None);
    }

    if bytes.last() == Some(&b'\n') {
        bytes.pop();
    }

    match String::from_utf8(bytes) {
        Ok(line) => Ok(Some(line)),
        Err(..) => bail!("Save file contains a non-UTF-8 name line"),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use anyhow::Result;

    use super::{GraphFile, SavedConnection, SavedConstant, SavedNode};

    fn sample() -> GraphFile {
        GraphFile {
            nodes: vec![
                SavedNode {
                    path: String::from("/p/src"),
                    name: String::from("src"),
                },
                SavedNode {
                    path: String::from("/p/snk"),
                    name: String::from("snk"),
                },
            ],
            connections: vec![SavedConnection {
                in_node: String::from("snk"),
                in_pipe: String::from("y"),
                out_node: String::from("src"),
                out_pipe: String::from("x"),
            }],
            constants: vec![SavedConstant {
                node: String::from("src"),
                pipe: String::from("k"),
                payload: vec![1, 0, 254, 255, 48, 117],
            }],
        }
    }

    #[test]
    fn round_trip() -> Result<()> {
        let graph = sample();

        let mut bytes = Vec::new();
        graph.write(&mut bytes)?;

        let parsed = GraphFile::parse(&mut Cursor::new(bytes))?;
        assert_eq!(parsed, graph);
        Ok(())
    }

    #[test]
    fn payload_may_contain_newlines() -> Result<()> {
        let mut graph = sample();
        graph.constants[0].payload = vec![b'\n', 0, b'\n'];

        let mut bytes = Vec::new();
        graph.write(&mut bytes)?;

        let parsed = GraphFile::parse(&mut Cursor::new(bytes))?;
        assert_eq!(parsed.constants[0].payload, vec![b'\n', 0, b'\n']);
        Ok(())
    }

    #[test]
    fn empty_graph_round_trip() -> Result<()> {
        let graph = GraphFile::default();

        let mut bytes = Vec::new();
        graph.write(&mut bytes)?;

        let parsed = GraphFile::parse(&mut Cursor::new(bytes))?;
        assert_eq!(parsed, graph);
        Ok(())
    }

    #[test]
    fn truncated_connection_is_rejected() {
        let text = "\nsnk\ny\nsrc\n";
        assert!(GraphFile::parse(&mut Cursor::new(text)).is_err());
    }
}
