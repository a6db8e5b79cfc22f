//! Host-side graph state: node records and their pipe descriptors.

use std::path::PathBuf;

use anyhow::{Result, ensure};
use protocol::{Channel, Direction, PipeDecl};
use region::SharedRegion;

/// One pipe as tracked by the host.
///
/// OUT and CONST pipes own their data region once the node is active. IN
/// pipes own nothing; a connected IN records its upstream as a name pair
/// resolved through the node table, never as a live handle, so a peer's
/// death cannot dangle.
#[derive(Debug)]
pub struct PipeState {
    pub decl: PipeDecl,
    pub region: Option<SharedRegion>,
    pub peer: Option<(String, String)>,
}

impl PipeState {
    pub fn new(decl: PipeDecl) -> Self {
        Self {
            decl,
            region: None,
            peer: None,
        }
    }
}

/// One worker as tracked by the host, from spawn until its death is
/// observed.
#[derive(Debug)]
pub struct NodeRecord {
    pub pid: i32,
    pub name: String,
    pub path: String,
    pub channel: Channel,
    pub log_path: PathBuf,
    pub pipes: Vec<PipeState>,
}

impl NodeRecord {
    /// Find a pipe by name.
    pub fn pipe_index(&self, name: &str) -> Option<usize> {
        self.pipes.iter().position(|p| p.decl.name == name)
    }

    /// Destroy every region the node owns. Called exactly once, when the
    /// record is dropped from the graph.
    pub fn destroy_regions(&mut self) {
        for pipe in &mut self.pipes {
            if let Some(region) = pipe.region.take() {
                if let Err(e) = region.destroy() {
                    tracing::warn!(
                        node = %self.name,
                        pipe = %pipe.decl.name,
                        error = %e,
                        "Leaked region"
                    );
                }
            }
        }
    }
}

/// Check that a producer/consumer pair may be connected.
pub fn validate_connection(input: &PipeDecl, output: &PipeDecl) -> Result<()> {
    ensure!(
        input.direction == Direction::In,
        "Pipe {} is not an input",
        input.name
    );
    ensure!(
        output.direction == Direction::Out,
        "Pipe {} is not an output",
        output.name
    );
    ensure!(
        input.unit == output.unit,
        "Unit mismatch: {} carries {}, {} carries {}",
        input.name,
        input.unit.name(),
        output.name,
        output.unit.name()
    );
    ensure!(
        input.length == output.length,
        "Length mismatch: {} is {}, {} is {}",
        input.name,
        input.length,
        output.name,
        output.length
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use protocol::{Direction, PipeDecl, Unit};

    use super::validate_connection;

    fn decl(name: &str, direction: Direction, unit: Unit, length: u16) -> PipeDecl {
        PipeDecl {
            direction,
            unit,
            length,
            name: name.to_owned(),
        }
    }

    #[test]
    fn accepts_matching_pair() {
        let input = decl("y", Direction::In, Unit::Int32, 1);
        let output = decl("x", Direction::Out, Unit::Int32, 1);
        assert!(validate_connection(&input, &output).is_ok());
    }

    #[test]
    fn rejects_unit_mismatch() {
        let input = decl("y", Direction::In, Unit::Int64, 1);
        let output = decl("x", Direction::Out, Unit::Int32, 1);
        assert!(validate_connection(&input, &output).is_err());
    }

    #[test]
    fn rejects_length_mismatch() {
        let input = decl("y", Direction::In, Unit::Int32, 2);
        let output = decl("x", Direction::Out, Unit::Int32, 1);
        assert!(validate_connection(&input, &output).is_err());
    }

    #[test]
    fn rejects_wrong_directions() {
        let konst = decl("k", Direction::Const, Unit::Int32, 1);
        let output = decl("x", Direction::Out, Unit::Int32, 1);
        assert!(validate_connection(&konst, &output).is_err());
        assert!(validate_connection(&output, &output).is_err());
    }
}
