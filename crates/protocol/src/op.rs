//! Operator command opcodes.
//!
//! Each request on the operator channel starts with a single opcode byte.
//! Fallible handlers answer with a trailing signed status, non-negative for
//! success.

use crate::Error;
use crate::error::ErrorKind;

/// The closed set of operator commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    /// Spawn a worker executable and take it through the init handshake.
    /// Body: path, argc and argv. `-name NAME` in argv renames the node.
    AddNode = 0,
    /// Describe every node with its full pipe table and connection state.
    ListNodes = 1,
    /// Route an OUT pipe's region to an IN pipe.
    /// Body: consumer node and pipe, producer node and pipe.
    Connect = 2,
    /// Route an IN pipe back to "no upstream".
    Disconnect = 3,
    /// Overwrite a CONST pipe from textual values, two-phased: the pipe is
    /// validated before the values are sent.
    SetConst = 4,
    /// Read a CONST pipe back as textual values.
    GetConst = 5,
    /// List node names only.
    NodeNames = 6,
    /// List the pipe names of one node.
    PipeNames = 7,
    /// Write the graph (nodes, connections, constants) to a text file.
    Save = 8,
    /// Restore one CONST payload from raw bytes.
    Load = 9,
    /// Enable the periodic tick.
    TimerRun = 10,
    /// Disable the periodic tick.
    TimerStop = 11,
    /// Set the tick period in milliseconds.
    TimerSet = 12,
    /// Get the tick period in milliseconds.
    TimerGet = 13,
}

impl Op {
    /// Convert the opcode to its wire code.
    #[inline]
    pub fn into_raw(self) -> u8 {
        self as u8
    }

    /// Convert a wire code to an `Op`.
    #[inline]
    pub fn from_raw(raw: u8) -> Result<Self, Error> {
        match raw {
            0 => Ok(Op::AddNode),
            1 => Ok(Op::ListNodes),
            2 => Ok(Op::Connect),
            3 => Ok(Op::Disconnect),
            4 => Ok(Op::SetConst),
            5 => Ok(Op::GetConst),
            6 => Ok(Op::NodeNames),
            7 => Ok(Op::PipeNames),
            8 => Ok(Op::Save),
            9 => Ok(Op::Load),
            10 => Ok(Op::TimerRun),
            11 => Ok(Op::TimerStop),
            12 => Ok(Op::TimerSet),
            13 => Ok(Op::TimerGet),
            raw => Err(Error::new(ErrorKind::UnknownOp(raw))),
        }
    }
}
