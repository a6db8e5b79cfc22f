//! The two-phase exchange which takes a worker from spawn to active.
//!
//! Phase A (init) is driven by the worker: it announces itself, receives the
//! settings region and its log path, and describes its pipes. Phase B (begin)
//! is initiated by the host when it decides to activate the node: every
//! non-IN pipe is endowed with a freshly created data region.
//!
//! Four magic sentinels gate the phases. Their values are part of the wire
//! contract and must not change.

use std::time::Duration;

use crate::error::ErrorKind;
use crate::{Channel, Deadline, Direction, Error, Unit};

/// Announces the start of the init phase, worker to host.
pub const INIT_HEAD: u32 = 0x83DFC690;

/// Terminates the init phase, worker to host.
pub const INIT_EOF: u32 = 0x85CBADEF;

/// Announces the start of the begin phase, worker to host.
pub const BEGIN_HEAD: u32 = 0x9067F3A2;

/// Terminates the begin phase, worker to host.
pub const BEGIN_EOF: u32 = 0x910AC8BB;

/// The deadline applied to every handshake message.
pub const MESSAGE_DEADLINE: Duration = Duration::from_secs(1);

/// The longest accepted pipe name.
pub const MAX_NAME: usize = 256;

/// The longest accepted file path.
pub const MAX_PATH: usize = 4096;

/// One pipe as declared by a worker during the init phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeDecl {
    pub direction: Direction,
    pub unit: Unit,
    pub length: u16,
    pub name: String,
}

impl PipeDecl {
    /// The payload size of the pipe in bytes.
    #[inline]
    pub fn byte_size(&self) -> usize {
        self.unit.size() * self.length as usize
    }

    /// The size of the backing region in bytes: the payload plus the leading
    /// version byte.
    #[inline]
    pub fn region_size(&self) -> usize {
        self.byte_size() + 1
    }
}

/// Write a magic sentinel.
#[inline]
pub fn write_magic(channel: &mut Channel, magic: u32) -> Result<(), Error> {
    channel.write_u32(magic)
}

/// Read a magic sentinel and fail unless it matches.
pub fn expect_magic(channel: &mut Channel, expected: u32, deadline: Deadline) -> Result<(), Error> {
    let actual = channel.read_u32(deadline)?;

    if actual != expected {
        return Err(Error::new(ErrorKind::BadMagic { expected, actual }));
    }

    Ok(())
}

/// Write one pipe declaration, init phase step 5.
pub fn write_decl(channel: &mut Channel, decl: &PipeDecl) -> Result<(), Error> {
    channel.write_u8(decl.direction.into_raw())?;
    channel.write_u8(decl.unit.into_raw())?;
    channel.write_u16(decl.length)?;
    channel.write_cstr(&decl.name)
}

/// Read one pipe declaration, init phase step 5.
pub fn read_decl(channel: &mut Channel, deadline: Deadline) -> Result<PipeDecl, Error> {
    let direction = Direction::from_raw(channel.read_u8(deadline)?)?;
    let unit = Unit::from_raw(channel.read_u8(deadline)?)?;
    let length = channel.read_u16(deadline)?;
    let name = channel.read_cstr(MAX_NAME, deadline)?;

    Ok(PipeDecl {
        direction,
        unit,
        length,
        name,
    })
}

/// Write a region identity as its semaphore and shared memory ids.
pub fn write_region_ids(channel: &mut Channel, sem: i32, shm: i32) -> Result<(), Error> {
    channel.write_i32(sem)?;
    channel.write_i32(shm)
}

/// Read a region identity.
pub fn read_region_ids(channel: &mut Channel, deadline: Deadline) -> Result<(i32, i32), Error> {
    let sem = channel.read_i32(deadline)?;
    let shm = channel.read_i32(deadline)?;
    Ok((sem, shm))
}

#[cfg(test)]
mod tests {
    use super::{BEGIN_HEAD, INIT_HEAD, PipeDecl, expect_magic, read_decl, write_decl, write_magic};
    use crate::{Channel, Deadline, Direction, Error, Unit};

    #[test]
    fn decl_round_trip() -> Result<(), Error> {
        let (mut a, mut b) = Channel::pair()?;

        let decl = PipeDecl {
            direction: Direction::Out,
            unit: Unit::Int32,
            length: 16,
            name: String::from("samples"),
        };

        write_decl(&mut a, &decl)?;
        assert_eq!(read_decl(&mut b, Deadline::none())?, decl);
        Ok(())
    }

    #[test]
    fn magic_mismatch_is_rejected() -> Result<(), Error> {
        let (mut a, mut b) = Channel::pair()?;

        write_magic(&mut a, BEGIN_HEAD)?;

        assert!(expect_magic(&mut b, INIT_HEAD, Deadline::none()).is_err());
        Ok(())
    }

    #[test]
    fn region_sizes_include_version_byte() {
        let decl = PipeDecl {
            direction: Direction::Const,
            unit: Unit::Int16,
            length: 3,
            name: String::from("k"),
        };

        assert_eq!(decl.byte_size(), 6);
        assert_eq!(decl.region_size(), 7);
    }
}
