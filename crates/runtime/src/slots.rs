use std::io;

use protocol::{Direction, PipeDecl};
use region::{Mapping, Mode, RegionIds, SharedRegion};

/// The outcome of reading a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The producer has not written since the last read.
    NoData,
    /// A new payload was copied out.
    Fresh,
}

/// One pipe as held by the worker: the declaration plus the attached view
/// of its data region, once there is one.
#[derive(Debug)]
pub(crate) struct PipeSlot {
    pub(crate) decl: PipeDecl,
    pub(crate) staged: Option<Vec<u8>>,
    region: Option<SharedRegion>,
    map: Option<Mapping>,
    last_seen: u8,
}

impl PipeSlot {
    pub(crate) fn new(decl: PipeDecl, staged: Option<Vec<u8>>) -> Self {
        Self {
            decl,
            staged,
            region: None,
            map: None,
            last_seen: 0,
        }
    }

    /// Test if the slot has an attached region.
    pub(crate) fn is_attached(&self) -> bool {
        self.map.is_some()
    }

    /// Attach the slot to a region the host handed over.
    pub(crate) fn attach(&mut self, ids: RegionIds, mode: Mode) -> io::Result<()> {
        let region = SharedRegion::open(ids)?;
        let map = region.attach(mode)?;

        self.region = Some(region);
        self.map = Some(map);
        self.last_seen = 0;
        Ok(())
    }

    /// Drop the attached view, if any. The mapping detaches on drop.
    pub(crate) fn release(&mut self) {
        self.map = None;
        self.region = None;
        self.last_seen = 0;
    }

    /// Copy the payload out if the producer has written since the last read.
    ///
    /// Under the region lock the version byte is sampled first; only a
    /// changed version pays for the payload copy.
    pub(crate) fn read_into(&mut self, buf: &mut [u8]) -> io::Result<ReadStatus> {
        let (Some(region), Some(map)) = (&self.region, &self.map) else {
            return Ok(ReadStatus::NoData);
        };

        let _guard = region.lock()?;
        let version = map.byte_at(0);

        if version == self.last_seen {
            return Ok(ReadStatus::NoData);
        }

        map.read_at(1, buf);
        self.last_seen = version;
        Ok(ReadStatus::Fresh)
    }

    /// Post-increment the version byte and copy the payload in.
    pub(crate) fn write_from(&mut self, buf: &[u8]) -> io::Result<()> {
        let (Some(region), Some(map)) = (&self.region, &self.map) else {
            return Err(io::Error::other("pipe has no attached region"));
        };

        let _guard = region.lock()?;
        map.set_byte_at(0, map.byte_at(0).wrapping_add(1));
        map.write_at(1, buf);
        Ok(())
    }

    /// Install the staged constant payload, begin phase only.
    pub(crate) fn install_staged(&mut self) -> io::Result<()> {
        debug_assert_eq!(self.decl.direction, Direction::Const);

        let Some(staged) = self.staged.take() else {
            return Ok(());
        };

        self.write_from(&staged)
    }
}
