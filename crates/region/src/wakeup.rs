use std::io;
use std::mem;

use crate::{Mapping, Mode, RegionIds, SharedRegion};

/// The number of PIDs the wakeup table can hold.
pub const PID_CAPACITY: usize = 4095;

/// Slot count: the enable flag, the PID slots and the terminator.
const SLOTS: usize = 1 + PID_CAPACITY + 1;

/// The shared list of worker PIDs the tick driver resumes.
///
/// Layout is an `i32` enable flag followed by a zero-terminated `i32` PID
/// list. The host enrolls a PID when a node activates and withdraws it when
/// the node dies; the tick driver walks the list under the lock.
#[derive(Debug)]
pub struct WakeupTable {
    region: SharedRegion,
    map: Mapping,
}

impl WakeupTable {
    /// Create an empty, disabled table.
    pub fn create() -> io::Result<Self> {
        let region = SharedRegion::create(SLOTS * mem::size_of::<i32>())?;
        let map = region.attach(Mode::ReadWrite)?;

        let this = Self { region, map };

        {
            let _guard = this.region.lock()?;

            for slot in 0..SLOTS {
                this.write_slot(slot, 0);
            }
        }

        Ok(this)
    }

    /// Open the table from its kernel ids.
    pub fn open(ids: RegionIds) -> io::Result<Self> {
        let region = SharedRegion::open(ids)?;
        let map = region.attach(Mode::ReadWrite)?;
        Ok(Self { region, map })
    }

    /// The kernel identity of the table.
    #[inline]
    pub fn ids(&self) -> RegionIds {
        self.region.ids()
    }

    /// Flip the enable flag.
    pub fn set_enabled(&self, enabled: bool) -> io::Result<()> {
        let _guard = self.region.lock()?;
        self.write_slot(0, enabled as i32);
        Ok(())
    }

    /// Append a PID. Reports `false` when the table is full.
    #[tracing::instrument(skip(self))]
    pub fn enroll(&self, pid: i32) -> io::Result<bool> {
        let _guard = self.region.lock()?;

        for slot in 1..=PID_CAPACITY {
            if self.read_slot(slot) == 0 {
                self.write_slot(slot, pid);
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Remove a PID, compacting the list.
    #[tracing::instrument(skip(self))]
    pub fn withdraw(&self, pid: i32) -> io::Result<()> {
        let _guard = self.region.lock()?;

        let mut keep = 1;

        for slot in 1..=PID_CAPACITY {
            let value = self.read_slot(slot);

            if value == 0 {
                break;
            }

            if value != pid {
                self.write_slot(keep, value);
                keep += 1;
            }
        }

        for slot in keep..=PID_CAPACITY {
            if self.read_slot(slot) == 0 {
                break;
            }

            self.write_slot(slot, 0);
        }

        Ok(())
    }

    /// Visit every enrolled PID under the lock, provided the table is
    /// enabled. Reports how many PIDs were visited.
    pub fn visit_enabled(&self, mut f: impl FnMut(i32)) -> io::Result<usize> {
        let _guard = self.region.lock()?;

        if self.read_slot(0) == 0 {
            return Ok(0);
        }

        let mut visited = 0;

        for slot in 1..=PID_CAPACITY {
            let pid = self.read_slot(slot);

            if pid == 0 {
                break;
            }

            f(pid);
            visited += 1;
        }

        Ok(visited)
    }

    /// Snapshot the enrolled PIDs regardless of the enable flag.
    pub fn pids(&self) -> io::Result<Vec<i32>> {
        let _guard = self.region.lock()?;
        let mut out = Vec::new();

        for slot in 1..=PID_CAPACITY {
            let pid = self.read_slot(slot);

            if pid == 0 {
                break;
            }

            out.push(pid);
        }

        Ok(out)
    }

    /// Tear the table down. Creator only.
    pub fn destroy(self) -> io::Result<()> {
        let Self { region, map } = self;
        map.detach()?;
        region.destroy()
    }

    #[inline]
    fn read_slot(&self, slot: usize) -> i32 {
        let mut bytes = [0u8; 4];
        self.map.read_at(slot * mem::size_of::<i32>(), &mut bytes);
        i32::from_ne_bytes(bytes)
    }

    #[inline]
    fn write_slot(&self, slot: usize, value: i32) {
        self.map
            .write_at(slot * mem::size_of::<i32>(), &value.to_ne_bytes());
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::WakeupTable;

    #[test]
    fn enroll_withdraw_compacts() -> io::Result<()> {
        let table = WakeupTable::create()?;

        assert!(table.enroll(100)?);
        assert!(table.enroll(200)?);
        assert!(table.enroll(300)?);

        table.withdraw(200)?;
        assert_eq!(table.pids()?, vec![100, 300]);

        table.withdraw(100)?;
        table.withdraw(300)?;
        assert_eq!(table.pids()?, Vec::<i32>::new());

        table.destroy()
    }

    #[test]
    fn disabled_table_visits_nothing() -> io::Result<()> {
        let table = WakeupTable::create()?;
        table.enroll(42)?;

        let mut seen = Vec::new();
        assert_eq!(table.visit_enabled(|pid| seen.push(pid))?, 0);

        table.set_enabled(true)?;
        assert_eq!(table.visit_enabled(|pid| seen.push(pid))?, 1);
        assert_eq!(seen, vec![42]);

        table.destroy()
    }
}
