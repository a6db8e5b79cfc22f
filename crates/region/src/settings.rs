use std::io;
use std::mem;

use crate::{Mapping, Mode, RegionIds, SharedRegion};

/// The host-wide settings block.
///
/// One region holds a single `Settings`; the host writes it, every worker
/// reads it. The timezone offset is in seconds east of UTC.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub no_log: i32,
    pub tz_offset: i64,
    pub tick_period_ms: i64,
}

/// The settings region together with a live mapping of it.
#[derive(Debug)]
pub struct SettingsRegion {
    region: SharedRegion,
    map: Mapping,
}

impl SettingsRegion {
    /// Create the region and publish the initial settings.
    pub fn create(initial: Settings) -> io::Result<Self> {
        let region = SharedRegion::create(mem::size_of::<Settings>())?;
        let map = region.attach(Mode::ReadWrite)?;

        let this = Self { region, map };
        this.store(initial)?;
        Ok(this)
    }

    /// Open the region read-only from its kernel ids.
    pub fn open(ids: RegionIds) -> io::Result<Self> {
        let region = SharedRegion::open(ids)?;
        let map = region.attach(Mode::ReadOnly)?;
        Ok(Self { region, map })
    }

    /// The kernel identity of the region.
    #[inline]
    pub fn ids(&self) -> RegionIds {
        self.region.ids()
    }

    /// Read the settings under the lock.
    pub fn load(&self) -> io::Result<Settings> {
        let _guard = self.region.lock()?;

        // SAFETY: The region was created to hold a `Settings`.
        Ok(unsafe { self.map.read_struct::<Settings>() })
    }

    /// Overwrite the settings under the lock.
    pub fn store(&self, settings: Settings) -> io::Result<()> {
        let _guard = self.region.lock()?;

        // SAFETY: The region was created to hold a `Settings`.
        unsafe {
            self.map.write_struct(settings);
        }

        Ok(())
    }

    /// Apply a mutation to the settings under a single lock hold.
    pub fn update(&self, f: impl FnOnce(&mut Settings)) -> io::Result<Settings> {
        let _guard = self.region.lock()?;

        // SAFETY: The region was created to hold a `Settings`.
        unsafe {
            let mut settings = self.map.read_struct::<Settings>();
            f(&mut settings);
            self.map.write_struct(settings);
            Ok(settings)
        }
    }

    /// Tear the region down. Creator only.
    pub fn destroy(self) -> io::Result<()> {
        let Self { region, map } = self;
        map.detach()?;
        region.destroy()
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::{Settings, SettingsRegion};

    #[test]
    fn publish_and_read_back() -> io::Result<()> {
        let settings = Settings {
            no_log: 0,
            tz_offset: 32400,
            tick_period_ms: 100,
        };

        let host = SettingsRegion::create(settings)?;
        let worker = SettingsRegion::open(host.ids())?;

        assert_eq!(worker.load()?, settings);

        host.update(|s| s.tick_period_ms = 50)?;
        assert_eq!(worker.load()?.tick_period_ms, 50);

        drop(worker);
        host.destroy()
    }
}
