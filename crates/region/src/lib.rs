//! Named shared buffers and their locks.
//!
//! A region is a System V shared memory segment paired with a binary
//! semaphore. The host creates and destroys regions; workers only attach
//! views of them. Byte 0 of every pipe data region is the version counter.

mod shared;
pub use self::shared::{LockGuard, Mapping, Mode, RegionIds, SharedRegion};

mod settings;
pub use self::settings::{Settings, SettingsRegion};

mod wakeup;
pub use self::wakeup::{PID_CAPACITY, WakeupTable};
