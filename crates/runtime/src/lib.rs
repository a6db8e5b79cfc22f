//! The library a worker links against.
//!
//! A worker declares its pipes, performs the init and begin handshakes with
//! the host, then settles into a tick loop: housekeeping with [`poll`],
//! data exchange with [`read`] and [`write`], and parking in [`wait`] until
//! the tick driver resumes it.
//!
//! [`poll`]: NodeContext::poll
//! [`read`]: NodeContext::read
//! [`write`]: NodeContext::write
//! [`wait`]: NodeContext::wait

mod context;
pub use self::context::NodeContext;

mod slots;
pub use self::slots::ReadStatus;
use self::slots::PipeSlot;

mod log;
use self::log::NodeLog;

pub use protocol::{Direction, Unit};

#[cfg(test)]
mod tests;
