pub(crate) mod error;
pub use self::error::Error;

mod channel;
pub use self::channel::{Channel, Deadline};

pub mod handshake;
pub use self::handshake::PipeDecl;

pub mod op;
pub use self::op::Op;

mod unit;
pub use self::unit::{Direction, Unit};
