//! A consumer worker: logs every fresh INT32 sample on its input.

use anyhow::Result;
use runtime::{Direction, NodeContext, ReadStatus, Unit};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let mut ctx = NodeContext::new();
    let input = ctx.add_pipe("value", Direction::In, Unit::Int32, 1, None)?;

    ctx.init()?;
    ctx.begin()?;

    loop {
        ctx.poll()?;

        let mut buf = [0u8; 4];

        match ctx.read(input, &mut buf)? {
            ReadStatus::Fresh => {
                ctx.debug_log(&format!("value = {}", i32::from_ne_bytes(buf)));
            }
            ReadStatus::NoData => {}
        }

        ctx.wait()?;
    }
}
