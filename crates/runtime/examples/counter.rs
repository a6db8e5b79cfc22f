//! A producer worker: one INT32 output incremented by an INT32 constant
//! each tick.

use anyhow::Result;
use runtime::{Direction, NodeContext, Unit};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let mut ctx = NodeContext::new();

    let out = ctx.add_pipe("count", Direction::Out, Unit::Int32, 1, None)?;
    let step = ctx.add_pipe(
        "step",
        Direction::Const,
        Unit::Int32,
        1,
        Some(&1i32.to_ne_bytes()),
    )?;

    ctx.init()?;
    ctx.begin()?;

    let mut value = 0i32;
    let mut increment = 1i32;

    loop {
        ctx.poll()?;

        let mut buf = [0u8; 4];
        if ctx.read(step, &mut buf).is_ok_and(|s| s == runtime::ReadStatus::Fresh) {
            increment = i32::from_ne_bytes(buf);
            ctx.debug_log(&format!("step changed to {increment}"));
        }

        value = value.wrapping_add(increment);
        ctx.write(out, &value.to_ne_bytes())?;

        ctx.wait()?;
    }
}
