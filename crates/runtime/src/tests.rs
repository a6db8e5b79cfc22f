use std::thread;

use anyhow::{Context as _, Result, ensure};
use protocol::handshake::{self, PipeDecl};
use protocol::{Channel, Deadline, Direction, Unit};
use region::{Mode, RegionIds, Settings, SettingsRegion, SharedRegion};

use crate::{NodeContext, ReadStatus};

const SETTINGS: Settings = Settings {
    no_log: 1,
    tz_offset: 0,
    tick_period_ms: 100,
};

/// Plays the host: answers one init handshake and one begin handshake,
/// returning the declarations and the data regions it endowed.
fn host_side(
    mut channel: Channel,
    settings: RegionIds,
) -> Result<(Channel, Vec<PipeDecl>, Vec<SharedRegion>)> {
    let deadline = Deadline::none();

    handshake::expect_magic(&mut channel, handshake::INIT_HEAD, deadline)?;
    handshake::write_region_ids(&mut channel, settings.sem, settings.shm)?;
    channel.write_cstr("/nonexistent/ignored.txt")?;

    let count = channel.read_u16(deadline)?;
    let mut decls = Vec::new();

    for _ in 0..count {
        decls.push(handshake::read_decl(&mut channel, deadline)?);
    }

    handshake::expect_magic(&mut channel, handshake::INIT_EOF, deadline)?;
    handshake::expect_magic(&mut channel, handshake::BEGIN_HEAD, deadline)?;

    let mut regions = Vec::new();

    for decl in &decls {
        if decl.direction == Direction::In {
            continue;
        }

        let region = SharedRegion::create(decl.region_size())?;
        handshake::write_region_ids(&mut channel, region.ids().sem, region.ids().shm)?;
        regions.push(region);
    }

    handshake::expect_magic(&mut channel, handshake::BEGIN_EOF, deadline)?;
    Ok((channel, decls, regions))
}

fn staged_const() -> Vec<u8> {
    let mut staged = Vec::new();

    for value in [1i16, -2, 30000] {
        staged.extend_from_slice(&value.to_ne_bytes());
    }

    staged
}

#[test]
fn declarations_are_validated() -> Result<()> {
    let mut ctx = NodeContext::new();

    ctx.add_pipe("x", Direction::Out, Unit::Int32, 1, None)?;

    // Duplicate name.
    ensure!(ctx.add_pipe("x", Direction::In, Unit::Int32, 1, None).is_err());
    // Zero length.
    ensure!(ctx.add_pipe("y", Direction::In, Unit::Int32, 0, None).is_err());
    // Initial value on a non-CONST pipe.
    ensure!(
        ctx.add_pipe("y", Direction::In, Unit::Int32, 1, Some(&[0; 4]))
            .is_err()
    );
    // Initial value of the wrong size.
    ensure!(
        ctx.add_pipe("k", Direction::Const, Unit::Int32, 1, Some(&[0; 3]))
            .is_err()
    );

    Ok(())
}

#[test]
fn operations_respect_states() -> Result<()> {
    let mut ctx = NodeContext::new();
    let pipe = ctx.add_pipe("x", Direction::Out, Unit::Int32, 1, None)?;

    let mut buf = [0u8; 4];
    ensure!(ctx.read(pipe, &mut buf).is_err());
    ensure!(ctx.write(pipe, &buf).is_err());
    ensure!(ctx.poll().is_err());
    ensure!(ctx.wait().is_err());
    ensure!(ctx.begin().is_err());
    Ok(())
}

#[test]
fn handshake_data_flow_and_rerouting() -> Result<()> {
    let settings = SettingsRegion::create(SETTINGS)?;
    let (host_channel, node_channel) = Channel::pair()?;

    let ids = settings.ids();
    let host = thread::spawn(move || host_side(host_channel, ids));

    let mut ctx = NodeContext::with_channel(node_channel);
    let out = ctx.add_pipe("x", Direction::Out, Unit::Int32, 1, None)?;
    let input = ctx.add_pipe("y", Direction::In, Unit::Int32, 1, None)?;
    let konst = ctx.add_pipe("k", Direction::Const, Unit::Int16, 3, Some(&staged_const()))?;

    ctx.init()?;
    ctx.begin()?;

    let (mut host_channel, decls, regions) = match host.join() {
        Ok(result) => result.context("Host side failed")?,
        Err(..) => anyhow::bail!("Host side panicked"),
    };

    ensure!(decls.len() == 3);
    ensure!(decls[0].name == "x" && decls[2].name == "k");

    // The staged constant was installed with a version bump.
    let const_region = &regions[1];
    let const_map = const_region.attach(Mode::ReadOnly)?;
    let mut payload = [0u8; 7];
    const_region.read_bytes(&const_map, &mut payload)?;
    ensure!(payload[0] == 1);
    ensure!(payload[1..] == staged_const()[..]);

    // The node reads its own constant back exactly once.
    let mut buf = [0u8; 6];
    ensure!(ctx.read(konst, &mut buf)? == ReadStatus::Fresh);
    ensure!(buf == staged_const()[..]);
    ensure!(ctx.read(konst, &mut buf)? == ReadStatus::NoData);

    // A write lands in the out region, version first.
    ctx.write(out, &42i32.to_ne_bytes())?;

    let out_region = &regions[0];
    let out_map = out_region.attach(Mode::ReadOnly)?;
    let mut seen = [0u8; 5];
    out_region.read_bytes(&out_map, &mut seen)?;
    ensure!(seen[0] == 1);
    ensure!(seen[1..] == 42i32.to_ne_bytes());

    // An unconnected input has no data.
    let mut buf = [0u8; 4];
    ensure!(ctx.read(input, &mut buf)? == ReadStatus::NoData);

    // Hand the input an upstream region and publish one sample.
    let upstream = SharedRegion::create(5)?;
    let upstream_map = upstream.attach(Mode::ReadWrite)?;

    {
        let _guard = upstream.lock()?;
        upstream_map.set_byte_at(0, 1);
        upstream_map.write_at(1, &7i32.to_ne_bytes());
    }

    host_channel.write_u16(input as u16)?;
    handshake::write_region_ids(&mut host_channel, upstream.ids().sem, upstream.ids().shm)?;

    ctx.poll()?;
    ensure!(ctx.read(input, &mut buf)? == ReadStatus::Fresh);
    ensure!(buf == 7i32.to_ne_bytes());
    ensure!(ctx.read(input, &mut buf)? == ReadStatus::NoData);

    // A second sample is observed exactly once as well.
    {
        let _guard = upstream.lock()?;
        upstream_map.set_byte_at(0, 2);
        upstream_map.write_at(1, &9i32.to_ne_bytes());
    }

    ensure!(ctx.read(input, &mut buf)? == ReadStatus::Fresh);
    ensure!(buf == 9i32.to_ne_bytes());

    // Disconnect: zero ids mean "no upstream".
    host_channel.write_u16(input as u16)?;
    handshake::write_region_ids(&mut host_channel, 0, 0)?;

    ctx.poll()?;
    ensure!(ctx.read(input, &mut buf)? == ReadStatus::NoData);

    drop(ctx);
    upstream_map.detach()?;
    upstream.destroy()?;

    for region in regions {
        region.destroy()?;
    }

    settings.destroy()?;
    Ok(())
}
