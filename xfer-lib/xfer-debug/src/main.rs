//! Loopback exerciser: brings two engines up in one process, runs a
//! write/read round trip plus a notification echo, and prints timings.

use std::time::Instant;

use anyhow::{anyhow, bail};
use clap::Parser;
use tracing::info;
use xfer_lib::{
    LocalDesc, MemKind, RemoteDesc, XferConfig, XferEngine, XferOp,
    XferOptArgs,
};

#[derive(Debug, Parser)]
struct Args {
    #[clap(flatten)]
    logging: logging_lib::LoggingOpts,

    /// Workers per engine.
    #[clap(long, default_value_t = 2)]
    num_workers: usize,

    /// Transfer size in bytes.
    #[clap(long, default_value_t = 4 << 20)]
    size: usize,

    /// Timed round trips after one verified warmup.
    #[clap(long, default_value_t = 16)]
    repeats: usize,

    /// Run the initiator's progress on a background thread.
    #[clap(long)]
    progress_thread: bool,
}

fn wait_done(
    engine: &XferEngine,
    handle: &mut xfer_lib::XferHandle,
) -> anyhow::Result<()> {
    while !engine.check_xfer(handle)?.is_done() {
        std::hint::spin_loop();
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging_lib::init(&args.logging)?;

    let mut cfg_a = XferConfig::new("debug-a");
    cfg_a.num_workers = args.num_workers;
    cfg_a.enable_progress_thread = args.progress_thread;
    let a = XferEngine::new(cfg_a)?;

    let mut cfg_b = XferConfig::new("debug-b");
    cfg_b.num_workers = args.num_workers;
    let b = XferEngine::new(cfg_b)?;

    a.load_remote_conn_info("debug-b", &b.get_conn_info())?;
    b.load_remote_conn_info("debug-a", &a.get_conn_info())?;
    a.connect("debug-b")?;
    info!(size = args.size, workers = args.num_workers, "engines connected");

    let src = vec![0xda_u8; args.size];
    let dst = vec![0_u8; args.size];
    let scratch = vec![0_u8; args.size];

    let src_md =
        a.register_mem(src.as_ptr() as u64, src.len(), MemKind::Host, 0)?;
    let scratch_md = a.register_mem(
        scratch.as_ptr() as u64,
        scratch.len(),
        MemKind::Host,
        0,
    )?;
    let dst_md =
        b.register_mem(dst.as_ptr() as u64, dst.len(), MemKind::Host, 0)?;

    // B advertises its buffer; A imports it against its own workers.
    let dst_remote =
        a.load_remote_md(&b.get_public_data(&dst_md), MemKind::Host, "debug-b")?;

    // Warmup with verification: write A→B, read back into scratch.
    let opts = XferOptArgs { notif_msg: Some("round-trip done".to_string()) };
    let mut handle = a.prep_xfer("debug-b")?;
    a.post_xfer(
        XferOp::Write,
        &[LocalDesc { addr: src.as_ptr() as u64, len: src.len(), md: &src_md }],
        &[RemoteDesc { addr: dst.as_ptr() as u64, len: dst.len(), md: &dst_remote }],
        "debug-b",
        &mut handle,
        Some(&opts),
    )?;
    wait_done(&a, &mut handle)?;
    a.release_req(handle)?;
    if dst != src {
        bail!("write verification failed");
    }

    let mut handle = a.prep_xfer("debug-b")?;
    a.post_xfer(
        XferOp::Read,
        &[LocalDesc {
            addr: scratch.as_ptr() as u64,
            len: scratch.len(),
            md: &scratch_md,
        }],
        &[RemoteDesc { addr: dst.as_ptr() as u64, len: dst.len(), md: &dst_remote }],
        "debug-b",
        &mut handle,
        None,
    )?;
    wait_done(&a, &mut handle)?;
    a.release_req(handle)?;
    if scratch != src {
        bail!("read verification failed");
    }

    let mut notifs = Vec::new();
    while notifs.is_empty() {
        b.get_notifs(&mut notifs)?;
    }
    let (sender, msg) =
        notifs.first().ok_or_else(|| anyhow!("no notification"))?;
    println!("notification: {sender}: {msg}");

    // Timed write loop.
    let t0 = Instant::now();
    for _ in 0..args.repeats {
        let mut handle = a.prep_xfer("debug-b")?;
        a.post_xfer(
            XferOp::Write,
            &[LocalDesc { addr: src.as_ptr() as u64, len: src.len(), md: &src_md }],
            &[RemoteDesc {
                addr: dst.as_ptr() as u64,
                len: dst.len(),
                md: &dst_remote,
            }],
            "debug-b",
            &mut handle,
            None,
        )?;
        wait_done(&a, &mut handle)?;
        a.release_req(handle)?;
    }
    let elapsed = t0.elapsed().as_secs_f64();
    let gbps = (args.size * args.repeats) as f64 / elapsed * 8.0 / 1e9;
    println!(
        "write: {} x {} B in {:.3} ms ({:.1} Gbps)",
        args.repeats,
        args.size,
        elapsed * 1e3,
        gbps
    );

    a.unload_md(dst_remote);
    a.deregister_mem(src_md);
    a.deregister_mem(scratch_md);
    b.deregister_mem(dst_md);
    a.disconnect("debug-b")?;
    Ok(())
}
