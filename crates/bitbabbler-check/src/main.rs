//! `bbcheck`: opens one device directly and runs it through a
//! `HealthMonitor` outside of the pool/daemon machinery, for bringing up
//! new hardware or diagnosing a device already flagged unhealthy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::{Context as _, Result};

use bitbabbler_core::fold::fold_bytes;
use bitbabbler_core::{DeviceId, HealthMonitor};
use bitbabbler_server::devices;

#[derive(Debug, Parser)]
#[clap(name = "bbcheck", version)]
struct Args {
    /// Device identity: a serial, `bus:devnum`, or `bus-port[.port]*`.
    device: String,

    #[clap(long, default_value = "1000000", help = "MPSSE bitrate in Hz")]
    bitrate_hz: u32,

    #[clap(long, default_value = "64", help = "bytes read per block before folding")]
    block_bytes: usize,

    #[clap(long, default_value = "0", help = "number of XOR-fold passes applied to each block")]
    fold: u32,

    #[clap(long, default_value = "16")]
    latency_ms: u8,

    #[clap(long, help = "stop after this many blocks instead of running until interrupted")]
    blocks: Option<u64>,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let device_id: DeviceId = args.device.parse().wrap_err("parsing device identity")?;
    let context = rusb::Context::new().wrap_err("opening libusb context")?;
    let mut driver =
        devices::open_driver(&context, &device_id, args.latency_ms).wrap_err("opening device")?;
    driver.claim().wrap_err("claiming device")?;
    driver.init_mpsse(args.bitrate_hz, std::thread::sleep).wrap_err("initializing MPSSE mode")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc_handler(move || shutdown.store(true, Ordering::SeqCst))?;
    }

    let mut monitor = HealthMonitor::new(args.bitrate_hz);
    let read_len = args.block_bytes << args.fold;
    let mut raw = vec![0u8; read_len];
    let mut blocks_seen = 0u64;

    while !shutdown.load(Ordering::Relaxed) {
        if let Some(limit) = args.blocks {
            if blocks_seen >= limit {
                break;
            }
        }

        driver.read(&mut raw).wrap_err("reading from device")?;
        let fold_len = fold_bytes(&mut raw, args.fold).wrap_err("folding block")?;
        let accepted = monitor.check(&raw[..fold_len]);
        blocks_seen += 1;

        println!(
            "block {blocks_seen}: {} (bytes_analysed={}, bytes_passed={})",
            if accepted { "PASS" } else { "FAIL" },
            monitor.bytes_analysed(),
            monitor.bytes_passed(),
        );

        if blocks_seen % 50 == 0 {
            println!("{}", monitor.stats_value());
        }
    }

    println!("final: {}", monitor.stats_value());
    driver.release();
    Ok(())
}

fn ctrlc_handler(f: impl Fn() + Send + 'static) -> Result<()> {
    ctrlc::set_handler(f).wrap_err("installing signal handler")
}
