//! `seedd`: the entropy-acquisition daemon. Enumerates configured FTDI
//! devices, spawns one acquisition worker per device feeding a shared
//! Group/Pool, and serves the control socket and any configured
//! consumers until signalled to stop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use eyre::{Context as _, Result};

use bitbabbler_core::{Group, Pool, Worker, WorkerConfig};
use bitbabbler_server::config::BitbabblerConfig;
use bitbabbler_server::consumers::kernel::LinuxKernelSink;
use bitbabbler_server::consumers::{KernelFeeder, UdpSource, Watch};
use bitbabbler_server::{devices, SourceRegistry};

#[derive(Debug, Parser)]
#[clap(name = "seedd", version)]
struct Args {
    #[clap(long, short, help = "path to the daemon's TOML configuration file")]
    config: Option<PathBuf>,

    #[clap(long, help = "override the control socket path from the config file")]
    socket: Option<PathBuf>,

    #[clap(long, short, help = "initial log verbosity: negative quiets, positive is more verbose", default_value = "0")]
    verbosity: i64,

    #[clap(long, help = "bypass HealthMonitor and always contribute read blocks; for bench use only")]
    no_qa: bool,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => BitbabblerConfig::from_file(path).wrap_err("loading config file")?,
        None => BitbabblerConfig::default(),
    };
    if let Some(socket) = args.socket {
        config.control_socket_path = socket;
    }
    config.no_qa |= args.no_qa;

    let verbosity = bitbabbler_server::logging::init(args.verbosity);

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            tracing::info!("received shutdown signal");
            shutdown.store(true, Ordering::SeqCst);
        })
        .wrap_err("installing signal handler")?;
    }

    let usb_context = rusb::Context::new().wrap_err("opening libusb context")?;
    let mut pools: HashMap<u32, Arc<Pool>> = HashMap::new();
    let mut groups: HashMap<u32, Arc<Group>> = HashMap::new();
    let mut registry = SourceRegistry::new();
    let mut worker_handles = Vec::new();

    if config.devices.is_empty() {
        tracing::warn!("no devices configured; seedd will serve an empty control socket");
    }

    for device_config in &config.devices {
        let device_id = device_config.device_id().wrap_err("parsing configured device id")?;
        let pool = pools
            .entry(device_config.group)
            .or_insert_with(|| Arc::new(Pool::new(config.pool_size)))
            .clone();
        let group = groups
            .entry(device_config.group)
            .or_insert_with(|| Arc::new(Group::new(device_config.group, config.sample_block_bytes, pool.clone())))
            .clone();

        let driver = match devices::open_driver(&usb_context, &device_id, device_config.latency_ms) {
            Ok(d) => d,
            Err(e) => {
                tracing::error!(device = %device_id, error = %e, "skipping device: could not open");
                continue;
            }
        };

        let mask = group.next_mask().wrap_err("group saturated")?;
        let worker_config = WorkerConfig {
            sample_block_bytes: config.sample_block_bytes,
            fold: device_config.fold,
            bitrate_hz: device_config.bitrate_hz,
            sleep_init: config.sleep_init(),
            sleep_max: config.sleep_max(),
            suspend_after: config.suspend_after(),
            no_qa: config.no_qa,
        };

        let handle = Worker::spawn(device_id.to_string(), driver, pool, group.clone(), mask, worker_config);
        registry.register(device_id.to_string(), handle.monitor());
        worker_handles.push(handle);
    }

    let default_pool = pools.entry(0).or_insert_with(|| Arc::new(Pool::new(config.pool_size))).clone();
    let mut consumer_threads = Vec::new();

    if config.consumers.kernel {
        match LinuxKernelSink::open(&config.consumers.kernel_device_path) {
            Ok(sink) => {
                let feeder = KernelFeeder::new(default_pool.clone(), Box::new(sink), shutdown.clone());
                consumer_threads.push(std::thread::spawn(move || feeder.run()));
            }
            Err(e) => {
                tracing::error!(path = ?config.consumers.kernel_device_path, error = %e, "could not open kernel entropy sink; kernel feeder disabled");
            }
        }
    }

    if let Some(addr) = config.consumers.udp_bind.clone() {
        match UdpSource::bind(addr.clone(), default_pool.clone(), shutdown.clone()) {
            Ok(source) => consumer_threads.push(std::thread::spawn(move || source.run())),
            Err(e) => tracing::error!(addr = %addr, error = %e, "could not bind udp entropy source"),
        }
    }

    if let Some(path) = config.consumers.watch_path.clone() {
        let delay = std::time::Duration::from_millis(config.consumers.watch_delay_ms);
        match Watch::open(&path, default_pool.clone(), config.consumers.watch_block_bytes, delay, None, shutdown.clone()) {
            Ok(watch) => consumer_threads.push(std::thread::spawn(move || watch.run())),
            Err(e) => tracing::error!(path = ?path, error = %e, "could not open watch source"),
        }
    }

    let registry = Arc::new(registry);
    let socket_path = config.control_socket_path.clone();
    let socket_shutdown = shutdown.clone();
    let socket_registry = registry.clone();
    let socket_verbosity = verbosity.clone();
    let socket_thread = std::thread::spawn(move || {
        if let Err(e) = bitbabbler_server::control::serve(&socket_path, socket_registry, socket_verbosity, socket_shutdown) {
            tracing::error!(error = %e, "control socket exited");
        }
    });

    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }

    tracing::info!("shutting down");
    drop(worker_handles);
    let _ = socket_thread.join();
    // Consumers block on `Pool::read`, which only wakes on new entropy;
    // with every acquisition worker already stopped there may be none
    // left coming, so these threads are left to die with the process
    // rather than joined.
    drop(consumer_threads);

    Ok(())
}
