//! One acquisition thread per device: claim, init, read, fold, QA,
//! contribute to its group, with idle backoff and USB error recovery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::fold::fold_bytes;
use crate::ftdi::FtdiError;
use crate::group::Group;
use crate::health::HealthMonitor;
use crate::pool::Pool;
use crate::usb::{TransientKind, UsbFault};
use crate::FtdiDriver;

/// Handle the control socket can lock momentarily to snapshot a source's
/// QA state without disturbing the worker's own serial execution.
pub type SharedHealthMonitor = Arc<Mutex<HealthMonitor>>;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// `S`: bytes contributed to the group per accepted block.
    pub sample_block_bytes: usize,
    /// 0-7; the driver reads `sample_block_bytes << fold` raw bytes and
    /// folds them back down to `sample_block_bytes`.
    pub fold: u32,
    pub bitrate_hz: u32,
    pub sleep_init: Duration,
    /// `Duration::ZERO` means "wait indefinitely" rather than "don't wait".
    pub sleep_max: Duration,
    pub suspend_after: Duration,
    /// Bypass HealthMonitor and always contribute; for bench/diagnostic use.
    pub no_qa: bool,
}

/// Owns the worker thread's shutdown flag and join handle. Dropping it
/// signals shutdown and blocks until the thread has released its device
/// claim and group slot.
pub struct WorkerHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
    monitor: SharedHealthMonitor,
}

impl WorkerHandle {
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// A shared handle to this source's HealthMonitor, for the control
    /// socket's `ReportStats`/`GetRawData` snapshot reads.
    pub fn monitor(&self) -> SharedHealthMonitor {
        self.monitor.clone()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

pub struct Worker {
    name: String,
    driver: FtdiDriver,
    pool: Arc<Pool>,
    group: Arc<Group>,
    mask: u32,
    monitor: SharedHealthMonitor,
    config: WorkerConfig,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub fn spawn(
        name: impl Into<String>,
        driver: FtdiDriver,
        pool: Arc<Pool>,
        group: Arc<Group>,
        mask: u32,
        config: WorkerConfig,
    ) -> WorkerHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let monitor: SharedHealthMonitor = Arc::new(Mutex::new(HealthMonitor::new(config.bitrate_hz)));
        let worker = Worker {
            name: name.into(),
            driver,
            pool,
            group,
            mask,
            monitor: monitor.clone(),
            config,
            shutdown: shutdown.clone(),
        };

        let join = thread::Builder::new()
            .name(worker.name.clone())
            .spawn(move || worker.run())
            .expect("spawning acquisition worker thread");

        WorkerHandle { shutdown, join: Some(join), monitor }
    }

    fn run(mut self) {
        let mut claimed = self.driver.is_claimed();
        let mut sleep_for = self.config.sleep_init;
        let fold_block_len = self.config.sample_block_bytes << self.config.fold;
        let mut raw = vec![0u8; fold_block_len];

        while !self.shutdown.load(Ordering::Relaxed) {
            if !sleep_for.is_zero() {
                if sleep_for >= self.config.suspend_after && claimed {
                    self.driver.release();
                    claimed = false;
                }
                let wait = if self.config.sleep_max.is_zero() { sleep_for } else { sleep_for.min(self.config.sleep_max) };
                self.pool.wait_for_drain(wait);
                if self.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                sleep_for = if self.config.sleep_max.is_zero() {
                    sleep_for.saturating_mul(2)
                } else {
                    sleep_for.saturating_mul(2).min(self.config.sleep_max)
                };
            }

            if !claimed {
                if !self.reclaim_and_init() {
                    tracing::error!(source = %self.name, "device gone, worker exiting");
                    break;
                }
                claimed = true;
            }

            match self.read_block(&mut raw) {
                Ok(()) => {
                    let fold_len = match fold_bytes(&mut raw, self.config.fold) {
                        Ok(len) => len,
                        Err(e) => {
                            tracing::error!(source = %self.name, error = %e, "fold length mismatch, skipping block");
                            continue;
                        }
                    };
                    let accepted = self.config.no_qa || self.monitor.lock().check(&raw[..fold_len]);
                    if accepted {
                        self.group.add_entropy(self.mask, &raw[..fold_len]);
                        sleep_for = self.config.sleep_init;
                    } else {
                        sleep_for = Duration::ZERO;
                    }
                }
                Err(err) => {
                    if !self.recover_from_error(err, &mut claimed) {
                        break;
                    }
                }
            }
        }

        self.group.release_mask(self.mask);
        self.driver.release();
    }

    fn read_block(&mut self, raw: &mut [u8]) -> Result<(), FtdiError> {
        self.driver.read(raw).map(|_| ())
    }

    fn reclaim_and_init(&mut self) -> bool {
        if self.driver.claim().is_err() {
            return false;
        }
        match self.driver.init_mpsse(self.config.bitrate_hz, thread::sleep) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(source = %self.name, error = %e, "MPSSE re-init failed");
                false
            }
        }
    }

    /// Returns `false` if the worker should exit (fatal error).
    fn recover_from_error(&mut self, err: FtdiError, claimed: &mut bool) -> bool {
        tracing::warn!(source = %self.name, error = %err, "recovering from device error");
        match err {
            FtdiError::Usb(UsbFault::Fatal(_)) => false,
            FtdiError::Usb(UsbFault::Transient(TransientKind::Pipe)) => {
                self.driver.release();
                *claimed = false;
                true
            }
            FtdiError::Usb(UsbFault::Transient(_)) | FtdiError::Framing(_) | FtdiError::SyncFailed(_) => {
                let _ = self.driver.soft_reset();
                self.driver.release();
                *claimed = false;
                true
            }
            FtdiError::InvalidLatency(_) => false,
        }
    }
}
