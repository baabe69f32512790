//! External-device drain: read `block_size` bytes at a time from a path,
//! sleeping `delay` between blocks, up to `max_bytes` total. Used to pull
//! output from a device this daemon doesn't otherwise manage (a second
//! generator, a file someone else is populating) into the pool.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bitbabbler_core::Pool;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("opening watch source {0:?}: {1}")]
    Open(PathBuf, #[source] std::io::Error),
}

pub struct Watch {
    file: File,
    pool: Arc<Pool>,
    block_size: usize,
    delay: Duration,
    max_bytes: Option<u64>,
    shutdown: Arc<AtomicBool>,
}

impl Watch {
    pub fn open(
        path: &Path,
        pool: Arc<Pool>,
        block_size: usize,
        delay: Duration,
        max_bytes: Option<u64>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, WatchError> {
        let file = File::open(path).map_err(|e| WatchError::Open(path.to_owned(), e))?;
        Ok(Self { file, pool, block_size, delay, max_bytes, shutdown })
    }

    pub fn run(mut self) {
        let mut buf = vec![0u8; self.block_size];
        let mut total = 0u64;

        while !self.shutdown.load(Ordering::Relaxed) {
            if let Some(max) = self.max_bytes {
                if total >= max {
                    break;
                }
            }

            let n = match self.file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(error = %e, "watch source read failed");
                    break;
                }
            };

            self.pool.add_entropy(&buf[..n]);
            total += n as u64;

            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn stops_at_max_bytes_even_with_more_data_available() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0x42u8; 64]).unwrap();

        let pool = Arc::new(Pool::new(64));
        let shutdown = Arc::new(AtomicBool::new(false));
        let watch = Watch::open(file.path(), pool.clone(), 8, Duration::ZERO, Some(16), shutdown).unwrap();
        watch.run();

        assert_eq!(pool.fill(), 16);
    }

    #[test]
    fn stops_at_eof_when_under_max_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0x7Eu8; 20]).unwrap();

        let pool = Arc::new(Pool::new(64));
        let shutdown = Arc::new(AtomicBool::new(false));
        let watch = Watch::open(file.path(), pool.clone(), 8, Duration::ZERO, Some(1000), shutdown).unwrap();
        watch.run();

        assert_eq!(pool.fill(), 20);
    }
}
