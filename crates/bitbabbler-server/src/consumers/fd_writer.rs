//! Blocking writer to a caller-supplied file descriptor (`stdout` or a
//! fixed path), optionally capped at a total byte count, firing a
//! completion callback when the cap is reached or the write side closes.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitbabbler_core::Pool;

const CHUNK_BYTES: usize = 4096;

pub struct FdWriter<W: Write> {
    out: W,
    pool: Arc<Pool>,
    max_bytes: Option<u64>,
    shutdown: Arc<AtomicBool>,
}

impl<W: Write> FdWriter<W> {
    pub fn new(out: W, pool: Arc<Pool>, max_bytes: Option<u64>, shutdown: Arc<AtomicBool>) -> Self {
        Self { out, pool, max_bytes, shutdown }
    }

    /// Runs until `max_bytes` is reached, the shutdown flag is set, or a
    /// write fails (peer closed). Calls `on_complete` exactly once before
    /// returning.
    pub fn run(mut self, on_complete: impl FnOnce(u64)) {
        let mut written = 0u64;
        let mut buf = vec![0u8; CHUNK_BYTES];

        while !self.shutdown.load(Ordering::Relaxed) {
            let remaining = match self.max_bytes {
                Some(max) if written >= max => break,
                Some(max) => ((max - written) as usize).min(CHUNK_BYTES),
                None => CHUNK_BYTES,
            };

            let n = self.pool.read(&mut buf[..remaining]);
            if n == 0 {
                continue;
            }
            if let Err(e) = self.out.write_all(&buf[..n]) {
                tracing::debug!(error = %e, "fd writer: peer closed");
                break;
            }
            written += n as u64;
        }

        on_complete(written);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn stops_exactly_at_max_bytes() {
        let pool = Arc::new(Pool::new(CHUNK_BYTES));
        pool.add_entropy(&vec![0xAAu8; CHUNK_BYTES]);
        let shutdown = Arc::new(AtomicBool::new(false));
        let sink: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let write_target = sink.clone();

        struct CollectingWriter(Arc<Mutex<Vec<u8>>>);
        impl Write for CollectingWriter {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let writer = FdWriter::new(CollectingWriter(write_target), pool, Some(100), shutdown);
        let mut completed_at = None;
        writer.run(|n| completed_at = Some(n));

        assert_eq!(completed_at, Some(100));
        assert_eq!(sink.lock().unwrap().len(), 100);
    }
}
