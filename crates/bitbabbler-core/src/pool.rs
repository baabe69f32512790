//! Fixed-size circular entropy pool: fills from empty, then XOR-mixes new
//! bytes in once full. Shared by every worker in a source's group and by
//! every consumer.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

pub const DEFAULT_POOL_SIZE: usize = 64 * 1024;

struct PoolBuf {
    data: Vec<u8>,
    fill: usize,
    next: usize,
}

pub struct Pool {
    size: usize,
    buf: Mutex<PoolBuf>,
    /// Consumers wait here; producers broadcast it when `fill` advances.
    sink_cond: Condvar,
    /// Producers pace their idle-sleep here; consumers broadcast it after
    /// every `read` so a backed-off worker wakes and resumes.
    source_cond: Condvar,
}

impl Pool {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            buf: Mutex::new(PoolBuf { data: vec![0u8; size], fill: 0, next: 0 }),
            sink_cond: Condvar::new(),
            source_cond: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.size
    }

    pub fn fill(&self) -> usize {
        self.buf.lock().fill
    }

    /// Fill from `fill` upward while there's room; XOR-mix any excess into
    /// the circular region starting at `next`, wrapping. Never blocks.
    pub fn add_entropy(&self, input: &[u8]) {
        let mut buf = self.buf.lock();
        let before_fill = buf.fill;
        let mut remaining = input;

        if buf.fill < self.size {
            let n = remaining.len().min(self.size - buf.fill);
            let at = buf.fill;
            buf.data[at..at + n].copy_from_slice(&remaining[..n]);
            buf.fill += n;
            remaining = &remaining[n..];
        }

        for &byte in remaining {
            let at = buf.next;
            buf.data[at] ^= byte;
            buf.next = (buf.next + 1) % self.size;
        }

        if buf.fill > before_fill {
            drop(buf);
            self.sink_cond.notify_all();
        }
    }

    /// Block until at least `min(out.len(), capacity)` bytes are filled,
    /// then return up to `out.len()` bytes from the newest end of the
    /// pool (stack-like: reading reduces `fill` so producers resume).
    pub fn read(&self, out: &mut [u8]) -> usize {
        let target = out.len().min(self.size);
        let mut buf = self.buf.lock();
        while buf.fill < target {
            self.sink_cond.wait(&mut buf);
        }

        let n = buf.fill.min(out.len());
        let start = buf.fill - n;
        out[..n].copy_from_slice(&buf.data[start..start + n]);
        buf.fill -= n;
        drop(buf);
        self.source_cond.notify_all();
        n
    }

    /// Acquisition-worker idle-sleep point: wait up to `timeout` for a
    /// consumer to drain the pool. Returns without waiting if there is
    /// nothing to wait on (lock is always free between calls).
    pub fn wait_for_drain(&self, timeout: Duration) {
        let mut buf = self.buf.lock();
        self.source_cond.wait_for(&mut buf, timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn read_from_empty_pool_returns_exactly_what_was_added() {
        let pool = Arc::new(Pool::new(64));
        let reader = {
            let pool = pool.clone();
            thread::spawn(move || {
                let mut out = [0xFFu8; 64];
                let n = pool.read(&mut out);
                (n, out)
            })
        };

        // give the reader a moment to block before producing.
        thread::sleep(Duration::from_millis(20));
        pool.add_entropy(&[0u8; 64]);

        let (n, out) = reader.join().unwrap();
        assert_eq!(n, 64);
        assert_eq!(out, [0u8; 64]);
    }

    #[test]
    fn excess_entropy_xor_mixes_and_wraps() {
        let pool = Pool::new(4);
        pool.add_entropy(&[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(pool.fill(), 4);

        pool.add_entropy(&[0xFF, 0xFF, 0x00, 0x00, 0x0A, 0x0B]);
        let buf = pool.buf.lock();
        // 6 bytes XOR-mix into positions 0,1,2,3,0,1 (wrapping).
        assert_eq!(buf.data, vec![0x11 ^ 0xFF ^ 0x0A, 0x22 ^ 0xFF ^ 0x0B, 0x33, 0x44]);
        assert_eq!(buf.next, 2);
    }

    #[test]
    fn contiguous_read_never_exceeds_capacity() {
        let pool = Pool::new(16);
        pool.add_entropy(&[1u8; 16]);
        let mut out = [0u8; 64];
        let n = pool.read(&mut out);
        assert!(n <= 16);
    }
}
