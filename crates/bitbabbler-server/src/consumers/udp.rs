//! UDP entropy source: accept connectionless requests of a single byte
//! count and reply with that many bytes drawn from the pool.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitbabbler_core::Pool;

const MAX_REQUEST_BYTES: usize = 4096;
const RECV_TIMEOUT: Duration = Duration::from_millis(500);

pub struct UdpSource {
    socket: UdpSocket,
    pool: Arc<Pool>,
    shutdown: Arc<AtomicBool>,
}

impl UdpSource {
    pub fn bind(addr: impl std::net::ToSocketAddrs, pool: Arc<Pool>, shutdown: Arc<AtomicBool>) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;
        Ok(Self { socket, pool, shutdown })
    }

    pub fn run(self) {
        let mut request = [0u8; 8];
        while !self.shutdown.load(Ordering::Relaxed) {
            let (len, peer) = match self.socket.recv_from(&mut request) {
                Ok(v) => v,
                Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "udp entropy source recv failed");
                    continue;
                }
            };

            let Some(n) = parse_request(&request[..len]) else {
                tracing::debug!(peer = %peer, "malformed udp entropy request");
                continue;
            };

            let mut out = vec![0u8; n];
            self.pool.read(&mut out);
            if let Err(e) = self.socket.send_to(&out, peer) {
                tracing::warn!(peer = %peer, error = %e, "udp entropy reply failed");
            }
        }
    }
}

/// The request body is a little-endian `u32` byte count, clamped to
/// [`MAX_REQUEST_BYTES`].
fn parse_request(body: &[u8]) -> Option<usize> {
    let bytes: [u8; 4] = body.get(..4)?.try_into().ok()?;
    let n = u32::from_le_bytes(bytes) as usize;
    if n == 0 {
        return None;
    }
    Some(n.min(MAX_REQUEST_BYTES))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_little_endian_count() {
        assert_eq!(parse_request(&16u32.to_le_bytes()), Some(16));
    }

    #[test]
    fn clamps_to_max_request_bytes() {
        assert_eq!(parse_request(&(MAX_REQUEST_BYTES as u32 * 2).to_le_bytes()), Some(MAX_REQUEST_BYTES));
    }

    #[test]
    fn rejects_short_body() {
        assert_eq!(parse_request(&[1, 2]), None);
    }

    #[test]
    fn rejects_zero_count() {
        assert_eq!(parse_request(&0u32.to_le_bytes()), None);
    }
}
