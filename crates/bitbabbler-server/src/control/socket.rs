//! Unix-domain control-socket listener: one thread accepting, one thread
//! per connection reading a 1024-byte buffer of null-terminated JSON
//! requests and writing null-terminated JSON responses.
//!
//! Before binding, takes an exclusive `flock` on `<path>.lock` and, if
//! that succeeds, removes a pre-existing socket inode at `path` only when
//! it is a socket we own with the expected mode — never an arbitrary file
//! a misconfigured path might point at.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use bitbabbler_rpc::{Request, Response};
use thiserror::Error;

use crate::logging::VerbosityHandle;
use crate::registry::SourceRegistry;

const REQUEST_BUFFER_LIMIT: usize = 1024;
const SOCKET_MODE: u32 = 0o600;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("another instance holds the lock on {0:?}")]
    AlreadyRunning(PathBuf),
    #[error("{0:?} exists and is not a socket we own; refusing to remove it")]
    NotOurSocket(PathBuf),
    #[error("binding control socket at {0:?}: {1}")]
    Bind(PathBuf, #[source] std::io::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Held for the lifetime of the listener; dropping it releases the flock.
struct LockGuard {
    _file: File,
}

fn acquire_lock(socket_path: &Path) -> Result<LockGuard, SocketError> {
    let lock_path = lock_path_for(socket_path);
    let file = OpenOptions::new().create(true).write(true).open(&lock_path)?;
    flock_exclusive_nonblocking(&file).map_err(|_| SocketError::AlreadyRunning(lock_path))?;
    Ok(LockGuard { _file: file })
}

fn lock_path_for(socket_path: &Path) -> PathBuf {
    let mut s = socket_path.as_os_str().to_owned();
    s.push(".lock");
    PathBuf::from(s)
}

#[cfg(unix)]
fn flock_exclusive_nonblocking(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Remove a pre-existing socket inode at `path`, but only if it is a
/// socket, owned by the calling process's uid, and has the expected mode.
/// Any other inode type or ownership is left alone and reported as an error.
fn remove_stale_socket(path: &Path) -> Result<(), SocketError> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let is_socket = meta.file_type().is_socket();
    let owned_by_us = meta.uid() == current_uid();
    let expected_mode = meta.permissions().mode() & 0o777 == SOCKET_MODE;

    if !(is_socket && owned_by_us && expected_mode) {
        return Err(SocketError::NotOurSocket(path.to_owned()));
    }

    std::fs::remove_file(path)?;
    Ok(())
}

fn current_uid() -> u32 {
    unsafe { libc::getuid() }
}

/// Bind the listener, accept connections until `shutdown` is set, and
/// spawn one thread per connection. Blocks the calling thread.
pub fn serve(
    socket_path: &Path,
    registry: Arc<SourceRegistry>,
    verbosity: VerbosityHandle,
    shutdown: Arc<AtomicBool>,
) -> Result<(), SocketError> {
    let _lock = acquire_lock(socket_path)?;
    remove_stale_socket(socket_path)?;

    let listener = UnixListener::bind(socket_path).map_err(|e| SocketError::Bind(socket_path.to_owned(), e))?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
    listener.set_nonblocking(true)?;

    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                let registry = registry.clone();
                let verbosity = verbosity.clone();
                thread::spawn(move || serve_connection(stream, &registry, &verbosity));
            }
            Err(e) if e.kind() == IoErrorKind::WouldBlock => {
                thread::sleep(std::time::Duration::from_millis(50));
            }
            Err(e) => {
                tracing::warn!(error = %e, "control socket accept failed");
            }
        }
    }

    let _ = std::fs::remove_file(socket_path);
    Ok(())
}

/// Read null-terminated requests from one connection and write responses,
/// in order, until the peer closes the connection or a framing error
/// forces it shut.
fn serve_connection(mut stream: UnixStream, registry: &SourceRegistry, verbosity: &VerbosityHandle) {
    let mut buf = Vec::with_capacity(REQUEST_BUFFER_LIMIT);
    let mut chunk = [0u8; 256];

    loop {
        let Some(raw) = read_one_request(&mut stream, &mut buf, &mut chunk) else { break };
        let response = match raw {
            Ok(text) => match Request::parse(&text) {
                Ok(req) => crate::control::handle_request(&req, registry, verbosity),
                Err(e) => Response::bad_request(&e.message, &e.request),
            },
            Err(overflow_text) => Response::bad_request("request exceeds 1024-byte buffer", &overflow_text),
        };
        if stream.write_all(&response.encode()).is_err() {
            break;
        }
    }
}

/// Pulls the next NUL-terminated request out of `buf`, refilling from
/// `stream` as needed. Returns `None` on clean EOF with no partial data,
/// `Some(Err(_))` if the buffer fills past the limit without a
/// terminator.
fn read_one_request(stream: &mut UnixStream, buf: &mut Vec<u8>, chunk: &mut [u8]) -> Option<Result<String, String>> {
    loop {
        if let Some(pos) = buf.iter().position(|&b| b == 0) {
            let text = String::from_utf8_lossy(&buf[..pos]).into_owned();
            buf.drain(..=pos);
            return Some(Ok(text));
        }

        if buf.len() >= REQUEST_BUFFER_LIMIT {
            let text = String::from_utf8_lossy(buf).into_owned();
            buf.clear();
            return Some(Err(text));
        }

        match stream.read(chunk) {
            Ok(0) => return if buf.is_empty() { None } else { Some(Err(String::from_utf8_lossy(buf).into_owned())) },
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == IoErrorKind::Interrupted => continue,
            Err(_) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn stale_socket_removed_when_owned_and_correct_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let listener = UnixListener::bind(&path).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(SOCKET_MODE)).unwrap();
        drop(listener);

        assert!(std::fs::symlink_metadata(&path).unwrap().file_type().is_socket());
        remove_stale_socket(&path).unwrap();
        assert!(std::fs::symlink_metadata(&path).is_err());
    }

    #[test]
    fn non_socket_inode_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-socket");
        std::fs::write(&path, b"hello").unwrap();
        assert!(matches!(remove_stale_socket(&path), Err(SocketError::NotOurSocket(_))));
    }

    #[test]
    fn missing_path_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nothing-here.sock");
        assert!(remove_stale_socket(&path).is_ok());
    }

    #[test]
    fn request_over_buffer_limit_yields_bad_request_text() {
        let mut buf = Vec::new();
        let oversized = vec![b'x'; REQUEST_BUFFER_LIMIT + 10];
        let (mut a, mut b) = UnixStream::pair().unwrap();
        let writer = thread::spawn(move || {
            b.write_all(&oversized).unwrap();
        });
        thread::sleep(Duration::from_millis(10));
        let mut read_chunk = [0u8; 256];
        let result = read_one_request(&mut a, &mut buf, &mut read_chunk);
        writer.join().unwrap();
        assert!(matches!(result, Some(Err(_))));
    }
}
