//! Control socket: a Unix-domain listener accepting one thread per
//! connection, speaking the null-terminated JSON protocol defined in
//! `bitbabbler-rpc`.

pub mod handler;
pub mod socket;

pub use handler::handle_request;
pub use socket::{serve, SocketError};
