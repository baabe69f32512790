//! JSON request/response bindings for the control socket.

/// The tagged value tree used for stats payloads.
pub mod value;

/// Control-socket request bindings.
pub mod request;

/// Control-socket response bindings.
pub mod response;

/// Control-socket error bindings.
pub mod error;

pub use error::{ErrorKind, ProtocolError};
pub use request::{Command, Request};
pub use response::Response;
pub use value::Value;
