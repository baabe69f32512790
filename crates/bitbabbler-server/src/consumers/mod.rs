//! Entropy sinks that drain the mixed pool: the OS kernel entropy input,
//! a UDP request/reply source, a blocking file-descriptor writer, and a
//! raw-device "watch" drain. Each runs on its own thread and blocks only
//! on the pool's sink condition.

pub mod fd_writer;
pub mod kernel;
pub mod udp;
pub mod watch;

pub use fd_writer::FdWriter;
pub use kernel::{EntropySink, KernelFeeder};
pub use udp::UdpSource;
pub use watch::Watch;
