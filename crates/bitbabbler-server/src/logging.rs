//! Tracing setup with a runtime-adjustable filter, so `SetLogVerbosity`
//! over the control socket can tighten or loosen logging without a
//! restart. Modelled on the teacher's `init_tracing`, substituting
//! `tracing_subscriber::reload` for its internal logging crate.

use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;

/// A handle `SetLogVerbosity` uses to swap the active filter in place.
#[derive(Clone)]
pub struct VerbosityHandle {
    handle: reload::Handle<EnvFilter, tracing_subscriber::Registry>,
}

impl VerbosityHandle {
    /// BitBabbler verbosity levels run negative-to-positive like the
    /// reference daemon's `-q`/`-v` flags: negative quiets below `warn`,
    /// 0 is `info`, positive steps through `debug`/`trace`.
    pub fn set_level(&self, level: i64) -> Result<(), reload::Error> {
        let filter = EnvFilter::new(level_filter(level).to_string());
        self.handle.reload(filter)
    }
}

fn level_filter(level: i64) -> LevelFilter {
    match level {
        i64::MIN..=-2 => LevelFilter::ERROR,
        -1 => LevelFilter::WARN,
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Initialize the global subscriber and return the handle future
/// `SetLogVerbosity` calls reload through.
pub fn init(initial_level: i64) -> VerbosityHandle {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_filter(initial_level).to_string()));
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();

    VerbosityHandle { handle }
}

#[cfg(test)]
impl VerbosityHandle {
    /// A handle backed by a reload layer that was never installed as the
    /// global subscriber, for tests that only care about `set_level`.
    pub fn for_test() -> Self {
        let (_, handle) = reload::Layer::new(EnvFilter::new("info"));
        VerbosityHandle { handle }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_filter_maps_verbosity_range() {
        assert_eq!(level_filter(0), LevelFilter::INFO);
        assert_eq!(level_filter(-1), LevelFilter::WARN);
        assert_eq!(level_filter(-5), LevelFilter::ERROR);
        assert_eq!(level_filter(1), LevelFilter::DEBUG);
        assert_eq!(level_filter(9), LevelFilter::TRACE);
    }
}
