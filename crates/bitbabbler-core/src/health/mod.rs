//! Continuous statistical quality assurance: FIPS 140-2, NIST-style ENT
//! analysis at two sample widths, and a bit-run chi-square test, composed
//! by [`HealthMonitor`].

pub mod bitruns;
pub mod ent;
pub mod fips;
mod monitor;

pub use monitor::HealthMonitor;
