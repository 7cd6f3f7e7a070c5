//! Spooled directories: watched folders whose stable files become transfers

mod config;
mod monitor;
mod strategy;

pub use config::{SpoolMode, SpooledConfig};
pub use monitor::{SpoolStats, SpooledWatcher};
pub use strategy::{DirectStrategy, SpoolStrategy, SubmitStrategy};
