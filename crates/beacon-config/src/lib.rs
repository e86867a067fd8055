//! Configuration for beacon.
//!
//! This crate handles:
//! - System configuration (beacon.kdl)
//! - Duration strings (`10s`, `1m0s`)
//! - `((var))` credential interpolation in resource sources

pub mod duration;
pub mod error;
pub mod system;
pub mod variables;

pub use duration::parse_duration;
pub use error::{ConfigError, ConfigResult};
pub use system::{SystemConfig, parse_system_config};
pub use variables::{evaluate_source, evaluate_resource_types};
