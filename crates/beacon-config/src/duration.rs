//! Duration strings such as `10s`, `1m0s` or `1h30m`.

use std::time::Duration;

use crate::{ConfigError, ConfigResult};

pub fn parse_duration(input: &str) -> ConfigResult<Duration> {
    humantime::parse_duration(input.trim()).map_err(|e| ConfigError::InvalidDuration {
        input: input.to_string(),
        message: e.to_string(),
    })
}

pub fn format_duration(duration: Duration) -> String {
    humantime::format_duration(duration).to_string()
}
