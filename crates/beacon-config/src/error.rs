//! Configuration errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("KDL parse error: {0}")]
    Parse(#[from] kdl::KdlError),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("invalid duration '{input}': {message}")]
    InvalidDuration { input: String, message: String },

    #[error("undefined vars: {}", .0.join(", "))]
    UndefinedVariables(Vec<String>),

    #[error("credential lookup failed: {0}")]
    Credentials(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

impl From<ConfigError> for beacon_core::Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::UndefinedVariables(_) | ConfigError::Credentials(_) => {
                beacon_core::Error::Credentials(err.to_string())
            }
            other => beacon_core::Error::Config(other.to_string()),
        }
    }
}
