//! Error types for the sonar-probe crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Link error: {0}")]
    Link(#[from] sonar_link::LinkError),

    #[error("No devices found for {target}")]
    NoDevices { target: String },

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProbeError>;
