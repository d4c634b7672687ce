//! Error types for connection accounting

use crate::common::Network;
use std::io;
use thiserror::Error;

/// Statistic error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("connections limit exceeded: {limit} active {network} connections")]
    ConnectionLimit { network: Network, limit: u64 },

    #[error("Identifier generation failed: {0}")]
    IdGeneration(String),

    #[error("Persistence unavailable: {0}")]
    Persistence(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Error::Parse(msg.into())
    }

    pub fn persistence<S: Into<String>>(msg: S) -> Self {
        Error::Persistence(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Whether the caller may retry after other connections close
    pub fn is_connection_limit(&self) -> bool {
        matches!(self, Error::ConnectionLimit { .. })
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

impl From<getrandom::Error> for Error {
    fn from(e: getrandom::Error) -> Self {
        Error::IdGeneration(e.to_string())
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;
