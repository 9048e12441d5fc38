use std::str::Utf8Error;

use packed_struct::PackingError;
use thiserror::Error;

/// When things go awry
#[derive(Debug, Error)]
pub enum KnaryError {
    #[error("failed to pack bytes: {0}")]
    BytePacking(String),
    #[error("invalid dns name: {0}")]
    InvalidName(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Something failed in the start up of the platform
    #[error("startup error: {0}")]
    Startup(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("zone file error: {0}")]
    ZoneFile(String),
    #[error("http client error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("acme error: {0}")]
    Acme(#[from] instant_acme::Error),
    #[error("certificate error: {0}")]
    Certificate(String),
    #[error("upstream dns error: {0}")]
    Upstream(String),
    /// Failed to send something across a tokio channel
    #[error("failed to send on channel: {0}")]
    Send(String),
    #[error("{0}")]
    Utf8(#[from] Utf8Error),
    #[error("address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    #[error("{0}")]
    Generic(String),
}

impl From<PackingError> for KnaryError {
    fn from(error: PackingError) -> Self {
        KnaryError::BytePacking(error.to_string())
    }
}

impl From<KnaryError> for std::io::Error {
    fn from(error: KnaryError) -> Self {
        match error {
            KnaryError::Io(err) => err,
            other => std::io::Error::other(other.to_string()),
        }
    }
}
