use std::{io, net::SocketAddr, time::Duration};

use thiserror::Error;

/// A write or read request that can never be served.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("request carries no keys")]
    Empty,
    #[error("{keys} keys but {values} values")]
    LengthMismatch { keys: usize, values: usize },
    #[error("key '{0}' appears more than once")]
    DuplicateKey(String),
}

/// Checks that a write pairs every key with exactly one value and names each
/// key once.
pub fn validate_write(keys: &[String], values: &[String]) -> Result<(), RequestError> {
    if keys.is_empty() {
        return Err(RequestError::Empty);
    }
    if keys.len() != values.len() {
        return Err(RequestError::LengthMismatch {
            keys: keys.len(),
            values: values.len(),
        });
    }
    for (i, key) in keys.iter().enumerate() {
        if keys[..i].contains(key) {
            return Err(RequestError::DuplicateKey(key.clone()));
        }
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] RequestError),
    #[error("no reply from {host} within {after:?}")]
    Timeout { host: SocketAddr, after: Duration },
    #[error("client has no hosts to talk to")]
    NoHosts,
    #[error("no submitted write is waiting for a result")]
    NoOutstandingWrite,
    #[error("unexpected reply while waiting for {0}")]
    UnexpectedReply(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("malformed reply: {0}")]
    Codec(#[from] serde_json::Error),
}
