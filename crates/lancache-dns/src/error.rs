//! DNS error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DnsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::error::ProtoError),

    #[error("Upstream resolver timed out")]
    UpstreamTimeout,
}
