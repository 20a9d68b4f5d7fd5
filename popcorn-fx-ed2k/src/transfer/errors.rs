use crate::transfer::{Md4Hash, PieceIndex, TransferHandle};
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// The result type for the transfer package.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors which can occur within the transfer package.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    #[error("peer {0} is blocked by the ip filter")]
    BlockedPeer(IpAddr),
    #[error("the connection is a connection to ourselves")]
    SelfConnection,
    #[error("the peer already has an active connection")]
    DuplicatePeerId,
    #[error("the peer registry has reached its limit of {0} peers")]
    TooManyConnections(usize),
    #[error("failed to allocate a new peer record")]
    RegistryAllocationFailed,
    #[error("piece {0} could not be written to the storage")]
    DiskFailure(PieceIndex),
    #[error("piece {0} failed the hash check")]
    HashFailure(PieceIndex),
    #[error("peer {0} has been banned by the ip filter")]
    BannedByIpFilter(IpAddr),
    #[error("the connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("failed to enqueue the connection attempt, {0}")]
    ConnectEnqueueFailed(String),
    #[error("failed to read the connection endpoint, {0}")]
    Endpoint(String),
    #[error("an io error occurred, {0}")]
    Io(String),
    #[error("the session is closing")]
    SessionClosing,
    #[error("transfer {0} already exists")]
    DuplicateTransfer(Md4Hash),
    #[error("transfer {0} is not accepting connections")]
    TransferPaused(TransferHandle),
    #[error("the transfer handle {0} is no longer valid or invalid")]
    InvalidHandle(TransferHandle),
    #[error("the session is invalid, {0}")]
    InvalidSession(String),
    #[error("the transfer is invalid, {0}")]
    InvalidTransfer(String),
    #[error("the provided hash is invalid, {0}")]
    InvalidHash(String),
    #[error("the ip range {0} - {1} is invalid")]
    InvalidRange(IpAddr, IpAddr),
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(error: hex::FromHexError) -> Self {
        Self::InvalidHash(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_from_io_error() {
        let error = io::Error::new(io::ErrorKind::BrokenPipe, "lorem ipsum");

        let result = Error::from(error);

        assert_eq!(Error::Io("lorem ipsum".to_string()), result);
    }

    #[test]
    fn test_from_hex_error() {
        let error = hex::FromHexError::OddLength;

        let result = Error::from(error);

        if let Error::InvalidHash(message) = result {
            assert_ne!("", message, "expected an error message");
        } else {
            assert!(false, "expected Error::InvalidHash, got {:?} instead", result);
        }
    }
}
