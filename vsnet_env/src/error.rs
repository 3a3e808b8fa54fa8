//! Error types for the vsnet environment abstraction.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The receive socket could not be bound (fatal at startup)
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Socket configuration or thread spawn failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The outgoing queue is at capacity; the datagram was not enqueued
    #[error("Outgoing queue full ({0} pending)")]
    QueueFull(usize),

    /// The payload does not fit in a single datagram
    #[error("Payload of {size} bytes exceeds datagram limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    /// The transport has been shut down
    #[error("Transport closed")]
    Closed,

    /// No endpoint is attached at the destination address (in-memory network)
    #[error("Endpoint unreachable: {0}")]
    Unreachable(SocketAddr),
}

impl EnvError {
    /// Creates a bind error for the given address.
    pub fn bind(addr: SocketAddr, source: std::io::Error) -> Self {
        Self::Bind { addr, source }
    }

    /// Returns true if the error is transient (the caller may simply drop the datagram).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::QueueFull(_) | Self::Unreachable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert!(EnvError::QueueFull(8).is_transient());
        assert!(EnvError::Unreachable(addr).is_transient());
        assert!(!EnvError::Closed.is_transient());
        assert!(!EnvError::PayloadTooLarge { size: 2000, limit: 1500 }.is_transient());
    }

    #[test]
    fn test_bind_error_message_names_address() {
        let addr: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let err = EnvError::bind(addr, std::io::Error::from(std::io::ErrorKind::AddrInUse));
        assert!(err.to_string().contains("10.0.0.1:5000"));
    }
}
