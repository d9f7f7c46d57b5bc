use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the scan and session engine.
///
/// Every failed operation maps to a specific kind so that a caller can
/// render an actionable message. Timeouts are reported, never retried
/// internally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Scan duration was zero or exceeded the controller's maximum.
    #[error("invalid scan duration {requested:?} (must be positive and at most {max:?})")]
    InvalidDuration { requested: Duration, max: Duration },

    /// A scan is already in progress on this controller.
    #[error("a scan is already in progress")]
    AlreadyScanning,

    /// The platform adapter could not start or continue scanning.
    #[error("bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// The peripheral did not accept the connection in time.
    #[error("timed out connecting to {address}")]
    ConnectionTimeout { address: String },

    /// The platform stack rejected the connection attempt.
    #[error("connection to {address} refused: {reason}")]
    ConnectionRefused { address: String, reason: String },

    /// GATT service enumeration failed after a successful connect.
    #[error("service discovery failed: {0}")]
    DiscoveryFailed(String),

    /// The session is not in the Ready state.
    #[error("session is not connected")]
    NotConnected,

    #[error("characteristic {handle:#06x} is not readable")]
    CharacteristicNotReadable { handle: u16 },

    #[error("characteristic {handle:#06x} is not writable")]
    CharacteristicNotWritable { handle: u16 },

    #[error("characteristic {handle:#06x} does not support notifications")]
    CharacteristicNotNotifiable { handle: u16 },

    /// A suspending operation did not resolve within its deadline.
    #[error("operation timed out after {0:?}")]
    OperationTimeout(Duration),

    /// The peripheral dropped the link without a disconnect request.
    #[error("peer {address} disconnected")]
    PeerDisconnected { address: String },

    /// Operator-supplied hex filter pattern could not be parsed.
    #[error("invalid hex filter pattern: {0}")]
    InvalidFilterPattern(String),
}
