//! Unified error type for blesc.
//!
//! We avoid `alloc` - all error variants carry only fixed-size data.
//! Implements `defmt::Format` (with the `defmt` feature) for efficient
//! on-target logging.

/// Top-level error type used across the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    // BLE
    /// The radio rejected or failed a request.
    Transport(TransportError),

    /// The peer sent something the protocol does not allow
    /// (bad command byte, wrong signature, stray fragment).
    Protocol,

    // Resources
    /// Every allow/deny list slot holds a live entry.
    ListFull,

    // Storage
    /// Flash read/write/erase failed or the stored record is unusable.
    Storage(StorageError),

    /// The node has not been provisioned with an id and key.
    NotConfigured,

    // Crypto
    /// The HMAC provider refused the key or message.
    Crypto,

    /// The random number source produced no bytes.
    Entropy,
}

/// Radio-level failures. Always recovered by dropping the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// Raw error code from the SoftDevice.
    Raw(u32),
    /// A request is already in progress.
    Busy,
    /// The connection handle is not (or no longer) valid.
    InvalidHandle,
    /// Characteristic write failed.
    WriteFailed,
    /// Characteristic read failed.
    ReadFailed,
}

/// Persistent configuration failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StorageError {
    /// Flash driver error.
    Flash,
    /// Stored bytes do not decode into a config record.
    Corrupt,
    /// Serialization buffer too small.
    BufferTooSmall,
}

// Convenience conversions

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Transport(e)
    }
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Error::Storage(e)
    }
}
