//! Error types for reeprom-core

use crate::addr::BusAddress;

/// Core error type covering adapter, bus and engine failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Adapter could not be opened: absent, or already owned elsewhere.
    ///
    /// Open contention fails rather than queues; a caller must not proceed
    /// without a handle.
    #[error("adapter unavailable: {0}")]
    DeviceUnavailable(String),

    /// Addressed device did not acknowledge.
    #[error("no ACK from device at {addr}")]
    NoAck {
        /// Address that failed to acknowledge
        addr: BusAddress,
    },

    /// No response within the adapter's transaction timeout.
    #[error("bus timeout: no response from adapter")]
    BusTimeout,

    /// Device never acknowledged again after a write within the poll deadline.
    #[error("write cycle timeout: device at {addr} never became ready")]
    WriteCycleTimeout {
        /// Address of the device still busy
        addr: BusAddress,
    },

    /// Post-write readback differs from the written data. Never retried.
    #[error(
        "verify mismatch at offset 0x{offset:04X}: wrote 0x{expected:02X}, read 0x{found:02X}"
    )]
    VerifyMismatch {
        /// First mismatching offset
        offset: u32,
        /// Byte that was written
        expected: u8,
        /// Byte that was read back
        found: u8,
    },

    /// Requested range exceeds the chip capacity.
    #[error("range 0x{offset:04X}+{len} exceeds chip capacity of {size} bytes")]
    OutOfRange {
        /// Requested start offset
        offset: u32,
        /// Requested length
        len: u32,
        /// Chip capacity in bytes
        size: u32,
    },

    /// Requested bus speed is outside the adapter's supported range.
    #[error("bus speed {khz} kHz not supported by adapter")]
    UnsupportedSpeed {
        /// Requested speed in kHz
        khz: u32,
    },

    /// No descriptor registered under the given id.
    #[error("unknown chip id `{0}`")]
    UnknownChip(String),

    /// A chip descriptor field is out of range.
    #[error("invalid chip descriptor: {0}")]
    InvalidDescriptor(String),

    /// Bus address failed construction-time validation.
    #[error("invalid bus address 0x{addr:02X}")]
    InvalidAddress {
        /// The rejected raw address
        addr: u16,
    },
}

impl Error {
    /// Whether this error is transient and eligible for per-chunk retry.
    ///
    /// Transient errors are bus-level hiccups (`NoAck`, `BusTimeout`,
    /// `WriteCycleTimeout`); everything else surfaces immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::NoAck { .. } | Error::BusTimeout | Error::WriteCycleTimeout { .. }
        )
    }
}

/// Result type alias using the core error type.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let addr = BusAddress::new(0x50).unwrap();
        assert!(Error::NoAck { addr }.is_transient());
        assert!(Error::BusTimeout.is_transient());
        assert!(Error::WriteCycleTimeout { addr }.is_transient());
        assert!(!Error::VerifyMismatch {
            offset: 0,
            expected: 0,
            found: 1
        }
        .is_transient());
        assert!(!Error::UnknownChip("24c02".into()).is_transient());
    }
}
