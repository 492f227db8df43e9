//! Bus address types

use core::fmt;

use crate::error::{Error, Result};

/// Lowest address probed during a bus scan.
///
/// Addresses 0x00-0x02 are reserved (general call, CBUS, future use) and
/// are never probed.
pub const SCAN_FIRST: u8 = 0x03;

/// Highest address probed during a bus scan (0x78-0x7F are reserved).
pub const SCAN_LAST: u8 = 0x77;

/// A validated device address on the I2C bus.
///
/// Addresses are validated at construction time: the 7-bit constructor
/// rejects values outside `0x03..=0x77`, the 10-bit constructor rejects
/// values above `0x3FF`. Whether a 10-bit address may actually be used is
/// decided when an address is bound to an adapter, since only adapters that
/// report [`TEN_BIT_ADDR`](crate::adapter::AdapterFeatures::TEN_BIT_ADDR)
/// can issue 10-bit transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BusAddress {
    raw: u16,
    ten_bit: bool,
}

impl BusAddress {
    /// Create a 7-bit bus address.
    pub fn new(raw: u8) -> Result<Self> {
        if !(SCAN_FIRST..=SCAN_LAST).contains(&raw) {
            return Err(Error::InvalidAddress { addr: raw as u16 });
        }
        Ok(Self {
            raw: raw as u16,
            ten_bit: false,
        })
    }

    /// Create a 10-bit bus address.
    pub fn ten_bit(raw: u16) -> Result<Self> {
        if raw > 0x3FF {
            return Err(Error::InvalidAddress { addr: raw });
        }
        Ok(Self { raw, ten_bit: true })
    }

    /// The raw address value.
    pub fn raw(self) -> u16 {
        self.raw
    }

    /// Whether this is a 10-bit address.
    pub fn is_ten_bit(self) -> bool {
        self.ten_bit
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ten_bit {
            write!(f, "0x{:03X}", self.raw)
        } else {
            write!(f, "0x{:02X}", self.raw)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seven_bit_range_enforced() {
        assert!(BusAddress::new(0x02).is_err());
        assert!(BusAddress::new(0x03).is_ok());
        assert!(BusAddress::new(0x50).is_ok());
        assert!(BusAddress::new(0x77).is_ok());
        assert!(BusAddress::new(0x78).is_err());
    }

    #[test]
    fn ten_bit_range_enforced() {
        assert!(BusAddress::ten_bit(0x3FF).is_ok());
        assert!(BusAddress::ten_bit(0x400).is_err());
    }

    #[test]
    fn display_format() {
        assert_eq!(BusAddress::new(0x50).unwrap().to_string(), "0x50");
        assert_eq!(BusAddress::ten_bit(0x150).unwrap().to_string(), "0x150");
    }
}
