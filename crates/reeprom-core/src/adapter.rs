//! Adapter trait definitions
//!
//! Every USB-to-I2C bridge (real or simulated) is driven through the
//! [`I2cAdapter`] trait. A value implementing the trait represents an
//! *opened* adapter: opening is implementation-specific (each bridge has its
//! own `open` constructor that fails with
//! [`DeviceUnavailable`](crate::Error::DeviceUnavailable) on absence or
//! contention), and exclusive ownership of the underlying device is
//! expressed through ordinary move semantics.

use bitflags::bitflags;

use crate::addr::{BusAddress, SCAN_FIRST, SCAN_LAST};
use crate::chip::AddressWidth;
use crate::error::Result;

bitflags! {
    /// Capability flags reported by an adapter.
    ///
    /// Queried once per session; flags never change while a handle is open.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AdapterFeatures: u32 {
        /// Adapter can push a full EEPROM page in one write transaction.
        /// Without it the engine falls back to byte-wise writes.
        const PAGE_WRITE   = 1 << 0;
        /// Adapter can address 10-bit devices.
        const TEN_BIT_ADDR = 1 << 1;
    }
}

impl Default for AdapterFeatures {
    fn default() -> Self {
        AdapterFeatures::empty()
    }
}

/// Information about an adapter implementation.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    /// Canonical adapter name (e.g. "sim", "ch341", "ch347")
    pub name: &'static str,
    /// Human-readable description, including current settings
    pub description: String,
}

/// An opened USB-to-I2C bridge adapter.
///
/// All operations talk to physical state with no rollback; at most one
/// transaction is in flight per adapter (the bus is a serial medium with no
/// concurrent arbitration). The trait deliberately stays at the transaction
/// level: chunking, paging and write-cycle timing belong to the
/// [`Engine`](crate::engine::Engine), not to adapter implementations.
pub trait I2cAdapter {
    /// Get information about this adapter.
    fn info(&self) -> AdapterInfo;

    /// Get the capability flags of this adapter.
    fn features(&self) -> AdapterFeatures;

    /// Maximum bytes readable in a single transaction.
    fn max_read_len(&self) -> usize;

    /// Maximum bytes writable in a single transaction.
    fn max_write_len(&self) -> usize;

    /// Probe an address with a zero-length write.
    ///
    /// `Ok(true)` means the device acknowledged, `Ok(false)` means NACK
    /// (absent, or an EEPROM still inside its write cycle). Errors are
    /// reserved for adapter-level failures such as a bus timeout.
    fn probe(&mut self, addr: BusAddress) -> Result<bool>;

    /// Perform one addressed read transaction, filling `buf` completely.
    fn read(
        &mut self,
        addr: BusAddress,
        mem_addr: u32,
        width: AddressWidth,
        buf: &mut [u8],
    ) -> Result<()>;

    /// Perform one addressed write transaction.
    ///
    /// No chunking happens here: `data` must fit the device's page and the
    /// adapter's [`max_write_len`](Self::max_write_len).
    fn write(
        &mut self,
        addr: BusAddress,
        mem_addr: u32,
        width: AddressWidth,
        data: &[u8],
    ) -> Result<()>;

    /// Set the bus speed. Takes effect on the next transaction.
    fn set_speed(&mut self, khz: u32) -> Result<()>;

    /// Release the underlying device. Idempotent; also invoked on drop by
    /// implementations.
    fn close(&mut self);

    /// Scan the bus for responding devices.
    ///
    /// Probes the full valid 7-bit address space (`0x03..=0x77`) and returns
    /// the addresses that acknowledged, in ascending order.
    fn scan(&mut self) -> Result<Vec<BusAddress>> {
        let mut found = Vec::new();
        for raw in SCAN_FIRST..=SCAN_LAST {
            // Range is validated by construction of the loop bounds.
            let addr = BusAddress::new(raw)?;
            if self.probe(addr)? {
                found.push(addr);
            }
        }
        Ok(found)
    }
}

// Forwarding impls so the engine can be generic over owned adapters, mutable
// borrows, and boxed trait objects alike.

impl<A: I2cAdapter + ?Sized> I2cAdapter for &mut A {
    fn info(&self) -> AdapterInfo {
        (**self).info()
    }

    fn features(&self) -> AdapterFeatures {
        (**self).features()
    }

    fn max_read_len(&self) -> usize {
        (**self).max_read_len()
    }

    fn max_write_len(&self) -> usize {
        (**self).max_write_len()
    }

    fn probe(&mut self, addr: BusAddress) -> Result<bool> {
        (**self).probe(addr)
    }

    fn read(
        &mut self,
        addr: BusAddress,
        mem_addr: u32,
        width: AddressWidth,
        buf: &mut [u8],
    ) -> Result<()> {
        (**self).read(addr, mem_addr, width, buf)
    }

    fn write(
        &mut self,
        addr: BusAddress,
        mem_addr: u32,
        width: AddressWidth,
        data: &[u8],
    ) -> Result<()> {
        (**self).write(addr, mem_addr, width, data)
    }

    fn set_speed(&mut self, khz: u32) -> Result<()> {
        (**self).set_speed(khz)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn scan(&mut self) -> Result<Vec<BusAddress>> {
        (**self).scan()
    }
}

impl I2cAdapter for Box<dyn I2cAdapter + Send> {
    fn info(&self) -> AdapterInfo {
        (**self).info()
    }

    fn features(&self) -> AdapterFeatures {
        (**self).features()
    }

    fn max_read_len(&self) -> usize {
        (**self).max_read_len()
    }

    fn max_write_len(&self) -> usize {
        (**self).max_write_len()
    }

    fn probe(&mut self, addr: BusAddress) -> Result<bool> {
        (**self).probe(addr)
    }

    fn read(
        &mut self,
        addr: BusAddress,
        mem_addr: u32,
        width: AddressWidth,
        buf: &mut [u8],
    ) -> Result<()> {
        (**self).read(addr, mem_addr, width, buf)
    }

    fn write(
        &mut self,
        addr: BusAddress,
        mem_addr: u32,
        width: AddressWidth,
        data: &[u8],
    ) -> Result<()> {
        (**self).write(addr, mem_addr, width, data)
    }

    fn set_speed(&mut self, khz: u32) -> Result<()> {
        (**self).set_speed(khz)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn scan(&mut self) -> Result<Vec<BusAddress>> {
        (**self).scan()
    }
}
