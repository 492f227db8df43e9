//! reeprom-sim - In-memory I2C bus and EEPROM simulator
//!
//! Provides a simulated USB-to-I2C bridge with one or more EEPROM devices
//! behind it, for exercising the transaction engine and job queue without
//! hardware. The simulator reproduces the two behaviors that matter for
//! timing and paging logic:
//!
//! - **Page wrap**: a write that would cross a page boundary wraps to the
//!   start of the same page instead of spilling into the next one, exactly
//!   as real 24Cxx parts do.
//! - **Write cycle**: after every write the device goes busy for its
//!   configured write-cycle time; while busy it NACKs probes, reads and
//!   writes, so ACK-poll logic can be exercised deterministically.
//!
//! The simulator never fails spontaneously, but specific failures (NACK,
//! bus timeout) can be injected on the Nth read or write for fault testing.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reeprom_core::adapter::{AdapterFeatures, AdapterInfo, I2cAdapter};
use reeprom_core::addr::BusAddress;
use reeprom_core::chip::{AddressWidth, ChipDescriptor};
use reeprom_core::{Error, Result};

/// Configuration for one simulated EEPROM device.
#[derive(Debug, Clone)]
pub struct SimDeviceConfig {
    /// 7-bit bus address
    pub addr: u8,
    /// Capacity in bytes
    pub size: u32,
    /// Page size in bytes
    pub page_size: u32,
    /// Busy window after each write
    pub write_cycle: Duration,
    /// Prefill memory with an address-derived pattern instead of 0xFF
    pub prefill: bool,
}

impl SimDeviceConfig {
    /// A device with no write-cycle delay and 0xFF-filled memory.
    pub fn new(addr: u8, size: u32, page_size: u32) -> Self {
        Self {
            addr,
            size,
            page_size,
            write_cycle: Duration::ZERO,
            prefill: false,
        }
    }

    /// A device matching a chip descriptor, including its write-cycle time.
    pub fn from_chip(addr: u8, chip: &ChipDescriptor) -> Self {
        Self {
            addr,
            size: chip.size_bytes,
            page_size: chip.page_size,
            write_cycle: Duration::from_millis(chip.write_cycle_ms as u64),
            prefill: false,
        }
    }
}

/// Which operation a fault fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOp {
    /// Fire on a read transaction
    Read,
    /// Fire on a write transaction
    Write,
}

/// What error an injected fault produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Device NACKs the transaction
    Nack,
    /// Adapter reports a bus timeout
    Timeout,
}

/// A fault injected on the Nth transaction of a kind.
///
/// Counters are 1-based and count attempts, so retries advance them; a
/// fault fires at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    /// Operation kind the counter applies to
    pub op: FaultOp,
    /// 1-based attempt number this fault fires on
    pub nth: u32,
    /// Error to produce
    pub kind: FaultKind,
}

/// Simulator configuration.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Devices present on the simulated bus
    pub devices: Vec<SimDeviceConfig>,
    /// Accepted bus speeds in kHz
    pub speeds: Vec<u32>,
    /// Injected faults
    pub faults: Vec<Fault>,
    /// Per-transaction read cap reported to the engine
    pub max_read_len: usize,
    /// Per-transaction write cap reported to the engine
    pub max_write_len: usize,
    /// Whether the adapter reports page-write support
    pub page_write: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        let mut c256 = SimDeviceConfig::new(0x50, 32768, 64);
        c256.write_cycle = Duration::from_millis(5);
        c256.prefill = true;
        let mut c08 = SimDeviceConfig::new(0x53, 1024, 16);
        c08.write_cycle = Duration::from_millis(5);
        c08.prefill = true;
        Self {
            devices: vec![c256, c08],
            speeds: vec![100, 400, 1000],
            faults: Vec::new(),
            max_read_len: 4096,
            max_write_len: 256,
            page_write: true,
        }
    }
}

#[derive(Debug)]
struct SimDevice {
    mem: Vec<u8>,
    page_size: u32,
    write_cycle: Duration,
    busy_until: Instant,
}

impl SimDevice {
    fn ready(&self) -> bool {
        Instant::now() >= self.busy_until
    }
}

#[derive(Debug)]
struct SimState {
    devices: BTreeMap<u16, SimDevice>,
    faults: Vec<Fault>,
    speed_khz: u32,
    reads: u32,
    writes: u32,
}

impl SimState {
    // Returns the injected error for this attempt, if a fault matches.
    fn check_fault(&mut self, op: FaultOp, addr: BusAddress) -> Result<()> {
        let count = match op {
            FaultOp::Read => {
                self.reads += 1;
                self.reads
            }
            FaultOp::Write => {
                self.writes += 1;
                self.writes
            }
        };
        if let Some(i) = self
            .faults
            .iter()
            .position(|f| f.op == op && f.nth == count)
        {
            let fault = self.faults.remove(i);
            log::debug!("sim: injecting {:?} on {:?} #{}", fault.kind, op, count);
            return Err(match fault.kind {
                FaultKind::Nack => Error::NoAck { addr },
                FaultKind::Timeout => Error::BusTimeout,
            });
        }
        Ok(())
    }
}

/// A simulated bus that can hand out at most one open adapter at a time.
///
/// The bus keeps the device state alive independently of the adapter, so
/// tests can inspect device memory after an adapter (or the queue owning
/// it) is gone, and can reopen after a close.
#[derive(Clone)]
pub struct SimBus {
    state: Arc<Mutex<SimState>>,
    open: Arc<AtomicBool>,
    speeds: Vec<u32>,
    max_read_len: usize,
    max_write_len: usize,
    page_write: bool,
}

impl SimBus {
    /// Build a simulated bus from a configuration.
    pub fn new(config: SimConfig) -> Self {
        let now = Instant::now();
        let mut devices = BTreeMap::new();
        for dev in &config.devices {
            let mut mem = vec![0xFF; dev.size as usize];
            if dev.prefill {
                for (i, byte) in mem.iter_mut().enumerate() {
                    *byte = (i as u16 + dev.addr as u16) as u8;
                }
            }
            devices.insert(
                dev.addr as u16,
                SimDevice {
                    mem,
                    page_size: dev.page_size.max(1),
                    write_cycle: dev.write_cycle,
                    busy_until: now,
                },
            );
        }
        Self {
            state: Arc::new(Mutex::new(SimState {
                devices,
                faults: config.faults,
                speed_khz: 100,
                reads: 0,
                writes: 0,
            })),
            open: Arc::new(AtomicBool::new(false)),
            speeds: config.speeds,
            max_read_len: config.max_read_len.max(1),
            max_write_len: config.max_write_len.max(1),
            page_write: config.page_write,
        }
    }

    /// Open the bus, acquiring exclusive ownership.
    ///
    /// Fails with [`DeviceUnavailable`](Error::DeviceUnavailable) if an
    /// adapter is already open; contention fails rather than queues.
    pub fn open(&self) -> Result<SimAdapter> {
        if self.open.swap(true, Ordering::AcqRel) {
            return Err(Error::DeviceUnavailable(
                "simulated adapter already open".into(),
            ));
        }
        Ok(SimAdapter {
            state: Arc::clone(&self.state),
            open: Arc::clone(&self.open),
            closed: false,
            speeds: self.speeds.clone(),
            max_read_len: self.max_read_len,
            max_write_len: self.max_write_len,
            page_write: self.page_write,
        })
    }

    /// Snapshot the memory of the device at `addr`, if present.
    pub fn device_memory(&self, addr: u8) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state.devices.get(&(addr as u16)).map(|d| d.mem.clone())
    }

    /// Overwrite one byte of device memory, bypassing the bus. For tests
    /// that need to fabricate a verify mismatch.
    pub fn poke(&self, addr: u8, offset: u32, value: u8) {
        let mut state = self.state.lock().unwrap();
        if let Some(dev) = state.devices.get_mut(&(addr as u16)) {
            dev.mem[offset as usize] = value;
        }
    }
}

/// An open handle to a [`SimBus`].
#[derive(Debug)]
pub struct SimAdapter {
    state: Arc<Mutex<SimState>>,
    open: Arc<AtomicBool>,
    closed: bool,
    speeds: Vec<u32>,
    max_read_len: usize,
    max_write_len: usize,
    page_write: bool,
}

impl SimAdapter {
    /// Open a standalone simulated adapter with its own bus.
    pub fn open(config: SimConfig) -> Result<Self> {
        SimBus::new(config).open()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::DeviceUnavailable("adapter is closed".into()))
        } else {
            Ok(())
        }
    }
}

impl I2cAdapter for SimAdapter {
    fn info(&self) -> AdapterInfo {
        let state = self.state.lock().unwrap();
        AdapterInfo {
            name: "sim",
            description: format!(
                "Simulated adapter ({} kHz, {} device(s))",
                state.speed_khz,
                state.devices.len()
            ),
        }
    }

    fn features(&self) -> AdapterFeatures {
        if self.page_write {
            AdapterFeatures::PAGE_WRITE
        } else {
            AdapterFeatures::empty()
        }
    }

    fn max_read_len(&self) -> usize {
        self.max_read_len
    }

    fn max_write_len(&self) -> usize {
        self.max_write_len
    }

    fn probe(&mut self, addr: BusAddress) -> Result<bool> {
        self.ensure_open()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .devices
            .get(&addr.raw())
            .map(|d| d.ready())
            .unwrap_or(false))
    }

    fn read(
        &mut self,
        addr: BusAddress,
        mem_addr: u32,
        _width: AddressWidth,
        buf: &mut [u8],
    ) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock().unwrap();
        state.check_fault(FaultOp::Read, addr)?;
        let dev = state
            .devices
            .get(&addr.raw())
            .ok_or(Error::NoAck { addr })?;
        if !dev.ready() {
            return Err(Error::NoAck { addr });
        }
        // Sequential reads roll over at the end of the array, as the
        // device's internal address counter does.
        let size = dev.mem.len();
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = dev.mem[(mem_addr as usize + i) % size];
        }
        Ok(())
    }

    fn write(
        &mut self,
        addr: BusAddress,
        mem_addr: u32,
        _width: AddressWidth,
        data: &[u8],
    ) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock().unwrap();
        state.check_fault(FaultOp::Write, addr)?;
        let dev = state
            .devices
            .get_mut(&addr.raw())
            .ok_or(Error::NoAck { addr })?;
        if !dev.ready() {
            return Err(Error::NoAck { addr });
        }
        if data.is_empty() {
            // Zero-length write: address phase only, same as a probe.
            return Ok(());
        }

        // Page wrap: bytes land within the page of the starting address;
        // crossing the boundary wraps to the page start. A trailing partial
        // page (capacity not a multiple of page size) wraps within its own
        // shorter span.
        let size = dev.mem.len() as u32;
        let start = mem_addr % size;
        let page_start = (start / dev.page_size) * dev.page_size;
        let span = dev.page_size.min(size - page_start);
        let first = start - page_start;
        for (i, &byte) in data.iter().enumerate() {
            let dst = page_start + (first + i as u32) % span;
            dev.mem[dst as usize] = byte;
        }

        dev.busy_until = Instant::now() + dev.write_cycle;
        Ok(())
    }

    fn set_speed(&mut self, khz: u32) -> Result<()> {
        self.ensure_open()?;
        if !self.speeds.contains(&khz) {
            return Err(Error::UnsupportedSpeed { khz });
        }
        self.state.lock().unwrap().speed_khz = khz;
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.open.store(false, Ordering::Release);
        }
    }
}

impl Drop for SimAdapter {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reeprom_core::engine::{Chunk, Engine, EngineOptions, WriteObserver};

    fn test_chip(size: u32, page: u32) -> ChipDescriptor {
        ChipDescriptor {
            id: "sim-test".into(),
            name: "sim test chip".into(),
            size_bytes: size,
            address_width: AddressWidth::Two,
            page_size: page,
            write_cycle_ms: 0,
            notes: String::new(),
        }
    }

    fn single_device_config(size: u32, page: u32) -> SimConfig {
        SimConfig {
            devices: vec![SimDeviceConfig::new(0x50, size, page)],
            faults: Vec::new(),
            ..SimConfig::default()
        }
    }

    fn engine_for(
        config: SimConfig,
        chip: ChipDescriptor,
        opts: EngineOptions,
    ) -> (SimBus, Engine<SimAdapter>) {
        let bus = SimBus::new(config);
        let adapter = bus.open().unwrap();
        let device = BusAddress::new(0x50).unwrap();
        let engine = Engine::new(adapter, chip, device, opts).unwrap();
        (bus, engine)
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn scan_returns_known_addresses_ascending() {
        let mut adapter = SimAdapter::open(SimConfig::default()).unwrap();
        let found = adapter.scan().unwrap();
        let raw: Vec<u16> = found.iter().map(|a| a.raw()).collect();
        assert_eq!(raw, vec![0x50, 0x53]);
    }

    #[test]
    fn open_contention_fails() {
        let bus = SimBus::new(SimConfig::default());
        let first = bus.open().unwrap();
        assert!(matches!(
            bus.open().unwrap_err(),
            Error::DeviceUnavailable(_)
        ));
        drop(first);
        // Released on drop; a new open succeeds.
        assert!(bus.open().is_ok());
    }

    #[test]
    fn close_is_idempotent_and_invalidates_handle() {
        let bus = SimBus::new(SimConfig::default());
        let mut adapter = bus.open().unwrap();
        adapter.close();
        adapter.close();
        let addr = BusAddress::new(0x50).unwrap();
        assert!(matches!(
            adapter.probe(addr).unwrap_err(),
            Error::DeviceUnavailable(_)
        ));
        assert!(bus.open().is_ok());
    }

    #[test]
    fn unsupported_speed_rejected() {
        let mut adapter = SimAdapter::open(SimConfig::default()).unwrap();
        assert_eq!(
            adapter.set_speed(200).unwrap_err(),
            Error::UnsupportedSpeed { khz: 200 }
        );
        adapter.set_speed(400).unwrap();
    }

    #[test]
    fn round_trip_page_aligned() {
        let (_bus, mut engine) =
            engine_for(single_device_config(1024, 16), test_chip(1024, 16), EngineOptions::default());
        let data = pattern(64, 1);
        engine.write(0, &data, false).unwrap();
        assert_eq!(engine.read(0, 64).unwrap(), data);
    }

    #[test]
    fn round_trip_unaligned_multi_page() {
        let (_bus, mut engine) =
            engine_for(single_device_config(1024, 16), test_chip(1024, 16), EngineOptions::default());
        let data = pattern(100, 7);
        engine.write(13, &data, true).unwrap();
        assert_eq!(engine.read(13, 100).unwrap(), data);
    }

    #[test]
    fn round_trip_without_page_write_support() {
        let mut config = single_device_config(256, 8);
        config.page_write = false;
        let (_bus, mut engine) =
            engine_for(config, test_chip(256, 8), EngineOptions::default());
        let data = pattern(30, 3);
        engine.write(5, &data, true).unwrap();
        assert_eq!(engine.read(5, 30).unwrap(), data);
    }

    #[test]
    fn raw_write_wraps_within_page() {
        // page_size + 1 bytes starting mid-page: the overflow lands at the
        // start of the same page, not in the next page.
        let bus = SimBus::new(single_device_config(256, 16));
        let mut adapter = bus.open().unwrap();
        let addr = BusAddress::new(0x50).unwrap();
        let data: Vec<u8> = (1..=17).collect();
        adapter
            .write(addr, 8, AddressWidth::One, &data)
            .unwrap();

        let mem = bus.device_memory(0x50).unwrap();
        // Bytes 2..=8 still sit at offsets 9..16.
        assert_eq!(&mem[9..16], &data[1..8]);
        // Bytes 9..=16 wrapped to the start of the same page.
        assert_eq!(&mem[0..8], &data[8..16]);
        // The 17th byte came around again and overwrote the first.
        assert_eq!(mem[8], 17);
        // Next page untouched.
        assert!(mem[16..32].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn engine_write_never_crosses_pages() {
        // The engine's chunking must make the wrap above unobservable.
        let (_bus, mut engine) =
            engine_for(single_device_config(256, 16), test_chip(256, 16), EngineOptions::default());
        let data = pattern(17, 9);
        engine.write(8, &data, true).unwrap();
        assert_eq!(engine.read(8, 17).unwrap(), data);
    }

    #[test]
    fn busy_device_nacks_until_cycle_elapses() {
        let mut config = single_device_config(256, 16);
        config.devices[0].write_cycle = Duration::from_millis(20);
        let bus = SimBus::new(config);
        let mut adapter = bus.open().unwrap();
        let addr = BusAddress::new(0x50).unwrap();

        adapter.write(addr, 0, AddressWidth::One, &[0xAA]).unwrap();
        assert!(!adapter.probe(addr).unwrap());
        assert!(matches!(
            adapter.read(addr, 0, AddressWidth::One, &mut [0u8; 1]),
            Err(Error::NoAck { .. })
        ));
        std::thread::sleep(Duration::from_millis(25));
        assert!(adapter.probe(addr).unwrap());
    }

    #[test]
    fn engine_ack_polls_through_write_cycle() {
        // Descriptor claims no write-cycle sleep, but the device holds busy
        // for 5ms; the ACK poll has to carry the write through.
        let mut config = single_device_config(256, 16);
        config.devices[0].write_cycle = Duration::from_millis(5);
        let (_bus, mut engine) =
            engine_for(config, test_chip(256, 16), EngineOptions::default());
        let data = pattern(40, 11);
        engine.write(0, &data, true).unwrap();
    }

    #[test]
    fn transient_fault_is_retried() {
        let mut config = single_device_config(256, 16);
        config.faults = vec![Fault {
            op: FaultOp::Write,
            nth: 1,
            kind: FaultKind::Nack,
        }];
        let (_bus, mut engine) =
            engine_for(config, test_chip(256, 16), EngineOptions::default());
        let data = pattern(32, 5);
        let outcome = engine.write(0, &data, true).unwrap();
        assert_eq!(outcome.bytes_done, 32);
        assert_eq!(engine.read(0, 32).unwrap(), data);
    }

    #[test]
    fn retry_exhaustion_reports_resume_offset() {
        // 5 chunks of 16; the 3rd chunk NACKs through all 4 attempts
        // (1 try + 3 retries).
        let mut config = single_device_config(256, 16);
        config.faults = (0..4)
            .map(|i| Fault {
                op: FaultOp::Write,
                nth: 3 + i,
                kind: FaultKind::Nack,
            })
            .collect();
        let (_bus, mut engine) =
            engine_for(config, test_chip(256, 16), EngineOptions::default());
        let data = pattern(80, 13);

        let failure = engine.write(0, &data, false).unwrap_err();
        assert!(matches!(failure.source, Error::NoAck { .. }));
        assert_eq!(failure.bytes_completed, 32);
        assert_eq!(failure.offset, 32);

        // Resume from the reported offset and finish the job.
        let resumed = offset_resume(&mut engine, &data, failure.bytes_completed);
        assert_eq!(resumed.bytes_done, 48);
        assert_eq!(engine.read(0, 80).unwrap(), data);
    }

    fn offset_resume(
        engine: &mut Engine<SimAdapter>,
        data: &[u8],
        from: u32,
    ) -> reeprom_core::engine::Outcome {
        engine
            .write(from, &data[from as usize..], true)
            .unwrap()
    }

    #[test]
    fn verify_mismatch_reports_first_offset() {
        let (bus, mut engine) =
            engine_for(single_device_config(256, 16), test_chip(256, 16), EngineOptions::default());
        let data = pattern(48, 17);
        engine.write(0, &data, false).unwrap();
        bus.poke(0x50, 20, !data[20]);

        let failure = engine.verify(0, &data).unwrap_err();
        match failure.source {
            Error::VerifyMismatch { offset, .. } => assert_eq!(offset, 20),
            other => panic!("expected VerifyMismatch, got {other}"),
        }
        assert_eq!(failure.offset, 20);
        // The first chunk (offset 0..16) verified clean.
        assert_eq!(failure.bytes_completed, 16);
    }

    #[test]
    fn out_of_range_write_rejected_before_any_transaction() {
        let (bus, mut engine) =
            engine_for(single_device_config(256, 16), test_chip(256, 16), EngineOptions::default());
        let failure = engine.write(250, &[0u8; 16], false).unwrap_err();
        assert!(matches!(failure.source, Error::OutOfRange { .. }));
        assert_eq!(failure.bytes_completed, 0);
        // Nothing touched device memory.
        assert!(bus.device_memory(0x50).unwrap().iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn read_split_by_adapter_cap() {
        let mut config = single_device_config(1024, 16);
        config.max_read_len = 10;
        let (_bus, mut engine) =
            engine_for(config, test_chip(1024, 16), EngineOptions::default());
        let data = pattern(100, 23);
        engine.write(0, &data, false).unwrap();
        assert_eq!(engine.read(0, 100).unwrap(), data);
    }

    struct CancelAfter {
        chunks: u32,
        seen: u32,
    }

    impl WriteObserver for CancelAfter {
        fn chunk_done(&mut self, _chunk: Chunk, _bytes_done: u32) {
            self.seen += 1;
        }

        fn cancel_requested(&mut self) -> bool {
            self.seen >= self.chunks
        }
    }

    #[test]
    fn cancellation_stops_at_chunk_boundary() {
        let (bus, mut engine) =
            engine_for(single_device_config(256, 16), test_chip(256, 16), EngineOptions::default());
        let data = pattern(80, 29);
        let mut observer = CancelAfter { chunks: 2, seen: 0 };
        let outcome = engine.write_with(0, &data, false, &mut observer).unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.chunks_done, 2);
        assert_eq!(outcome.bytes_done, 32);

        let mem = bus.device_memory(0x50).unwrap();
        assert_eq!(&mem[..32], &data[..32]);
        // The third chunk never started.
        assert!(mem[32..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn erase_fills_whole_chip() {
        let (bus, mut engine) =
            engine_for(single_device_config(256, 16), test_chip(256, 16), EngineOptions::default());
        engine.write(0, &pattern(256, 31), false).unwrap();
        engine
            .erase_with(0x00, &mut reeprom_core::engine::NoObserver)
            .unwrap();
        assert!(bus.device_memory(0x50).unwrap().iter().all(|&b| b == 0x00));
    }
}
