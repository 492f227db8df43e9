//! EEPROM transaction engine
//!
//! Translates logical byte-range operations into correctly chunked and
//! correctly timed adapter transactions: page-aligned chunking, write-cycle
//! waits with bounded ACK polling, per-chunk retries, and an optional
//! verify pass.

use std::time::Duration;

use crate::adapter::{AdapterFeatures, I2cAdapter};
use crate::addr::BusAddress;
use crate::chip::ChipDescriptor;
use crate::error::{Error, Result};
use crate::wait;

/// Tuning knobs for the engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Per-chunk retries for transient errors (`NoAck`, `BusTimeout`,
    /// `WriteCycleTimeout`). A chunk is retried from its start; chunk writes
    /// fully overwrite their page, so the retry is idempotent.
    pub max_retries: u32,
    /// Interval between ACK polls while waiting out a write cycle.
    pub poll_interval: Duration,
    /// ACK-poll deadline as a multiple of the chip's write-cycle time.
    pub poll_timeout_mult: u32,
    /// Floor for the ACK-poll deadline, for chips with very short (or zero)
    /// write-cycle times.
    pub min_poll_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            poll_interval: Duration::from_millis(1),
            poll_timeout_mult: 8,
            min_poll_timeout: Duration::from_millis(25),
        }
    }
}

/// A page-aligned slice of a logical write or verify operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Absolute chip offset of the chunk
    pub offset: u32,
    /// Chunk length in bytes
    pub len: u32,
}

/// Partition `[offset, offset + len)` into page-aligned chunks.
///
/// The first chunk ends at the next page boundary (so it may be shorter
/// than a page); subsequent chunks are exactly `page_size` except a
/// possibly-shorter final chunk. Pure function of its inputs: the same
/// `(offset, len, page_size)` always yields the same partition, which keeps
/// write, verify and resume logic in agreement about chunk boundaries.
pub fn plan_chunks(offset: u32, len: u32, page_size: u32) -> Vec<Chunk> {
    assert!(page_size > 0, "page_size must be positive");

    let mut chunks = Vec::new();
    let mut pos = offset;
    let end = offset + len;
    while pos < end {
        let page_end = (pos / page_size + 1) * page_size;
        let chunk_end = page_end.min(end);
        chunks.push(Chunk {
            offset: pos,
            len: chunk_end - pos,
        });
        pos = chunk_end;
    }
    chunks
}

/// Progress and cancellation hooks for long-running engine operations.
///
/// Called only at chunk boundaries; a cancellation request therefore lets
/// the in-flight chunk finish and prevents the next one from starting.
pub trait WriteObserver {
    /// A write pass is starting for `total_bytes`.
    fn writing(&mut self, _total_bytes: usize) {}

    /// A chunk finished; `bytes_done` is the running total.
    fn chunk_done(&mut self, _chunk: Chunk, _bytes_done: u32) {}

    /// A verify pass is starting for `total_bytes`.
    fn verifying(&mut self, _total_bytes: usize) {}

    /// Cooperative cancellation check, polled before each chunk.
    fn cancel_requested(&mut self) -> bool {
        false
    }
}

/// A no-op observer.
pub struct NoObserver;

impl WriteObserver for NoObserver {}

/// Result of a completed (or cancelled) write/verify operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// Bytes fully processed, always a whole number of chunks when
    /// `cancelled` is set
    pub bytes_done: u32,
    /// Chunks fully processed
    pub chunks_done: u32,
    /// Operation stopped at a chunk boundary on request
    pub cancelled: bool,
}

/// A failed write/verify operation, with enough context to resume.
///
/// `bytes_completed` counts the bytes of all fully completed chunks before
/// the failure; a follow-up write starting at `offset` picks up exactly
/// where this one stopped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed at offset 0x{offset:04X} after {bytes_completed} bytes: {source}")]
pub struct WriteFailure {
    /// The underlying error
    #[source]
    pub source: Error,
    /// Offset of the chunk (or verify position) that failed
    pub offset: u32,
    /// Bytes successfully completed before the failure
    pub bytes_completed: u32,
}

/// Transaction engine bound to one adapter, one chip and one device address.
///
/// The engine owns its adapter exclusively for its lifetime; recover it with
/// [`into_adapter`](Engine::into_adapter) when the session moves on.
pub struct Engine<A: I2cAdapter> {
    adapter: A,
    chip: ChipDescriptor,
    device: BusAddress,
    opts: EngineOptions,
    // Capability flags are static per session; queried once at bind time.
    features: AdapterFeatures,
}

impl<A: I2cAdapter> Engine<A> {
    /// Bind an adapter to a chip descriptor and device address.
    ///
    /// Fails with [`InvalidDescriptor`](Error::InvalidDescriptor) if the
    /// descriptor is out of range, or
    /// [`InvalidAddress`](Error::InvalidAddress) if a 10-bit address is
    /// bound to an adapter without 10-bit support.
    pub fn new(
        adapter: A,
        chip: ChipDescriptor,
        device: BusAddress,
        opts: EngineOptions,
    ) -> Result<Self> {
        chip.validate()?;
        let features = adapter.features();
        if device.is_ten_bit() && !features.contains(AdapterFeatures::TEN_BIT_ADDR) {
            return Err(Error::InvalidAddress {
                addr: device.raw(),
            });
        }
        Ok(Self {
            adapter,
            chip,
            device,
            opts,
            features,
        })
    }

    /// The bound chip descriptor.
    pub fn chip(&self) -> &ChipDescriptor {
        &self.chip
    }

    /// The bound device address.
    pub fn device(&self) -> BusAddress {
        self.device
    }

    /// Mutable access to the underlying adapter, for bus-level operations
    /// (scan, speed changes) between EEPROM transactions.
    pub fn adapter_mut(&mut self) -> &mut A {
        &mut self.adapter
    }

    /// Release the adapter, consuming the engine.
    pub fn into_adapter(self) -> A {
        self.adapter
    }

    fn check_range(&self, offset: u32, len: u32) -> Result<()> {
        let end = offset
            .checked_add(len)
            .ok_or(Error::OutOfRange {
                offset,
                len,
                size: self.chip.size_bytes,
            })?;
        if end > self.chip.size_bytes {
            return Err(Error::OutOfRange {
                offset,
                len,
                size: self.chip.size_bytes,
            });
        }
        Ok(())
    }

    /// Read `len` bytes starting at `offset`.
    ///
    /// Splits into multiple transactions only when the adapter's
    /// per-transaction read cap requires it; results are concatenated in
    /// address order and the exact requested count is returned.
    pub fn read(&mut self, offset: u32, len: u32) -> Result<Vec<u8>> {
        self.check_range(offset, len)?;
        let mut out = vec![0u8; len as usize];
        let max = self.adapter.max_read_len().max(1);
        let mut done = 0usize;
        while done < out.len() {
            let n = max.min(out.len() - done);
            self.adapter.read(
                self.device,
                offset + done as u32,
                self.chip.address_width,
                &mut out[done..done + n],
            )?;
            done += n;
        }
        Ok(out)
    }

    /// Read the entire chip.
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        self.read(0, self.chip.size_bytes)
    }

    /// Write `data` starting at `offset`, without progress reporting.
    pub fn write(
        &mut self,
        offset: u32,
        data: &[u8],
        verify: bool,
    ) -> core::result::Result<Outcome, WriteFailure> {
        self.write_with(offset, data, verify, &mut NoObserver)
    }

    /// Write `data` starting at `offset`.
    ///
    /// Chunks are applied in strictly ascending address order. After every
    /// low-level write the engine waits out the chip's write cycle and ACK
    /// polls until the device is ready again. Transient chunk failures are
    /// retried up to `max_retries` before the operation aborts; remaining
    /// chunks are never attempted after a failure.
    pub fn write_with<O: WriteObserver>(
        &mut self,
        offset: u32,
        data: &[u8],
        verify: bool,
        observer: &mut O,
    ) -> core::result::Result<Outcome, WriteFailure> {
        self.check_range(offset, data.len() as u32)
            .map_err(|source| WriteFailure {
                source,
                offset,
                bytes_completed: 0,
            })?;

        let chunks = plan_chunks(offset, data.len() as u32, self.chip.page_size);
        log::debug!(
            "write: {} bytes at 0x{:04X} on {} ({} chunks, page size {})",
            data.len(),
            offset,
            self.device,
            chunks.len(),
            self.chip.page_size
        );

        observer.writing(data.len());
        let mut outcome = Outcome {
            bytes_done: 0,
            chunks_done: 0,
            cancelled: false,
        };

        for chunk in &chunks {
            if observer.cancel_requested() {
                log::info!(
                    "write cancelled at chunk boundary 0x{:04X} ({} bytes done)",
                    chunk.offset,
                    outcome.bytes_done
                );
                outcome.cancelled = true;
                return Ok(outcome);
            }

            let start = (chunk.offset - offset) as usize;
            let chunk_data = &data[start..start + chunk.len as usize];
            self.write_chunk_retrying(*chunk, chunk_data)
                .map_err(|source| WriteFailure {
                    source,
                    offset: chunk.offset,
                    bytes_completed: outcome.bytes_done,
                })?;

            outcome.bytes_done += chunk.len;
            outcome.chunks_done += 1;
            observer.chunk_done(*chunk, outcome.bytes_done);
        }

        if verify {
            observer.verifying(data.len());
            self.compare_range(offset, data)
                .map_err(|source| WriteFailure {
                    offset: match source {
                        Error::VerifyMismatch { offset, .. } => offset,
                        _ => offset,
                    },
                    source,
                    bytes_completed: outcome.bytes_done,
                })?;
        }

        Ok(outcome)
    }

    /// Verify that the chip contents at `offset` equal `expected`, without
    /// progress reporting.
    pub fn verify(
        &mut self,
        offset: u32,
        expected: &[u8],
    ) -> core::result::Result<Outcome, WriteFailure> {
        self.verify_with(offset, expected, &mut NoObserver)
    }

    /// Verify a byte range as a chunked, cancellable sweep.
    ///
    /// Uses the same chunk partition as a write of the same range, so
    /// progress and resume offsets line up between the two. A mismatch
    /// fails immediately with the first differing offset; mismatches are
    /// never retried.
    pub fn verify_with<O: WriteObserver>(
        &mut self,
        offset: u32,
        expected: &[u8],
        observer: &mut O,
    ) -> core::result::Result<Outcome, WriteFailure> {
        self.check_range(offset, expected.len() as u32)
            .map_err(|source| WriteFailure {
                source,
                offset,
                bytes_completed: 0,
            })?;

        let chunks = plan_chunks(offset, expected.len() as u32, self.chip.page_size);
        observer.verifying(expected.len());
        let mut outcome = Outcome {
            bytes_done: 0,
            chunks_done: 0,
            cancelled: false,
        };

        for chunk in &chunks {
            if observer.cancel_requested() {
                outcome.cancelled = true;
                return Ok(outcome);
            }

            let start = (chunk.offset - offset) as usize;
            let want = &expected[start..start + chunk.len as usize];
            self.compare_chunk_retrying(*chunk, want)
                .map_err(|source| WriteFailure {
                    offset: match source {
                        Error::VerifyMismatch { offset, .. } => offset,
                        _ => chunk.offset,
                    },
                    source,
                    bytes_completed: outcome.bytes_done,
                })?;

            outcome.bytes_done += chunk.len;
            outcome.chunks_done += 1;
            observer.chunk_done(*chunk, outcome.bytes_done);
        }

        Ok(outcome)
    }

    /// Fill the entire chip with `fill`.
    pub fn erase_with<O: WriteObserver>(
        &mut self,
        fill: u8,
        observer: &mut O,
    ) -> core::result::Result<Outcome, WriteFailure> {
        let data = vec![fill; self.chip.size_bytes as usize];
        self.write_with(0, &data, false, observer)
    }

    // One chunk, with per-chunk retry on transient errors. Each retry
    // rewrites the chunk from its start; a chunk never spans a page
    // boundary, so the rewrite fully overwrites the same page.
    fn write_chunk_retrying(&mut self, chunk: Chunk, data: &[u8]) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.write_chunk(chunk, data) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.opts.max_retries => {
                    attempt += 1;
                    log::warn!(
                        "chunk at 0x{:04X} failed ({}), retry {}/{}",
                        chunk.offset,
                        e,
                        attempt,
                        self.opts.max_retries
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    // Reads are retried too: a NACK mid-sweep (e.g. a device still finishing
    // an unrelated write cycle) should not fail a verify job outright.
    fn compare_chunk_retrying(&mut self, chunk: Chunk, want: &[u8]) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.compare_range(chunk.offset, want) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.opts.max_retries => {
                    attempt += 1;
                    log::warn!(
                        "verify read at 0x{:04X} failed ({}), retry {}/{}",
                        chunk.offset,
                        e,
                        attempt,
                        self.opts.max_retries
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    // One chunk as adapter transactions. With page-write support the chunk
    // goes out in as few transactions as the adapter's write cap allows;
    // without it, one byte per transaction. Both paths use the same chunk
    // boundaries, and every low-level write is followed by a write-cycle
    // wait, since the device starts a cycle per write either way.
    fn write_chunk(&mut self, chunk: Chunk, data: &[u8]) -> Result<()> {
        let piece_len = if self.features.contains(AdapterFeatures::PAGE_WRITE) {
            self.adapter.max_write_len().max(1)
        } else {
            1
        };

        let mut pos = chunk.offset;
        for piece in data.chunks(piece_len) {
            self.adapter
                .write(self.device, pos, self.chip.address_width, piece)?;
            self.wait_write_cycle()?;
            pos += piece.len() as u32;
        }
        Ok(())
    }

    fn compare_range(&mut self, offset: u32, expected: &[u8]) -> Result<()> {
        let found = self.read(offset, expected.len() as u32)?;
        for (i, (&want, &got)) in expected.iter().zip(found.iter()).enumerate() {
            if want != got {
                return Err(Error::VerifyMismatch {
                    offset: offset + i as u32,
                    expected: want,
                    found: got,
                });
            }
        }
        Ok(())
    }

    // Wait out the chip's write cycle, then ACK poll until the device
    // acknowledges again. A NACK during the window means "still writing";
    // exceeding the poll deadline fails the chunk with WriteCycleTimeout.
    fn wait_write_cycle(&mut self) -> Result<()> {
        let cycle = Duration::from_millis(self.chip.write_cycle_ms as u64);
        if !cycle.is_zero() {
            std::thread::sleep(cycle);
        }

        let timeout = (cycle * self.opts.poll_timeout_mult).max(self.opts.min_poll_timeout);
        let adapter = &mut self.adapter;
        let device = self.device;
        let ready = wait::poll_until(self.opts.poll_interval, timeout, || adapter.probe(device))?;
        if ready {
            Ok(())
        } else {
            Err(Error::WriteCycleTimeout { addr: self.device })
        }
    }
}
