//! Command implementations
//!
//! Each command opens an adapter through the session registry, binds it to
//! a chip descriptor where needed, and drives the work either directly
//! (scan, read) or through the job queue (write, verify, erase), rendering
//! the queue's event stream as a progress bar.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::mpsc;

use indicatif::{ProgressBar, ProgressStyle};

use reeprom_core::adapter::I2cAdapter;
use reeprom_core::addr::BusAddress;
use reeprom_core::chip::{ChipDescriptor, ChipRegistry};
use reeprom_core::engine::{Engine, EngineOptions};
use reeprom_session::{open_adapter, JobEvent, JobEventKind, JobId, JobQueue};

use crate::cli::{AdapterArgs, TargetArgs};

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Create a standard progress bar style
fn create_progress_bar_style() -> Result<ProgressStyle, Box<dyn std::error::Error>> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}")?
        .progress_chars("#>-"))
}

fn open(adapter: &AdapterArgs) -> Result<Box<dyn I2cAdapter + Send>, Box<dyn std::error::Error>> {
    let mut handle = open_adapter(&adapter.adapter)?;
    if let Some(khz) = adapter.speed {
        handle.set_speed(khz)?;
        log::info!("bus speed set to {} kHz", khz);
    }
    log::info!("opened {}", handle.info().description);
    Ok(handle)
}

fn resolve_target(
    registry: &ChipRegistry,
    target: &TargetArgs,
) -> Result<(ChipDescriptor, BusAddress), Box<dyn std::error::Error>> {
    let chip = registry.get(&target.chip)?.clone();
    let device = BusAddress::new(target.address)?;
    Ok((chip, device))
}

fn read_file(path: &Path) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let mut file = File::open(path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    println!("Read {} bytes from {:?}", data.len(), path);
    Ok(data)
}

pub fn run_scan(adapter: &AdapterArgs) -> CliResult {
    let mut handle = open(adapter)?;
    let found = handle.scan()?;

    if found.is_empty() {
        println!("No devices found");
        return Ok(());
    }
    println!("Found {} device(s):", found.len());
    for addr in found {
        println!("  {}", addr);
    }
    Ok(())
}

pub fn run_chips(registry: &ChipRegistry) -> CliResult {
    println!(
        "{:<10} {:<22} {:>8} {:>6} {:>6} {:>9}",
        "ID", "NAME", "SIZE", "PAGE", "ADDR", "CYCLE(ms)"
    );
    for chip in registry.list() {
        println!(
            "{:<10} {:<22} {:>8} {:>6} {:>6} {:>9}",
            chip.id,
            chip.name,
            chip.size_bytes,
            chip.page_size,
            chip.address_width.bytes(),
            chip.write_cycle_ms
        );
    }
    Ok(())
}

pub fn run_read(
    registry: &ChipRegistry,
    adapter: &AdapterArgs,
    target: &TargetArgs,
    offset: u32,
    length: Option<u32>,
    output: &Path,
) -> CliResult {
    let (chip, device) = resolve_target(registry, target)?;
    let handle = open(adapter)?;
    let length = length.unwrap_or_else(|| chip.size_bytes.saturating_sub(offset));
    let mut engine = Engine::new(handle, chip, device, EngineOptions::default())?;

    let pb = ProgressBar::new(length as u64);
    pb.set_style(create_progress_bar_style()?);
    pb.set_message("reading");

    // Read in blocks so the bar moves on large chips.
    let mut data = Vec::with_capacity(length as usize);
    let mut pos = offset;
    let end = offset + length;
    while pos < end {
        let block = 4096.min(end - pos);
        data.extend_from_slice(&engine.read(pos, block)?);
        pos += block;
        pb.set_position((pos - offset) as u64);
    }
    pb.finish_with_message("done");

    let mut file = File::create(output)?;
    file.write_all(&data)?;
    println!("Wrote {} bytes to {:?}", data.len(), output);
    Ok(())
}

pub fn run_write(
    registry: &ChipRegistry,
    adapter: &AdapterArgs,
    target: &TargetArgs,
    offset: u32,
    input: &Path,
    verify: bool,
) -> CliResult {
    let (chip, device) = resolve_target(registry, target)?;
    let data = read_file(input)?;
    let handle = open(adapter)?;

    let total = data.len() as u64;
    let (queue, events) = JobQueue::new(handle, EngineOptions::default());
    let id = queue.enqueue_write(&chip, device, offset, data, verify)?;
    let label = if verify { "writing+verifying" } else { "writing" };
    let result = drive_job(&events, id, total, label);
    queue.shutdown();
    result
}

pub fn run_verify(
    registry: &ChipRegistry,
    adapter: &AdapterArgs,
    target: &TargetArgs,
    offset: u32,
    input: &Path,
) -> CliResult {
    let (chip, device) = resolve_target(registry, target)?;
    let expected = read_file(input)?;
    let handle = open(adapter)?;

    let total = expected.len() as u64;
    let (queue, events) = JobQueue::new(handle, EngineOptions::default());
    let id = queue.enqueue_verify(&chip, device, offset, expected)?;
    let result = drive_job(&events, id, total, "verifying");
    queue.shutdown();
    result
}

pub fn run_erase(
    registry: &ChipRegistry,
    adapter: &AdapterArgs,
    target: &TargetArgs,
    fill: u8,
) -> CliResult {
    let (chip, device) = resolve_target(registry, target)?;
    let handle = open(adapter)?;
    let data = vec![fill; chip.size_bytes as usize];

    let total = data.len() as u64;
    let (queue, events) = JobQueue::new(handle, EngineOptions::default());
    let id = queue.enqueue_write(&chip, device, 0, data, true)?;
    let result = drive_job(&events, id, total, "erasing");
    queue.shutdown();
    result
}

// Render one job's event stream as a progress bar, returning its outcome.
fn drive_job(events: &mpsc::Receiver<JobEvent>, id: JobId, total: u64, label: &str) -> CliResult {
    let mut pb: Option<ProgressBar> = None;
    let mut bytes_done = 0u64;

    for JobEvent { job, kind } in events.iter() {
        if job != id {
            continue;
        }
        match kind {
            JobEventKind::Started => {
                let bar = ProgressBar::new(total);
                bar.set_style(create_progress_bar_style()?);
                bar.set_message(label.to_string());
                pb = Some(bar);
            }
            JobEventKind::ChunkCompleted { len, .. } => {
                bytes_done += len as u64;
                if let Some(bar) = &pb {
                    bar.set_position(bytes_done);
                }
            }
            JobEventKind::Completed { bytes_done } => {
                if let Some(bar) = &pb {
                    bar.set_position(bytes_done as u64);
                    bar.finish_with_message("done");
                }
                println!("{id}: completed, {bytes_done} bytes");
                return Ok(());
            }
            JobEventKind::Failed {
                error,
                offset,
                bytes_completed,
            } => {
                if let Some(bar) = &pb {
                    bar.abandon_with_message("failed");
                }
                println!(
                    "{id}: failed at 0x{offset:04X} after {bytes_completed} bytes \
                     (resume with --offset 0x{offset:04X})"
                );
                return Err(Box::new(error));
            }
            JobEventKind::Cancelled { bytes_completed } => {
                if let Some(bar) = &pb {
                    bar.abandon_with_message("cancelled");
                }
                println!("{id}: cancelled after {bytes_completed} bytes");
                return Ok(());
            }
        }
    }

    Err("event stream closed before the job finished".into())
}
