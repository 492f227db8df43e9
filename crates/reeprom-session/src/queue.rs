//! FIFO job queue with a dedicated bus worker
//!
//! The bus is a strictly serial resource: at most one transaction is in
//! flight across the whole system. The queue enforces this by owning the
//! adapter on a single worker thread and running jobs strictly in
//! submission order; callers never block on the bus, they poll
//! [`status`](JobQueue::status) or consume the event stream.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use reeprom_core::adapter::I2cAdapter;
use reeprom_core::addr::BusAddress;
use reeprom_core::chip::ChipDescriptor;
use reeprom_core::engine::{Chunk, Engine, EngineOptions, WriteObserver};
use reeprom_core::{Error, Result};

use crate::job::{JobEvent, JobEventKind, JobId, JobKind, JobSpec, JobState};

enum Command {
    Run(JobId, JobSpec),
    Shutdown,
}

struct Shared {
    states: Mutex<HashMap<JobId, JobState>>,
    cancelled: Mutex<HashSet<JobId>>,
    shutting_down: AtomicBool,
}

impl Shared {
    fn set_state(&self, id: JobId, state: JobState) {
        self.states.lock().unwrap().insert(id, state);
    }

    fn is_cancelled(&self, id: JobId) -> bool {
        self.cancelled.lock().unwrap().contains(&id)
    }
}

/// Sequences EEPROM operations over one adapter.
///
/// Jobs run in FIFO submission order with no reordering; a job does not
/// start until its predecessor reached a terminal state. Dropping the queue
/// shuts the worker down, cancelling still-pending jobs.
pub struct JobQueue {
    tx: mpsc::Sender<Command>,
    worker: Option<thread::JoinHandle<()>>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
}

impl JobQueue {
    /// Start a queue owning `adapter`. Returns the queue and the receiving
    /// end of its event stream — the sole notification surface.
    pub fn new(
        adapter: Box<dyn I2cAdapter + Send>,
        opts: EngineOptions,
    ) -> (Self, mpsc::Receiver<JobEvent>) {
        let (tx, rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            states: Mutex::new(HashMap::new()),
            cancelled: Mutex::new(HashSet::new()),
            shutting_down: AtomicBool::new(false),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("reeprom-bus".into())
            .spawn(move || worker_loop(rx, adapter, opts, worker_shared, event_tx))
            .expect("failed to spawn bus worker");

        (
            Self {
                tx,
                worker: Some(worker),
                shared,
                next_id: AtomicU64::new(1),
            },
            event_rx,
        )
    }

    /// Enqueue a write job, optionally with a verify pass.
    pub fn enqueue_write(
        &self,
        chip: &ChipDescriptor,
        device: BusAddress,
        offset: u32,
        data: Vec<u8>,
        verify: bool,
    ) -> Result<JobId> {
        self.enqueue(JobSpec {
            chip: chip.clone(),
            device,
            kind: JobKind::Write {
                offset,
                data,
                verify,
            },
        })
    }

    /// Enqueue a standalone verify sweep.
    pub fn enqueue_verify(
        &self,
        chip: &ChipDescriptor,
        device: BusAddress,
        offset: u32,
        expected: Vec<u8>,
    ) -> Result<JobId> {
        self.enqueue(JobSpec {
            chip: chip.clone(),
            device,
            kind: JobKind::Verify { offset, expected },
        })
    }

    /// Enqueue an arbitrary job spec.
    ///
    /// Fails fast, before the job exists: an out-of-range descriptor is
    /// rejected with [`InvalidDescriptor`](Error::InvalidDescriptor), a
    /// range beyond the chip with [`OutOfRange`](Error::OutOfRange).
    pub fn enqueue(&self, spec: JobSpec) -> Result<JobId> {
        spec.chip.validate()?;
        let (offset, len) = (spec.kind.offset(), spec.kind.len());
        if offset.checked_add(len).map_or(true, |end| end > spec.chip.size_bytes) {
            return Err(Error::OutOfRange {
                offset,
                len,
                size: spec.chip.size_bytes,
            });
        }

        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.shared.set_state(id, JobState::Pending);
        self.tx
            .send(Command::Run(id, spec))
            .map_err(|_| Error::DeviceUnavailable("job queue is shut down".into()))?;
        log::debug!("{id} enqueued");
        Ok(id)
    }

    /// Request cancellation of a job.
    ///
    /// A pending job is removed without executing. A running job finishes
    /// its in-flight chunk and stops before the next one; cancellation never
    /// interrupts a transaction already sent to the adapter.
    pub fn cancel(&self, id: JobId) {
        self.shared.cancelled.lock().unwrap().insert(id);
        log::debug!("{id} cancellation requested");
    }

    /// Current state of a job, if the id is known to this queue.
    pub fn status(&self, id: JobId) -> Option<JobState> {
        self.shared.states.lock().unwrap().get(&id).cloned()
    }

    /// Shut down: stop after the current job, cancel everything still
    /// pending, and release the adapter.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.shared.shutting_down.store(true, Ordering::Release);
            let _ = self.tx.send(Command::Shutdown);
            if worker.join().is_err() {
                log::error!("bus worker panicked");
            }
        }
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

// Observer bridging engine chunk boundaries to job state and events.
struct QueueObserver<'a> {
    id: JobId,
    shared: &'a Shared,
    events: &'a mpsc::Sender<JobEvent>,
}

impl WriteObserver for QueueObserver<'_> {
    fn chunk_done(&mut self, chunk: Chunk, bytes_done: u32) {
        self.shared
            .set_state(self.id, JobState::Running { bytes_done });
        emit(
            self.events,
            self.id,
            JobEventKind::ChunkCompleted {
                offset: chunk.offset,
                len: chunk.len,
            },
        );
    }

    fn cancel_requested(&mut self) -> bool {
        self.shared.is_cancelled(self.id)
    }
}

fn emit(events: &mpsc::Sender<JobEvent>, job: JobId, kind: JobEventKind) {
    // A dropped receiver only means nobody is listening.
    let _ = events.send(JobEvent { job, kind });
}

fn worker_loop(
    rx: mpsc::Receiver<Command>,
    mut adapter: Box<dyn I2cAdapter + Send>,
    opts: EngineOptions,
    shared: Arc<Shared>,
    events: mpsc::Sender<JobEvent>,
) {
    while let Ok(cmd) = rx.recv() {
        match cmd {
            // Jobs already queued when shutdown begins never run.
            Command::Run(id, _) if shared.shutting_down.load(Ordering::Acquire) => {
                shared.set_state(id, JobState::Cancelled { bytes_completed: 0 });
                emit(&events, id, JobEventKind::Cancelled { bytes_completed: 0 });
            }
            Command::Run(id, spec) => run_job(id, spec, &mut adapter, &opts, &shared, &events),
            Command::Shutdown => break,
        }
    }

    adapter.close();
}

fn run_job(
    id: JobId,
    spec: JobSpec,
    adapter: &mut Box<dyn I2cAdapter + Send>,
    opts: &EngineOptions,
    shared: &Shared,
    events: &mpsc::Sender<JobEvent>,
) {
    // Cancelled while pending: remove without execution.
    if shared.cancelled.lock().unwrap().remove(&id) {
        log::info!("{id} cancelled before start");
        shared.set_state(id, JobState::Cancelled { bytes_completed: 0 });
        emit(events, id, JobEventKind::Cancelled { bytes_completed: 0 });
        return;
    }

    shared.set_state(id, JobState::Running { bytes_done: 0 });
    emit(events, id, JobEventKind::Started);
    log::info!(
        "{id} started: {} bytes at 0x{:04X} on {} ({})",
        spec.kind.len(),
        spec.kind.offset(),
        spec.device,
        spec.chip.id
    );

    let mut engine = match Engine::new(&mut *adapter, spec.chip.clone(), spec.device, opts.clone())
    {
        Ok(engine) => engine,
        Err(error) => {
            fail(shared, events, id, error, spec.kind.offset(), 0);
            return;
        }
    };

    let mut observer = QueueObserver { id, shared, events };
    let result = match &spec.kind {
        JobKind::Write {
            offset,
            data,
            verify,
        } => engine.write_with(*offset, data, *verify, &mut observer),
        JobKind::Verify { offset, expected } => {
            engine.verify_with(*offset, expected, &mut observer)
        }
    };

    shared.cancelled.lock().unwrap().remove(&id);
    match result {
        Ok(outcome) if outcome.cancelled => {
            log::info!("{id} cancelled after {} bytes", outcome.bytes_done);
            shared.set_state(
                id,
                JobState::Cancelled {
                    bytes_completed: outcome.bytes_done,
                },
            );
            emit(
                events,
                id,
                JobEventKind::Cancelled {
                    bytes_completed: outcome.bytes_done,
                },
            );
        }
        Ok(outcome) => {
            log::info!("{id} completed ({} bytes)", outcome.bytes_done);
            shared.set_state(
                id,
                JobState::Completed {
                    bytes_done: outcome.bytes_done,
                },
            );
            emit(
                events,
                id,
                JobEventKind::Completed {
                    bytes_done: outcome.bytes_done,
                },
            );
        }
        Err(failure) => fail(
            shared,
            events,
            id,
            failure.source,
            failure.offset,
            failure.bytes_completed,
        ),
    }
}

fn fail(
    shared: &Shared,
    events: &mpsc::Sender<JobEvent>,
    id: JobId,
    error: Error,
    offset: u32,
    bytes_completed: u32,
) {
    log::warn!("{id} failed at 0x{offset:04X} after {bytes_completed} bytes: {error}");
    shared.set_state(
        id,
        JobState::Failed {
            error: error.clone(),
            offset,
            bytes_completed,
        },
    );
    emit(
        events,
        id,
        JobEventKind::Failed {
            error,
            offset,
            bytes_completed,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use reeprom_core::chip::AddressWidth;
    use reeprom_sim::{Fault, FaultKind, FaultOp, SimBus, SimConfig, SimDeviceConfig};
    use std::time::Duration;

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

    fn sim_bus(size: u32, page: u32, faults: Vec<Fault>) -> SimBus {
        SimBus::new(SimConfig {
            devices: vec![SimDeviceConfig::new(0x50, size, page)],
            faults,
            ..SimConfig::default()
        })
    }

    fn device() -> BusAddress {
        BusAddress::new(0x50).unwrap()
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed))
            .collect()
    }

    // Collect events until `id` reaches a terminal event.
    fn events_until_terminal(rx: &mpsc::Receiver<JobEvent>, id: JobId) -> Vec<JobEvent> {
        let mut seen = Vec::new();
        loop {
            let event = rx
                .recv_timeout(Duration::from_secs(10))
                .expect("event stream stalled");
            let done = event.job == id
                && matches!(
                    event.kind,
                    JobEventKind::Completed { .. }
                        | JobEventKind::Failed { .. }
                        | JobEventKind::Cancelled { .. }
                );
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    #[test]
    fn write_job_completes_and_reports_chunks() {
        let bus = sim_bus(256, 16, Vec::new());
        let (queue, rx) = JobQueue::new(Box::new(bus.open().unwrap()), EngineOptions::default());
        let chip = test_chip(256, 16);
        let data = pattern(48, 1);

        let id = queue
            .enqueue_write(&chip, device(), 0, data.clone(), true)
            .unwrap();
        let events = events_until_terminal(&rx, id);

        assert!(matches!(events[0].kind, JobEventKind::Started));
        let chunk_count = events
            .iter()
            .filter(|e| matches!(e.kind, JobEventKind::ChunkCompleted { .. }))
            .count();
        assert_eq!(chunk_count, 3);
        assert!(matches!(
            events.last().unwrap().kind,
            JobEventKind::Completed { bytes_done: 48 }
        ));
        assert_eq!(queue.status(id), Some(JobState::Completed { bytes_done: 48 }));

        queue.shutdown();
        assert_eq!(bus.device_memory(0x50).unwrap()[..48], data[..]);
    }

    #[test]
    fn jobs_run_in_fifo_order() {
        let bus = sim_bus(256, 16, Vec::new());
        let (queue, rx) = JobQueue::new(Box::new(bus.open().unwrap()), EngineOptions::default());
        let chip = test_chip(256, 16);

        let j1 = queue
            .enqueue_write(&chip, device(), 0, pattern(32, 1), false)
            .unwrap();
        let j2 = queue
            .enqueue_write(&chip, device(), 32, pattern(32, 2), false)
            .unwrap();
        let j3 = queue
            .enqueue_verify(&chip, device(), 0, pattern(32, 1))
            .unwrap();

        let events = events_until_terminal(&rx, j3);
        queue.shutdown();

        // Interleaving is forbidden: each job's full event run precedes the
        // next job's Started.
        let order: Vec<JobId> = events.iter().map(|e| e.job).collect();
        let mut expected = Vec::new();
        for id in [j1, j2, j3] {
            while expected.len() < order.len() && order[expected.len()] == id {
                expected.push(id);
            }
        }
        assert_eq!(order, expected);

        // And every job saw Started before its terminal event.
        for id in [j1, j2, j3] {
            let first = events.iter().position(|e| e.job == id).unwrap();
            assert!(matches!(events[first].kind, JobEventKind::Started));
        }
    }

    #[test]
    fn failed_job_reports_resume_point() {
        // 3rd chunk NACKs through all 4 attempts.
        let faults = (0..4)
            .map(|i| Fault {
                op: FaultOp::Write,
                nth: 3 + i,
                kind: FaultKind::Nack,
            })
            .collect();
        let bus = sim_bus(256, 16, faults);
        let (queue, rx) = JobQueue::new(Box::new(bus.open().unwrap()), EngineOptions::default());
        let chip = test_chip(256, 16);

        let id = queue
            .enqueue_write(&chip, device(), 0, pattern(80, 3), false)
            .unwrap();
        let events = events_until_terminal(&rx, id);

        match &events.last().unwrap().kind {
            JobEventKind::Failed {
                error,
                offset,
                bytes_completed,
            } => {
                assert!(matches!(error, Error::NoAck { .. }));
                assert_eq!(*offset, 32);
                assert_eq!(*bytes_completed, 32);
            }
            other => panic!("expected Failed, got {other:?}"),
        }

        // A new job resuming at the reported offset completes.
        let data = pattern(80, 3);
        let resume = queue
            .enqueue_write(&chip, device(), 32, data[32..].to_vec(), true)
            .unwrap();
        let events = events_until_terminal(&rx, resume);
        assert!(matches!(
            events.last().unwrap().kind,
            JobEventKind::Completed { bytes_done: 48 }
        ));
        queue.shutdown();
        assert_eq!(bus.device_memory(0x50).unwrap()[..80], data[..]);
    }

    #[test]
    fn cancelling_pending_job_skips_execution() {
        let bus = sim_bus(256, 16, Vec::new());
        let (queue, rx) = JobQueue::new(Box::new(bus.open().unwrap()), EngineOptions::default());
        let chip = test_chip(256, 16);

        // A long first job keeps the second pending long enough to cancel:
        // 16 chunks with a 5ms write cycle each.
        let mut slow = chip.clone();
        slow.write_cycle_ms = 5;
        let j1 = queue
            .enqueue_write(&slow, device(), 0, pattern(256, 1), false)
            .unwrap();
        let j2 = queue
            .enqueue_write(&chip, device(), 0, pattern(64, 2), false)
            .unwrap();
        queue.cancel(j2);

        let events = events_until_terminal(&rx, j2);
        let j1_bytes = queue_state_bytes(&queue, j1);
        queue.shutdown();

        assert!(matches!(
            events.last().unwrap().kind,
            JobEventKind::Cancelled { bytes_completed: 0 }
        ));
        // The cancelled job never emitted Started.
        assert!(!events
            .iter()
            .any(|e| e.job == j2 && matches!(e.kind, JobEventKind::Started)));
        assert_eq!(j1_bytes, Some(256), "first job unaffected");
    }

    fn queue_state_bytes(queue: &JobQueue, id: JobId) -> Option<u32> {
        match queue.status(id)? {
            JobState::Completed { bytes_done } => Some(bytes_done),
            _ => None,
        }
    }

    #[test]
    fn cancelling_running_job_stops_at_chunk_boundary() {
        let bus = sim_bus(256, 16, Vec::new());
        let (queue, rx) = JobQueue::new(Box::new(bus.open().unwrap()), EngineOptions::default());
        // Slow chip so the job is still running when the cancel lands.
        let mut chip = test_chip(256, 16);
        chip.write_cycle_ms = 5;

        let id = queue
            .enqueue_write(&chip, device(), 0, pattern(256, 9), false)
            .unwrap();

        // Cancel as soon as the first chunk is done.
        loop {
            let event = rx.recv_timeout(Duration::from_secs(10)).unwrap();
            if matches!(event.kind, JobEventKind::ChunkCompleted { .. }) {
                queue.cancel(id);
                break;
            }
        }

        let events = events_until_terminal(&rx, id);
        queue.shutdown();

        match events.last().unwrap().kind {
            JobEventKind::Cancelled { bytes_completed } => {
                assert!(bytes_completed > 0);
                assert!(bytes_completed < 256);
                // Always a whole number of chunks.
                assert_eq!(bytes_completed % 16, 0);
            }
            ref other => panic!("expected Cancelled, got {other:?}"),
        }
    }

    #[test]
    fn invalid_descriptor_rejected_at_enqueue() {
        let bus = sim_bus(256, 16, Vec::new());
        let (queue, _rx) = JobQueue::new(Box::new(bus.open().unwrap()), EngineOptions::default());
        let mut chip = test_chip(256, 16);
        chip.page_size = 0;

        let err = queue
            .enqueue_write(&chip, device(), 0, vec![0u8; 8], false)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDescriptor(_)));
        queue.shutdown();
    }

    #[test]
    fn out_of_range_rejected_at_enqueue() {
        let bus = sim_bus(256, 16, Vec::new());
        let (queue, _rx) = JobQueue::new(Box::new(bus.open().unwrap()), EngineOptions::default());
        let chip = test_chip(256, 16);

        let err = queue
            .enqueue_write(&chip, device(), 250, vec![0u8; 16], false)
            .unwrap_err();
        assert!(matches!(err, Error::OutOfRange { .. }));
        queue.shutdown();
    }

    #[test]
    fn verify_job_detects_mismatch() {
        let bus = sim_bus(256, 16, Vec::new());
        let (queue, rx) = JobQueue::new(Box::new(bus.open().unwrap()), EngineOptions::default());
        let chip = test_chip(256, 16);
        let data = pattern(64, 21);

        let write = queue
            .enqueue_write(&chip, device(), 0, data.clone(), false)
            .unwrap();
        events_until_terminal(&rx, write);

        bus.poke(0x50, 40, !data[40]);
        let verify = queue.enqueue_verify(&chip, device(), 0, data).unwrap();
        let events = events_until_terminal(&rx, verify);
        queue.shutdown();

        match &events.last().unwrap().kind {
            JobEventKind::Failed {
                error: Error::VerifyMismatch { offset, .. },
                offset: fail_offset,
                bytes_completed,
            } => {
                assert_eq!(*offset, 40);
                assert_eq!(*fail_offset, 40);
                assert_eq!(*bytes_completed, 32);
            }
            other => panic!("expected VerifyMismatch failure, got {other:?}"),
        }
    }

    #[test]
    fn shutdown_cancels_pending_jobs() {
        let bus = sim_bus(256, 16, Vec::new());
        let (queue, rx) = JobQueue::new(Box::new(bus.open().unwrap()), EngineOptions::default());
        let mut chip = test_chip(256, 16);
        chip.write_cycle_ms = 5;

        let _j1 = queue
            .enqueue_write(&chip, device(), 0, pattern(128, 1), false)
            .unwrap();
        let j2 = queue
            .enqueue_write(&chip, device(), 128, pattern(128, 2), false)
            .unwrap();
        queue.shutdown();

        let mut j2_terminal = None;
        for event in rx.try_iter() {
            if event.job == j2 {
                j2_terminal = Some(event.kind);
            }
        }
        assert!(matches!(
            j2_terminal,
            Some(JobEventKind::Cancelled { bytes_completed: 0 })
        ));
    }
}
