//! Job types and the job event stream

use core::fmt;

use reeprom_core::addr::BusAddress;
use reeprom_core::chip::ChipDescriptor;
use reeprom_core::Error;

/// Identifier of a queued job, unique within one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub(crate) u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job #{}", self.0)
    }
}

/// What a job does once it runs.
#[derive(Debug, Clone)]
pub enum JobKind {
    /// Program a byte range, optionally verifying afterwards.
    Write {
        /// Chip offset to write at
        offset: u32,
        /// Payload
        data: Vec<u8>,
        /// Re-read and compare after writing
        verify: bool,
    },
    /// Compare a byte range against expected contents.
    Verify {
        /// Chip offset to verify at
        offset: u32,
        /// Expected contents
        expected: Vec<u8>,
    },
}

impl JobKind {
    pub(crate) fn offset(&self) -> u32 {
        match self {
            JobKind::Write { offset, .. } | JobKind::Verify { offset, .. } => *offset,
        }
    }

    pub(crate) fn len(&self) -> u32 {
        match self {
            JobKind::Write { data, .. } => data.len() as u32,
            JobKind::Verify { expected, .. } => expected.len() as u32,
        }
    }
}

/// A queued unit of work: one operation against one chip behind one device
/// address.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Descriptor of the chip being programmed
    pub chip: ChipDescriptor,
    /// Bus address of the device
    pub device: BusAddress,
    /// The operation
    pub kind: JobKind,
}

/// Lifecycle state of a job.
///
/// `Pending → Running → Completed | Failed | Cancelled`; terminal states are
/// final, and each state carries exactly the data that is meaningful in it,
/// so "completed with a failure reason" cannot be represented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Waiting for its predecessors to finish
    Pending,
    /// Currently executing
    Running {
        /// Bytes processed so far (whole chunks only)
        bytes_done: u32,
    },
    /// Finished successfully
    Completed {
        /// Total bytes processed
        bytes_done: u32,
    },
    /// Aborted on an error
    Failed {
        /// The error that stopped the job
        error: Error,
        /// Offset of the failing chunk; resume point for a follow-up job
        offset: u32,
        /// Bytes of fully completed chunks before the failure
        bytes_completed: u32,
    },
    /// Stopped on request at a chunk boundary (or removed before starting)
    Cancelled {
        /// Bytes of fully completed chunks before the stop
        bytes_completed: u32,
    },
}

impl JobState {
    /// Whether this state is terminal. A terminated job is never re-entered;
    /// retrying means creating a new job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed { .. } | JobState::Failed { .. } | JobState::Cancelled { .. }
        )
    }
}

/// One notification on the queue's event stream.
#[derive(Debug, Clone)]
pub struct JobEvent {
    /// The job this event belongs to
    pub job: JobId,
    /// What happened
    pub kind: JobEventKind,
}

/// Event payloads emitted while a job executes.
///
/// The stream per job is `Started` followed by zero or more
/// `ChunkCompleted`, then exactly one terminal event.
#[derive(Debug, Clone)]
pub enum JobEventKind {
    /// The job left the queue and began executing
    Started,
    /// One chunk was fully written (or verified)
    ChunkCompleted {
        /// Absolute chip offset of the chunk
        offset: u32,
        /// Chunk length in bytes
        len: u32,
    },
    /// The job finished successfully
    Completed {
        /// Total bytes processed
        bytes_done: u32,
    },
    /// The job stopped on an error
    Failed {
        /// The error that stopped the job
        error: Error,
        /// Resume offset
        offset: u32,
        /// Bytes completed before the failure
        bytes_completed: u32,
    },
    /// The job was cancelled
    Cancelled {
        /// Bytes completed before the stop
        bytes_completed: u32,
    },
}
