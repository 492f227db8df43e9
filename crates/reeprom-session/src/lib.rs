//! reeprom-session - Adapter opening and the EEPROM job queue
//!
//! This crate is the layer a front-end (CLI or UI) talks to: it opens
//! adapters by name string (`"sim"`, `"sim:addr=0x50,size=32768"`), and it
//! runs staged EEPROM programming operations through a FIFO job queue on a
//! dedicated worker thread, reporting progress through an event stream.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod job;
mod queue;
mod registry;

pub use job::{JobEvent, JobEventKind, JobId, JobKind, JobSpec, JobState};
pub use queue::JobQueue;
pub use registry::{adapter_names, open_adapter, parse_adapter_params, AdapterParams, OpenError};
