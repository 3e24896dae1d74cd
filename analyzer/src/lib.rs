//! Epoch reward pipeline.
//!
//! Four stages run concurrently and talk only through bounded queues:
//!
//! 1. [`Downloader`] fetches terminal snapshots and emits one [`EpochTask`] per epoch.
//! 2. [`EpochProcessor`] builds the metrics bundle of each task and splits its validators into
//!    [`ValidatorTask`]s.
//! 3. [`ValidatorWorkers`] resolve the rewards of every validator in a task.
//! 4. [`BatchWriter`] buffers the resulting rows and writes them to a [`database::Persister`].
//!
//! [`Analyzer`] wires them together and shuts them down in that order.

pub use crate::{
    batch_writer::{BatchWriter, WriterHandle, WriterReport},
    config::{AnalyzerConfig, Pool},
    downloader::Downloader,
    error::Error,
    messages::{EpochTask, ValidatorTask, WriterMessage},
    orchestrator::{Analyzer, RunReport},
    processor::{EpochProcessor, ProcessorReport},
    slot_range::SlotRange,
    workers::{ValidatorWorkers, WorkerStats},
};

mod batch_writer;
mod config;
mod downloader;
mod error;
mod messages;
mod orchestrator;
mod processor;
mod slot_range;
mod workers;

#[cfg(test)]
mod tests;
