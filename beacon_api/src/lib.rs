//! Capability through which the analyzer obtains snapshots, blocks, duties and reward reports.
//!
//! The network client that talks to a beacon node is not part of this workspace. Anything that
//! implements [`Fetcher`] can drive the pipeline. [`SnapshotDirectory`] replays JSON dumps.

pub use crate::{
    error::{found, is_not_found, FetchError, Resource},
    fetcher::Fetcher,
    snapshot_directory::SnapshotDirectory,
};

mod error;
mod fetcher;
mod snapshot_directory;
