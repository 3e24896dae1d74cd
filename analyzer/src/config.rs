use core::{num::NonZeroUsize, time::Duration};

use anyhow::{ensure, Result};
use nonzero_ext::nonzero;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use types::{
    nonstandard::ExternalRewardPreference,
    phase0::primitives::{Slot, ValidatorIndex},
};

use crate::error::Error;

/// Named group of validators analysed as one task.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Pool {
    pub name: String,
    pub validators: Vec<ValidatorIndex>,
}

#[serde_as]
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalyzerConfig {
    pub init_slot: Slot,
    pub final_slot: Slot,
    pub validator_workers: NonZeroUsize,
    /// Number of validator tasks per epoch. Defaults to the number of workers.
    pub validator_batches: Option<NonZeroUsize>,
    /// Rows buffered per table before the writer flushes them.
    pub batch_size: usize,
    pub writer_queue_capacity: NonZeroUsize,
    pub snapshot_cache_capacity: NonZeroUsize,
    pub state_fetch_retries: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub state_fetch_retry_delay: Duration,
    /// Delete existing rows for a slot before writing it again.
    pub rewrite: bool,
    pub external_reward_preference: ExternalRewardPreference,
    pub pools: Vec<Pool>,
    pub validator_indices: Vec<ValidatorIndex>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            init_slot: 0,
            final_slot: 0,
            validator_workers: nonzero!(50_usize),
            validator_batches: None,
            batch_size: 10_000,
            writer_queue_capacity: nonzero!(1024_usize),
            snapshot_cache_capacity: nonzero!(4_usize),
            state_fetch_retries: 3,
            state_fetch_retry_delay: Duration::from_secs(1),
            rewrite: false,
            external_reward_preference: ExternalRewardPreference::default(),
            pools: vec![],
            validator_indices: vec![],
        }
    }
}

impl AnalyzerConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.init_slot <= self.final_slot,
            Error::InvalidSlotRange {
                init_slot: self.init_slot,
                final_slot: self.final_slot,
            },
        );

        ensure!(self.batch_size > 0, Error::ZeroBatchSize);

        Ok(())
    }

    #[must_use]
    pub fn validator_batch_count(&self) -> NonZeroUsize {
        self.validator_batches.unwrap_or(self.validator_workers)
    }
}
