use core::ops::RangeInclusive;

use anyhow::{ensure, Result};
use helper_functions::misc::{compute_epoch_at_slot, compute_terminal_slot_at_epoch};
use reward_metrics::EpochWindow;
use types::{
    config::Config,
    phase0::primitives::{Epoch, Slot},
};

use crate::error::Error;

/// Epochs needed before the first rewarded one: a window spans three snapshots.
const LOOKBEHIND_EPOCHS: u64 = 2;

/// Epochs needed after the last one: epoch rows describe the oldest snapshot of a window.
const LOOKAHEAD_EPOCHS: u64 = 2;

/// Requested slot range expanded to whole epochs.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SlotRange {
    init_slot: Slot,
    final_slot: Slot,
    init_epoch: Epoch,
    final_epoch: Epoch,
}

impl SlotRange {
    pub fn new(config: &Config, init_slot: Slot, final_slot: Slot) -> Result<Self> {
        ensure!(
            init_slot <= final_slot,
            Error::InvalidSlotRange {
                init_slot,
                final_slot,
            },
        );

        let init_epoch = compute_epoch_at_slot(config, init_slot);
        let final_epoch = compute_epoch_at_slot(config, final_slot);

        Ok(Self {
            init_slot,
            final_slot: compute_terminal_slot_at_epoch(config, final_epoch),
            init_epoch,
            final_epoch,
        })
    }

    /// Epochs whose terminal snapshots must be downloaded.
    #[must_use]
    pub const fn download_epochs(&self) -> RangeInclusive<Epoch> {
        self.init_epoch.saturating_sub(LOOKBEHIND_EPOCHS)
            ..=self.final_epoch.saturating_add(LOOKAHEAD_EPOCHS)
    }

    /// Epochs in which a window ends, one epoch task each.
    ///
    /// Windows ending after the final epoch only produce epoch rows.
    #[must_use]
    pub const fn window_epochs(&self) -> RangeInclusive<Epoch> {
        self.init_epoch..=self.final_epoch.saturating_add(LOOKAHEAD_EPOCHS)
    }

    /// Epochs that receive rows.
    #[must_use]
    pub const fn analysed_epochs(&self) -> RangeInclusive<Epoch> {
        self.init_epoch..=self.final_epoch
    }

    #[must_use]
    pub const fn epoch_count(&self) -> u64 {
        self.final_epoch - self.init_epoch + 1
    }

    #[must_use]
    pub const fn window_count(&self) -> u64 {
        self.epoch_count() + LOOKAHEAD_EPOCHS
    }

    /// Epochs that lose rows when the window ending in `next_epoch` is abandoned.
    ///
    /// Validator rows describe the last epoch of a window and epoch rows describe the first one.
    pub fn epochs_covered_by(&self, next_epoch: Epoch) -> impl Iterator<Item = Epoch> + '_ {
        [Some(next_epoch), next_epoch.checked_sub(LOOKBEHIND_EPOCHS)]
            .into_iter()
            .flatten()
            .filter(|epoch| self.analysed_epochs().contains(epoch))
    }

    /// Number of snapshots that would precede genesis. They are replaced with placeholders.
    #[must_use]
    pub const fn pre_genesis_epochs(&self) -> u64 {
        LOOKBEHIND_EPOCHS.saturating_sub(self.init_epoch)
    }

    #[must_use]
    pub fn writes_validator_rows(&self, window: &EpochWindow) -> bool {
        self.init_slot <= window.next.slot && window.next.slot <= self.final_slot
    }

    /// Epoch summaries, proposer duties and block rows describe the previous epoch of the window.
    #[must_use]
    pub fn writes_epoch_rows(&self, window: &EpochWindow) -> bool {
        !window.prev.is_empty()
            && self.init_slot <= window.prev.slot
            && window.prev.slot <= self.final_slot
    }
}
