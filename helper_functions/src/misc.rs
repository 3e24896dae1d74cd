use core::ops::{Div as _, Range};

use anyhow::{bail, Result};
use num_integer::Roots as _;
use types::{
    altair::consts::{TIMELY_HEAD_FLAG_INDEX, TIMELY_SOURCE_FLAG_INDEX, TIMELY_TARGET_FLAG_INDEX},
    config::Config,
    phase0::primitives::{Epoch, Slot},
};

use crate::error::Error;

#[must_use]
pub fn compute_epoch_at_slot(config: &Config, slot: Slot) -> Epoch {
    slot.div(config.slots_per_epoch)
}

#[must_use]
pub const fn compute_start_slot_at_epoch(config: &Config, epoch: Epoch) -> Slot {
    epoch.saturating_mul(config.slots_per_epoch.get())
}

/// Last slot of `epoch`. Snapshots in an epoch task are taken at this slot.
#[must_use]
pub const fn compute_terminal_slot_at_epoch(config: &Config, epoch: Epoch) -> Slot {
    compute_start_slot_at_epoch(config, epoch.saturating_add(1)).saturating_sub(1)
}

#[must_use]
pub fn is_epoch_terminal(config: &Config, slot: Slot) -> bool {
    slot % config.slots_per_epoch == config.slots_per_epoch.get() - 1
}

#[must_use]
pub const fn slots_in_epoch(config: &Config, epoch: Epoch) -> Range<Slot> {
    compute_start_slot_at_epoch(config, epoch)..compute_start_slot_at_epoch(config, epoch + 1)
}

#[must_use]
pub fn integer_squareroot(value: u64) -> u64 {
    value.sqrt()
}

/// Largest inclusion delay with which an attestation still earns the given participation flag.
pub fn max_inclusion_delay(config: &Config, flag_index: usize) -> Result<u64> {
    let delay = match flag_index {
        TIMELY_SOURCE_FLAG_INDEX => integer_squareroot(config.slots_per_epoch.get()),
        TIMELY_TARGET_FLAG_INDEX => config.slots_per_epoch.get(),
        TIMELY_HEAD_FLAG_INDEX => config.min_inclusion_delay.get(),
        _ => bail!(Error::UnknownFlagIndex { flag_index }),
    };

    Ok(delay)
}

/// Inclusion delay recorded for validators whose attestation was never included.
#[must_use]
pub const fn missing_inclusion_delay(config: &Config) -> u64 {
    config.slots_per_epoch.get() + 1
}
