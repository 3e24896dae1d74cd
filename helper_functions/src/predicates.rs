use types::{
    nonstandard::ValidatorStatus,
    phase0::{
        consts::FAR_FUTURE_EPOCH,
        containers::Validator,
        primitives::{Epoch, ValidatorIndex},
    },
};

// > Check if ``validator`` is active.
#[inline]
#[must_use]
pub const fn is_active_validator(validator: &Validator, epoch: Epoch) -> bool {
    validator.activation_epoch <= epoch && epoch < validator.exit_epoch
}

#[must_use]
pub const fn validator_status(validator: &Validator, epoch: Epoch) -> ValidatorStatus {
    if validator.slashed {
        ValidatorStatus::Slashed
    } else if validator.activation_epoch == FAR_FUTURE_EPOCH || epoch < validator.activation_epoch
    {
        ValidatorStatus::InQueue
    } else if epoch < validator.exit_epoch {
        ValidatorStatus::Active
    } else {
        ValidatorStatus::Exited
    }
}

/// Indices reported as slashable by both attestations of an attester slashing.
#[must_use]
pub fn slashing_intersection(
    attesting_indices_1: &[ValidatorIndex],
    attesting_indices_2: &[ValidatorIndex],
) -> Vec<ValidatorIndex> {
    attesting_indices_1
        .iter()
        .copied()
        .filter(|index| attesting_indices_2.contains(index))
        .collect()
}
