use core::ops::{Div as _, Mul as _};

use anyhow::{ensure, Result};
use types::{
    config::Config,
    phase0::{
        consts::BASE_REWARDS_PER_EPOCH,
        containers::{Attestation, Validator},
        primitives::{Epoch, Gwei, Slot, ValidatorIndex, H256},
    },
    snapshot::{AgnosticState, EpochDuties},
};

use crate::{error::Error, misc, predicates::is_active_validator};

pub fn get_validator(state: &AgnosticState, validator_index: ValidatorIndex) -> Result<&Validator> {
    state
        .validator(validator_index)
        .ok_or_else(|| Error::ValidatorNotFound { validator_index }.into())
}

pub fn active_validator_indices(
    state: &AgnosticState,
    epoch: Epoch,
) -> impl Iterator<Item = ValidatorIndex> + '_ {
    (0..)
        .zip(&state.validators)
        .filter(move |(_, validator)| is_active_validator(validator, epoch))
        .map(|(validator_index, _)| validator_index)
}

#[must_use]
pub fn active_validator_count(state: &AgnosticState) -> u64 {
    active_validator_indices(state, state.epoch).count() as u64
}

/// Sum of effective balances of validators active in the state's epoch.
/// Never less than one increment so that it can be used as a divisor.
#[must_use]
pub fn total_active_balance(config: &Config, state: &AgnosticState) -> Gwei {
    let total = state
        .validators
        .iter()
        .filter(|validator| is_active_validator(validator, state.epoch))
        .map(|validator| validator.effective_balance)
        .sum::<Gwei>();

    total.max(config.effective_balance_increment.get())
}

/// Sum of actual balances of validators active in the state's epoch.
#[must_use]
pub fn total_active_real_balance(state: &AgnosticState) -> Gwei {
    state
        .validators
        .iter()
        .zip(&state.balances)
        .filter(|(validator, _)| is_active_validator(validator, state.epoch))
        .map(|(_, balance)| balance)
        .sum()
}

#[must_use]
pub fn total_effective_balance(state: &AgnosticState) -> Gwei {
    state
        .validators
        .iter()
        .map(|validator| validator.effective_balance)
        .sum()
}

#[must_use]
pub fn get_base_reward_per_increment(config: &Config, total_active_balance: Gwei) -> Gwei {
    config
        .effective_balance_increment
        .get()
        .mul(config.base_reward_factor)
        .div(misc::integer_squareroot(total_active_balance).max(1))
}

#[must_use]
pub fn compute_base_reward(
    config: &Config,
    effective_balance: Gwei,
    base_reward_per_increment: Gwei,
) -> Gwei {
    let increments = effective_balance / config.effective_balance_increment;
    increments * base_reward_per_increment
}

#[must_use]
pub fn get_phase0_base_reward(
    config: &Config,
    effective_balance: Gwei,
    total_active_balance: Gwei,
) -> Gwei {
    effective_balance
        .mul(config.base_reward_factor)
        .div(misc::integer_squareroot(total_active_balance).max(1))
        .div(BASE_REWARDS_PER_EPOCH)
}

pub fn get_block_root_at_slot(config: &Config, state: &AgnosticState, slot: Slot) -> Result<H256> {
    let out_of_range = || Error::SlotOutOfRange {
        slot,
        state_slot: state.slot,
    };

    ensure!(slot < state.slot, out_of_range());

    ensure!(
        state.slot <= slot + config.slots_per_historical_root.get(),
        out_of_range(),
    );

    let position = usize::try_from(slot % config.slots_per_historical_root)?;

    state
        .block_roots
        .get(position)
        .copied()
        .ok_or_else(|| out_of_range().into())
}

/// Root of the block that started `epoch`, or of the last block before it if the slot was empty.
pub fn get_block_root(config: &Config, state: &AgnosticState, epoch: Epoch) -> Result<H256> {
    get_block_root_at_slot(config, state, misc::compute_start_slot_at_epoch(config, epoch))
}

/// Resolves the aggregation bits of an attestation against the committee that was assigned to
/// attest in its slot.
pub fn get_attesting_indices(
    duties: &EpochDuties,
    attestation: &Attestation,
) -> Result<Vec<ValidatorIndex>> {
    let slot = attestation.data.slot;
    let index = attestation.data.index;

    let committee = duties
        .committee(slot, index)
        .ok_or(Error::CommitteeNotFound { slot, index })?;

    attestation
        .aggregation_bits
        .iter_ones()
        .map(|position| {
            committee
                .get(position)
                .copied()
                .ok_or_else(|| {
                    Error::AttesterNotInCommittee {
                        slot,
                        index,
                        position,
                    }
                    .into()
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use bitvec::{bits, order::Lsb0};
    use types::phase0::{
        consts::FAR_FUTURE_EPOCH,
        containers::{AttestationData, BeaconCommittee},
    };

    use super::*;

    fn state_with_balances(effective_balances: &[Gwei]) -> AgnosticState {
        let validators = effective_balances
            .iter()
            .map(|effective_balance| Validator {
                effective_balance: *effective_balance,
                activation_epoch: 0,
                ..Validator::default()
            })
            .collect();

        AgnosticState {
            epoch: 3,
            slot: 31,
            state_root: H256::repeat_byte(1),
            validators,
            balances: effective_balances.iter().map(|balance| balance + 5).collect(),
            ..AgnosticState::default()
        }
    }

    #[test]
    fn base_reward_per_increment_matches_hand_computed_value() {
        let config = Config::mainnet();
        let total_active_balance = 1_000_000 * 1_000_000_000;

        // 64 * 10^9 / floor(sqrt(10^15)) = 64_000_000_000 / 31_622_776
        assert_eq!(
            get_base_reward_per_increment(&config, total_active_balance),
            2023,
        );
    }

    #[test]
    fn base_reward_scales_with_increments() {
        let config = Config::mainnet();

        assert_eq!(compute_base_reward(&config, 32_000_000_000, 2023), 32 * 2023);
        assert_eq!(compute_base_reward(&config, 31_999_999_999, 2023), 31 * 2023);
    }

    #[test]
    fn phase0_base_reward_divides_by_rewards_per_epoch() {
        let config = Config::mainnet();

        // 32 * 10^9 * 64 / 31_622_776 / 4
        assert_eq!(
            get_phase0_base_reward(&config, 32_000_000_000, 1_000_000 * 1_000_000_000),
            16_190,
        );
    }

    #[test]
    fn total_active_balance_ignores_inactive_validators() {
        let config = Config::minimal();
        let mut state = state_with_balances(&[32_000_000_000, 32_000_000_000, 16_000_000_000]);

        state.validators[1].exit_epoch = 2;
        state.validators[2].activation_epoch = FAR_FUTURE_EPOCH;

        assert_eq!(total_active_balance(&config, &state), 32_000_000_000);
        assert_eq!(total_active_real_balance(&state), 32_000_000_005);
        assert_eq!(total_effective_balance(&state), 80_000_000_000);
        assert_eq!(active_validator_count(&state), 1);
    }

    #[test]
    fn total_active_balance_is_at_least_one_increment() {
        let config = Config::minimal();
        let state = AgnosticState::default();

        assert_eq!(
            total_active_balance(&config, &state),
            config.effective_balance_increment.get(),
        );
    }

    #[test]
    fn block_roots_are_read_from_the_ring() -> Result<()> {
        let config = Config::minimal();

        let state = AgnosticState {
            slot: 70,
            block_roots: (0..64).map(H256::from_low_u64_be).collect(),
            ..AgnosticState::default()
        };

        assert_eq!(
            get_block_root_at_slot(&config, &state, 69)?,
            H256::from_low_u64_be(5),
        );
        assert_eq!(get_block_root(&config, &state, 1)?, H256::from_low_u64_be(8));
        assert!(get_block_root_at_slot(&config, &state, 70).is_err());
        assert!(get_block_root_at_slot(&config, &state, 5).is_err());

        Ok(())
    }

    #[test]
    fn attesting_indices_follow_committee_positions() -> Result<()> {
        let duties = EpochDuties::new(
            vec![BeaconCommittee {
                slot: 9,
                index: 1,
                validators: vec![12, 4, 7],
            }],
            vec![],
        );

        let attestation = Attestation {
            aggregation_bits: bits![u8, Lsb0; 1, 0, 1].to_bitvec(),
            data: AttestationData {
                slot: 9,
                index: 1,
                ..AttestationData::default()
            },
        };

        assert_eq!(get_attesting_indices(&duties, &attestation)?, [12, 7]);

        Ok(())
    }

    #[test]
    fn unresolvable_attesters_are_errors() {
        let duties = EpochDuties::new(
            vec![BeaconCommittee {
                slot: 9,
                index: 0,
                validators: vec![12],
            }],
            vec![],
        );

        let outside_committee = Attestation {
            aggregation_bits: bits![u8, Lsb0; 0, 1].to_bitvec(),
            data: AttestationData {
                slot: 9,
                ..AttestationData::default()
            },
        };

        let unknown_committee = Attestation {
            aggregation_bits: bits![u8, Lsb0; 1].to_bitvec(),
            data: AttestationData {
                slot: 10,
                ..AttestationData::default()
            },
        };

        assert!(get_attesting_indices(&duties, &outside_committee).is_err());
        assert!(get_attesting_indices(&duties, &unknown_committee).is_err());
    }
}
