use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    altair::containers::{SyncAggregate, SyncCommittee},
    capella::containers::Withdrawal,
    nonstandard::BlockRewards,
    phase0::{
        containers::{
            Attestation, AttesterSlashing, BeaconCommittee, Checkpoint, ProposerDutyAssignment,
            ProposerSlashing, Validator,
        },
        primitives::{CommitteeIndex, Epoch, Gwei, Slot, ValidatorIndex, H256},
    },
};

/// Fork-agnostic view of the last state of an epoch together with the blocks and duties of that
/// epoch.
///
/// Snapshots are immutable once built and are shared through `Arc` by every reader of the window
/// they belong to. Accumulators derived from them live in the reward metrics bundle instead.
#[derive(Clone, PartialEq, Eq, Default, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AgnosticState {
    pub epoch: Epoch,
    pub slot: Slot,
    /// [`H256::zero`] marks a placeholder for an epoch before genesis.
    pub state_root: H256,
    pub validators: Vec<Validator>,
    pub balances: Vec<Gwei>,
    /// Ring buffer of length `SLOTS_PER_HISTORICAL_ROOT`.
    pub block_roots: Vec<H256>,
    pub previous_justified_checkpoint: Checkpoint,
    pub current_justified_checkpoint: Checkpoint,
    pub finalized_checkpoint: Checkpoint,
    #[serde(default)]
    pub current_sync_committee: Option<SyncCommittee>,
    #[serde(default)]
    pub blocks: Vec<AgnosticBlock>,
    #[serde(default)]
    pub duties: EpochDuties,
}

impl AgnosticState {
    /// Placeholder for an epoch that precedes genesis.
    #[must_use]
    pub fn empty(epoch: Epoch, slot: Slot) -> Self {
        Self {
            epoch,
            slot,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state_root.is_zero()
    }

    #[must_use]
    pub fn validator(&self, validator_index: ValidatorIndex) -> Option<&Validator> {
        self.validators.get(usize::try_from(validator_index).ok()?)
    }

    #[must_use]
    pub fn balance(&self, validator_index: ValidatorIndex) -> Option<Gwei> {
        self.balances
            .get(usize::try_from(validator_index).ok()?)
            .copied()
    }

    #[must_use]
    pub fn block_at_slot(&self, slot: Slot) -> Option<&AgnosticBlock> {
        self.blocks.iter().find(|block| block.slot == slot)
    }

    pub fn missed_blocks(&self) -> impl Iterator<Item = Slot> + '_ {
        self.blocks
            .iter()
            .filter(|block| !block.proposed)
            .map(|block| block.slot)
    }
}

/// Summary of the block (or absence of one) at a slot.
#[derive(Clone, PartialEq, Eq, Default, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AgnosticBlock {
    pub slot: Slot,
    pub proposer_index: ValidatorIndex,
    pub proposed: bool,
    #[serde(default)]
    pub attestations: Vec<Attestation>,
    #[serde(default)]
    pub sync_aggregate: Option<SyncAggregate>,
    #[serde(default)]
    pub proposer_slashings: Vec<ProposerSlashing>,
    #[serde(default)]
    pub attester_slashings: Vec<AttesterSlashing>,
    #[serde(default)]
    pub withdrawals: Vec<Withdrawal>,
    /// Reward breakdown reported by the data source, if it provides one.
    #[serde(default)]
    pub reward: Option<BlockRewards>,
}

impl AgnosticBlock {
    /// Summary of a slot in which the scheduled proposer did not produce a block.
    #[must_use]
    pub fn missed(slot: Slot, proposer_index: ValidatorIndex) -> Self {
        Self {
            slot,
            proposer_index,
            proposed: false,
            ..Self::default()
        }
    }
}

/// Committee and proposer assignments of one epoch.
#[derive(Clone, PartialEq, Eq, Default, Debug, Deserialize, Serialize)]
#[serde(from = "EpochDutiesData", into = "EpochDutiesData")]
pub struct EpochDuties {
    beacon_committees: Vec<BeaconCommittee>,
    proposer_duties: Vec<ProposerDutyAssignment>,
    committee_positions: HashMap<(Slot, CommitteeIndex), usize>,
    attestation_slots: HashMap<ValidatorIndex, Slot>,
}

impl EpochDuties {
    #[must_use]
    pub fn new(
        beacon_committees: Vec<BeaconCommittee>,
        proposer_duties: Vec<ProposerDutyAssignment>,
    ) -> Self {
        let committee_positions = beacon_committees
            .iter()
            .enumerate()
            .map(|(position, committee)| ((committee.slot, committee.index), position))
            .collect();

        let attestation_slots = beacon_committees
            .iter()
            .flat_map(|committee| {
                committee
                    .validators
                    .iter()
                    .map(|validator_index| (*validator_index, committee.slot))
            })
            .collect();

        Self {
            beacon_committees,
            proposer_duties,
            committee_positions,
            attestation_slots,
        }
    }

    #[must_use]
    pub fn beacon_committees(&self) -> &[BeaconCommittee] {
        &self.beacon_committees
    }

    #[must_use]
    pub fn proposer_duties(&self) -> &[ProposerDutyAssignment] {
        &self.proposer_duties
    }

    #[must_use]
    pub fn committee(&self, slot: Slot, index: CommitteeIndex) -> Option<&[ValidatorIndex]> {
        let position = *self.committee_positions.get(&(slot, index))?;
        Some(&self.beacon_committees[position].validators)
    }

    /// Slot in which the validator was assigned to attest.
    #[must_use]
    pub fn attestation_slot(&self, validator_index: ValidatorIndex) -> Option<Slot> {
        self.attestation_slots.get(&validator_index).copied()
    }
}

#[derive(Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct EpochDutiesData {
    beacon_committees: Vec<BeaconCommittee>,
    proposer_duties: Vec<ProposerDutyAssignment>,
}

impl From<EpochDutiesData> for EpochDuties {
    fn from(data: EpochDutiesData) -> Self {
        Self::new(data.beacon_committees, data.proposer_duties)
    }
}

impl From<EpochDuties> for EpochDutiesData {
    fn from(duties: EpochDuties) -> Self {
        Self {
            beacon_committees: duties.beacon_committees,
            proposer_duties: duties.proposer_duties,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn duties() -> EpochDuties {
        EpochDuties::new(
            vec![
                BeaconCommittee {
                    slot: 8,
                    index: 0,
                    validators: vec![3, 1],
                },
                BeaconCommittee {
                    slot: 9,
                    index: 0,
                    validators: vec![0, 2],
                },
            ],
            vec![ProposerDutyAssignment {
                validator_index: 2,
                slot: 8,
            }],
        )
    }

    #[test]
    fn committees_are_indexed_by_slot_and_index() {
        let duties = duties();

        assert_eq!(duties.committee(8, 0), Some([3, 1].as_slice()));
        assert_eq!(duties.committee(9, 0), Some([0, 2].as_slice()));
        assert_eq!(duties.committee(9, 1), None);
    }

    #[test]
    fn attestation_slots_are_derived_from_committees() {
        let duties = duties();

        assert_eq!(duties.attestation_slot(1), Some(8));
        assert_eq!(duties.attestation_slot(2), Some(9));
        assert_eq!(duties.attestation_slot(4), None);
    }

    #[test]
    fn duties_survive_serialization() -> Result<(), serde_json::Error> {
        let duties = duties();
        let json = serde_json::to_string(&duties)?;

        assert_eq!(serde_json::from_str::<EpochDuties>(&json)?, duties);

        Ok(())
    }

    #[test]
    fn empty_placeholder_has_no_state_root() {
        let state = AgnosticState::empty(0, 7);

        assert!(state.is_empty());
        assert_eq!(state.missed_blocks().count(), 0);
    }
}
