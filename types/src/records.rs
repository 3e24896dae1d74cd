use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::{
    nonstandard::ValidatorStatus,
    phase0::primitives::{
        CommitteeIndex, Epoch, Gwei, GweiDelta, Slot, ValidatorIndex, WithdrawalIndex, H256,
    },
};

/// Destination tables of the analyzer.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, Debug, AsRefStr, Display, EnumIter, EnumString,
)]
pub enum Table {
    #[strum(serialize = "t_validator_rewards_summary")]
    ValidatorRewards,
    #[strum(serialize = "t_epoch_metrics_summary")]
    EpochSummary,
    #[strum(serialize = "t_proposer_duties")]
    ProposerDuties,
    #[strum(serialize = "t_block_metrics")]
    Blocks,
    #[strum(serialize = "t_attestations")]
    Attestations,
    #[strum(serialize = "t_withdrawals")]
    Withdrawals,
}

/// Reward record of one validator for one epoch.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct ValidatorRewards {
    pub validator_index: ValidatorIndex,
    pub epoch: Epoch,
    /// Last slot of `epoch`. Used to scope deletes when a range is reprocessed.
    pub slot: Slot,
    pub validator_balance: Gwei,
    pub reward: GweiDelta,
    pub max_reward: Gwei,
    pub attestation_reward: Gwei,
    pub sync_committee_reward: Gwei,
    pub proposer_reward: Gwei,
    pub slashing_reward: Gwei,
    pub base_reward: Gwei,
    pub missing_source: bool,
    pub missing_target: bool,
    pub missing_head: bool,
    pub status: ValidatorStatus,
    pub proposer_api_reward: Option<Gwei>,
    pub proposer_manual_reward: Gwei,
    pub in_sync_committee: bool,
    pub inclusion_delay: u64,
    pub pool_name: Option<String>,
}

#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct EpochSummary {
    pub epoch: Epoch,
    pub slot: Slot,
    pub attestation_count: u64,
    pub attesting_validators: u64,
    pub active_validators: u64,
    pub total_balance: Gwei,
    pub attesting_target_balance: Gwei,
    pub total_effective_balance: Gwei,
    pub missing_source: u64,
    pub missing_target: u64,
    pub missing_head: u64,
    pub missed_blocks: Vec<Slot>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct ProposerDuty {
    pub validator_index: ValidatorIndex,
    pub slot: Slot,
    pub proposed: bool,
}

/// Contents of the block proposed at a slot, or its absence.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct BlockSummary {
    pub epoch: Epoch,
    pub slot: Slot,
    pub proposer_index: ValidatorIndex,
    pub proposed: bool,
    pub attestation_count: u64,
    pub sync_committee_participants: u64,
    pub proposer_slashings: u64,
    pub attester_slashings: u64,
    pub withdrawal_count: u64,
    pub withdrawn_amount: Gwei,
    /// Total reported by the data source, if it provides one.
    pub reported_reward: Option<Gwei>,
}

/// Aggregate attestation included in a block.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct AttestationRecord {
    pub epoch: Epoch,
    /// Slot of the including block.
    pub slot: Slot,
    pub attestation_slot: Slot,
    pub committee_index: CommitteeIndex,
    pub beacon_block_root: H256,
    pub source_epoch: Epoch,
    pub source_root: H256,
    pub target_epoch: Epoch,
    pub target_root: H256,
    pub participants: u64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct WithdrawalRecord {
    pub epoch: Epoch,
    pub slot: Slot,
    pub index: WithdrawalIndex,
    pub validator_index: ValidatorIndex,
    pub amount: Gwei,
}

/// Any row accepted by a persister.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Row {
    ValidatorRewards(Box<ValidatorRewards>),
    EpochSummary(Box<EpochSummary>),
    ProposerDuty(ProposerDuty),
    Block(Box<BlockSummary>),
    Attestation(Box<AttestationRecord>),
    Withdrawal(WithdrawalRecord),
}

impl Row {
    #[must_use]
    pub const fn table(&self) -> Table {
        match self {
            Self::ValidatorRewards(_) => Table::ValidatorRewards,
            Self::EpochSummary(_) => Table::EpochSummary,
            Self::ProposerDuty(_) => Table::ProposerDuties,
            Self::Block(_) => Table::Blocks,
            Self::Attestation(_) => Table::Attestations,
            Self::Withdrawal(_) => Table::Withdrawals,
        }
    }

    /// Slot used to scope deletes of this row.
    #[must_use]
    pub fn slot(&self) -> Slot {
        match self {
            Self::ValidatorRewards(rewards) => rewards.slot,
            Self::EpochSummary(summary) => summary.slot,
            Self::ProposerDuty(duty) => duty.slot,
            Self::Block(block) => block.slot,
            Self::Attestation(attestation) => attestation.slot,
            Self::Withdrawal(withdrawal) => withdrawal.slot,
        }
    }
}

impl From<ValidatorRewards> for Row {
    fn from(rewards: ValidatorRewards) -> Self {
        Self::ValidatorRewards(Box::new(rewards))
    }
}

impl From<EpochSummary> for Row {
    fn from(summary: EpochSummary) -> Self {
        Self::EpochSummary(Box::new(summary))
    }
}

impl From<ProposerDuty> for Row {
    fn from(duty: ProposerDuty) -> Self {
        Self::ProposerDuty(duty)
    }
}

impl From<BlockSummary> for Row {
    fn from(block: BlockSummary) -> Self {
        Self::Block(Box::new(block))
    }
}

impl From<AttestationRecord> for Row {
    fn from(attestation: AttestationRecord) -> Self {
        Self::Attestation(Box::new(attestation))
    }
}

impl From<WithdrawalRecord> for Row {
    fn from(withdrawal: WithdrawalRecord) -> Self {
        Self::Withdrawal(withdrawal)
    }
}
