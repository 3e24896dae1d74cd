//! Deterministic chains for tests.
//!
//! Every epoch of a [`Chain`] starts out perfect: all validators are active from genesis, every
//! slot has a block, every committee votes for the canonical source, target and head and every
//! vote is included one slot later. Tests then break individual pieces with the mutators.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use anyhow::{anyhow, ensure, Error as AnyhowError, Result};
use async_trait::async_trait;
use beacon_api::{FetchError, Fetcher, Resource};
use bitvec::{bitvec, order::Lsb0};
use helper_functions::misc::{
    compute_epoch_at_slot, compute_start_slot_at_epoch, compute_terminal_slot_at_epoch,
    slots_in_epoch,
};
use itertools::Itertools as _;
use types::{
    altair::containers::{SyncAggregate, SyncCommittee, SyncCommitteeBits},
    config::Config,
    nonstandard::{BlockRewards, Phase},
    phase0::{
        containers::{
            Attestation, AttestationData, BeaconCommittee, Checkpoint, ProposerDutyAssignment,
            Validator,
        },
        primitives::{Epoch, Gwei, PublicKeyBytes, Slot, ValidatorIndex, H256},
    },
    snapshot::{AgnosticBlock, AgnosticState, EpochDuties},
};

pub const VALIDATOR_BALANCE: Gwei = 32_000_000_000;

/// Balance gained by every validator in each epoch after the first one.
pub const BALANCE_GROWTH_PER_EPOCH: Gwei = 10_000;

#[must_use]
pub fn block_root(slot: Slot) -> H256 {
    H256::from_low_u64_be(slot + 1)
}

#[must_use]
pub fn pubkey(validator_index: ValidatorIndex) -> PublicKeyBytes {
    PublicKeyBytes::from_low_u64_be(validator_index + 1)
}

#[must_use]
pub fn balance_at_epoch(epoch: Epoch) -> Gwei {
    VALIDATOR_BALANCE + BALANCE_GROWTH_PER_EPOCH * epoch.saturating_sub(1)
}

pub struct Chain {
    config: Arc<Config>,
    validator_count: u64,
    states: Vec<AgnosticState>,
}

impl Chain {
    #[must_use]
    pub fn new(config: Arc<Config>, validator_count: u64, last_epoch: Epoch) -> Self {
        let states = (0..=last_epoch)
            .map(|epoch| build_state(&config, validator_count, epoch))
            .collect();

        Self {
            config,
            validator_count,
            states,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &Arc<Config> {
        &self.config
    }

    #[must_use]
    pub const fn validator_count(&self) -> u64 {
        self.validator_count
    }

    pub fn state(&self, epoch: Epoch) -> Result<&AgnosticState> {
        self.states
            .get(usize::try_from(epoch)?)
            .ok_or_else(|| Self::epoch_out_of_range(epoch))
    }

    pub fn state_mut(&mut self, epoch: Epoch) -> Result<&mut AgnosticState> {
        self.states
            .get_mut(usize::try_from(epoch)?)
            .ok_or_else(|| Self::epoch_out_of_range(epoch))
    }

    pub fn block_mut(&mut self, slot: Slot) -> Result<&mut AgnosticBlock> {
        let epoch = compute_epoch_at_slot(&self.config, slot);

        self.state_mut(epoch)?
            .blocks
            .iter_mut()
            .find(|block| block.slot == slot)
            .ok_or_else(|| anyhow!("no block at slot {slot}"))
    }

    /// Turns the block at `slot` into a missed slot. Votes it carried are included one slot later.
    pub fn miss_block(&mut self, slot: Slot) -> Result<()> {
        let block = self.block_mut(slot)?;

        block.proposed = false;
        block.sync_aggregate = None;

        let attestations = core::mem::take(&mut block.attestations);

        self.block_mut(slot + 1)?.attestations.splice(0..0, attestations);

        Ok(())
    }

    /// Removes the vote of `validator_index` for its duty in `epoch` from every block.
    pub fn remove_vote(&mut self, validator_index: ValidatorIndex, epoch: Epoch) -> Result<()> {
        let (duty_slot, position) = self.committee_position(validator_index, epoch)?;

        for state in &mut self.states {
            for block in &mut state.blocks {
                for attestation in &mut block.attestations {
                    if attestation.data.slot == duty_slot {
                        attestation.aggregation_bits.set(position, false);
                    }
                }
            }
        }

        Ok(())
    }

    /// Makes every vote for `epoch` point at a wrong head block.
    pub fn vote_for_wrong_heads(&mut self, epoch: Epoch) {
        let slots = slots_in_epoch(&self.config, epoch);

        for attestation in self
            .states
            .iter_mut()
            .flat_map(|state| &mut state.blocks)
            .flat_map(|block| &mut block.attestations)
            .filter(|attestation| slots.contains(&attestation.data.slot))
        {
            attestation.data.beacon_block_root = H256::repeat_byte(0xff);
        }
    }

    /// Snapshots `(next_epoch - 2, next_epoch - 1, next_epoch)`.
    pub fn window(
        &self,
        next_epoch: Epoch,
    ) -> Result<(Arc<AgnosticState>, Arc<AgnosticState>, Arc<AgnosticState>)> {
        ensure!(next_epoch >= 2, "window ending in epoch {next_epoch} starts before genesis");

        Ok((
            Arc::new(self.state(next_epoch - 2)?.clone()),
            Arc::new(self.state(next_epoch - 1)?.clone()),
            Arc::new(self.state(next_epoch)?.clone()),
        ))
    }

    /// Serves the chain the way a beacon node would: states without blocks or duties, reward
    /// reports separately from blocks and nothing at all for missed slots.
    #[must_use]
    pub fn fetcher(&self) -> InMemoryFetcher {
        let mut fetcher = InMemoryFetcher::default();

        for state in &self.states {
            for block in &state.blocks {
                if !block.proposed {
                    continue;
                }

                if let Some(reward) = block.reward {
                    fetcher.rewards.insert(block.slot, reward);
                }

                fetcher.blocks.insert(
                    block.slot,
                    AgnosticBlock {
                        reward: None,
                        ..block.clone()
                    },
                );
            }

            fetcher.duties.insert(state.epoch, state.duties.clone());

            fetcher.states.insert(
                state.slot,
                AgnosticState {
                    blocks: vec![],
                    duties: EpochDuties::default(),
                    ..state.clone()
                },
            );
        }

        fetcher
    }

    fn committee_position(
        &self,
        validator_index: ValidatorIndex,
        epoch: Epoch,
    ) -> Result<(Slot, usize)> {
        let duties = &self.state(epoch)?.duties;

        duties
            .beacon_committees()
            .iter()
            .find_map(|committee| {
                committee
                    .validators
                    .iter()
                    .position(|member| *member == validator_index)
                    .map(|position| (committee.slot, position))
            })
            .ok_or_else(|| {
                anyhow!("validator {validator_index} has no duty in epoch {epoch}")
            })
    }

    fn epoch_out_of_range(epoch: Epoch) -> AnyhowError {
        anyhow!("epoch {epoch} is not part of the chain")
    }
}

#[derive(Default)]
pub struct InMemoryFetcher {
    states: BTreeMap<Slot, AgnosticState>,
    blocks: BTreeMap<Slot, AgnosticBlock>,
    duties: BTreeMap<Epoch, EpochDuties>,
    rewards: BTreeMap<Slot, BlockRewards>,
    failing_states: BTreeSet<Slot>,
}

impl InMemoryFetcher {
    /// Makes every request for the states at `slots` fail with a transport error.
    #[must_use]
    pub fn with_failing_states(mut self, slots: impl IntoIterator<Item = Slot>) -> Self {
        self.failing_states.extend(slots);
        self
    }
}

#[async_trait]
impl Fetcher for InMemoryFetcher {
    async fn get_block(&self, slot: Slot) -> Result<AgnosticBlock> {
        self.blocks.get(&slot).cloned().ok_or_else(|| {
            FetchError::NotFound {
                resource: Resource::Block,
                id: slot,
            }
            .into()
        })
    }

    async fn get_state(&self, slot: Slot) -> Result<AgnosticState> {
        if self.failing_states.contains(&slot) {
            return Err(FetchError::Transport {
                resource: Resource::State,
                id: slot,
                message: "connection refused".to_owned(),
            }
            .into());
        }

        self.states.get(&slot).cloned().ok_or_else(|| {
            FetchError::NotFound {
                resource: Resource::State,
                id: slot,
            }
            .into()
        })
    }

    async fn get_committees_and_duties(&self, epoch: Epoch) -> Result<EpochDuties> {
        self.duties.get(&epoch).cloned().ok_or_else(|| {
            FetchError::NotFound {
                resource: Resource::Duties,
                id: epoch,
            }
            .into()
        })
    }

    async fn get_block_reward_report(&self, slot: Slot) -> Result<BlockRewards> {
        self.rewards.get(&slot).copied().ok_or_else(|| {
            FetchError::NotFound {
                resource: Resource::BlockRewards,
                id: slot,
            }
            .into()
        })
    }
}

fn justified_checkpoint(config: &Config, epoch: Epoch) -> Checkpoint {
    let epoch = epoch.saturating_sub(1);

    Checkpoint {
        epoch,
        root: block_root(compute_start_slot_at_epoch(config, epoch)),
    }
}

fn committee_members(config: &Config, validator_count: u64, slot: Slot) -> Vec<ValidatorIndex> {
    let slots_per_epoch = config.slots_per_epoch.get();

    (0..validator_count)
        .filter(|validator_index| validator_index % slots_per_epoch == slot % slots_per_epoch)
        .collect()
}

fn build_duties(config: &Config, validator_count: u64, epoch: Epoch) -> EpochDuties {
    let committees = slots_in_epoch(config, epoch)
        .map(|slot| BeaconCommittee {
            slot,
            index: 0,
            validators: committee_members(config, validator_count, slot),
        })
        .filter(|committee| !committee.validators.is_empty())
        .collect();

    let proposer_duties = slots_in_epoch(config, epoch)
        .map(|slot| ProposerDutyAssignment {
            validator_index: slot % validator_count,
            slot,
        })
        .collect();

    EpochDuties::new(committees, proposer_duties)
}

fn build_block(config: &Config, validator_count: u64, slot: Slot) -> AgnosticBlock {
    let attestations = slot
        .checked_sub(1)
        .map(|attested_slot| (attested_slot, committee_members(config, validator_count, attested_slot)))
        .filter(|(_, members)| !members.is_empty())
        .map(|(attested_slot, members)| {
            let epoch = compute_epoch_at_slot(config, attested_slot);

            Attestation {
                aggregation_bits: bitvec![u8, Lsb0; 1; members.len()],
                data: AttestationData {
                    slot: attested_slot,
                    index: 0,
                    beacon_block_root: block_root(attested_slot),
                    source: justified_checkpoint(config, epoch),
                    target: Checkpoint {
                        epoch,
                        root: block_root(compute_start_slot_at_epoch(config, epoch)),
                    },
                },
            }
        })
        .into_iter()
        .collect_vec();

    let sync_aggregate = (config.phase_at_epoch(compute_epoch_at_slot(config, slot))
        >= Phase::Altair)
        .then(|| SyncAggregate {
            sync_committee_bits: (0..config.sync_committee_size.get())
                .map(|_| true)
                .collect::<SyncCommitteeBits>(),
        });

    AgnosticBlock {
        slot,
        proposer_index: slot % validator_count,
        proposed: true,
        attestations,
        sync_aggregate,
        ..AgnosticBlock::default()
    }
}

fn build_state(config: &Config, validator_count: u64, epoch: Epoch) -> AgnosticState {
    let slot = compute_terminal_slot_at_epoch(config, epoch);
    let historical_length = config.slots_per_historical_root.get();

    let block_roots = (0..historical_length)
        .map(|position| {
            (slot.saturating_sub(historical_length)..slot)
                .find(|past_slot| past_slot % historical_length == position)
                .map_or_else(H256::zero, block_root)
        })
        .collect();

    let validators = (0..validator_count)
        .map(|validator_index| Validator {
            pubkey: pubkey(validator_index),
            effective_balance: VALIDATOR_BALANCE,
            activation_eligibility_epoch: 0,
            activation_epoch: 0,
            ..Validator::default()
        })
        .collect_vec();

    let current_sync_committee = (config.phase_at_epoch(epoch) >= Phase::Altair).then(|| {
        SyncCommittee {
            pubkeys: (0..config.sync_committee_size.get())
                .map(|seat| pubkey(seat % validator_count))
                .collect(),
        }
    });

    AgnosticState {
        epoch,
        slot,
        state_root: H256::from_low_u64_be(1000 + epoch),
        balances: vec![balance_at_epoch(epoch); validators.len()],
        validators,
        block_roots,
        previous_justified_checkpoint: justified_checkpoint(config, epoch.saturating_sub(1)),
        current_justified_checkpoint: justified_checkpoint(config, epoch),
        finalized_checkpoint: Checkpoint::default(),
        current_sync_committee,
        blocks: slots_in_epoch(config, epoch)
            .map(|slot| build_block(config, validator_count, slot))
            .collect(),
        duties: build_duties(config, validator_count, epoch),
    }
}

#[cfg(test)]
mod tests {
    use beacon_api::is_not_found;

    use super::*;

    fn minimal_chain() -> Chain {
        Chain::new(Arc::new(Config::minimal()), 16, 3)
    }

    #[test]
    fn states_are_terminal_and_chained() -> Result<()> {
        let chain = minimal_chain();
        let state = chain.state(2)?;

        assert_eq!(state.slot, 23);
        assert_eq!(state.blocks.len(), 8);
        assert_eq!(state.balances[0], VALIDATOR_BALANCE + BALANCE_GROWTH_PER_EPOCH);
        assert_eq!(state.current_justified_checkpoint.epoch, 1);
        assert_eq!(state.current_justified_checkpoint.root, block_root(8));
        assert_eq!(state.block_roots[22], block_root(22));
        assert!(state.current_sync_committee.is_none());

        Ok(())
    }

    #[test]
    fn every_validator_has_one_duty_per_epoch() -> Result<()> {
        let chain = minimal_chain();
        let duties = &chain.state(1)?.duties;

        assert_eq!(duties.attestation_slot(0), Some(8));
        assert_eq!(duties.attestation_slot(9), Some(9));
        assert_eq!(duties.proposer_duties().len(), 8);

        Ok(())
    }

    #[test]
    fn missed_blocks_pass_their_votes_on() -> Result<()> {
        let mut chain = minimal_chain();

        chain.miss_block(10)?;

        let state = chain.state(1)?;

        assert_eq!(state.missed_blocks().collect_vec(), [10]);
        assert_eq!(state.block_at_slot(11).map(|block| block.attestations.len()), Some(2));

        Ok(())
    }

    #[test]
    fn removed_votes_clear_committee_bits() -> Result<()> {
        let mut chain = minimal_chain();

        chain.remove_vote(9, 1)?;

        let attestation = &chain.state(1)?.blocks[2].attestations[0];

        assert_eq!(attestation.data.slot, 9);
        assert_eq!(attestation.aggregation_bits.count_ones(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn fetcher_hides_missed_blocks() -> Result<()> {
        let mut chain = minimal_chain();

        chain.miss_block(12)?;

        let fetcher = chain.fetcher();

        assert!(is_not_found(&fetcher.get_block(12).await.expect_err("slot 12 was missed")));
        assert!(fetcher.get_block(13).await?.proposed);
        assert!(fetcher.get_state(23).await?.blocks.is_empty());
        assert!(is_not_found(&fetcher.get_state(22).await.expect_err("not terminal")));

        Ok(())
    }
}
