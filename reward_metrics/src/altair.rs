use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::Result;
use helper_functions::{
    accessors::{
        compute_base_reward, get_attesting_indices, get_base_reward_per_increment,
        get_block_root, get_block_root_at_slot, get_validator,
    },
    misc::compute_epoch_at_slot,
};
use log::debug;
use types::{
    altair::consts::{PARTICIPATION_FLAG_WEIGHTS, PROPOSER_WEIGHT, SYNC_REWARD_WEIGHT, WEIGHT_DENOMINATOR},
    config::Config,
    nonstandard::{ExternalRewardPreference, ParticipationFlags, Phase},
    phase0::{
        containers::Checkpoint,
        primitives::{Epoch, Gwei, PublicKeyBytes, ValidatorIndex},
    },
    records::ValidatorRewards,
};

use crate::{
    base::{CanonicalVotes, EpochWindow, MetricsBase, RewardComponents},
    error::Error,
    RewardMetrics,
};

/// Reward accounting from Altair onwards: participation flags, sync committee rewards and
/// proposer rewards derived from both.
pub struct AltairMetrics {
    base: MetricsBase,
    max_sync_committee_rewards: HashMap<ValidatorIndex, Gwei>,
    sync_committee_members: HashSet<ValidatorIndex>,
}

impl AltairMetrics {
    fn base_reward(&self, validator_index: ValidatorIndex, total_active_balance: Gwei) -> Result<Gwei> {
        let config = &self.base.config;
        let effective_balance =
            get_validator(&self.base.window.next, validator_index)?.effective_balance;

        Ok(compute_base_reward(
            config,
            effective_balance,
            get_base_reward_per_increment(config, total_active_balance),
        ))
    }

    /// Reward of one sync committee seat for one slot with full participation.
    fn sync_participant_reward(&self) -> Gwei {
        let config = &self.base.config;
        let total_active_balance = self.base.next_total_active_balance;
        let total_active_increments = total_active_balance / config.effective_balance_increment;
        let total_base_rewards =
            get_base_reward_per_increment(config, total_active_balance) * total_active_increments;

        let max_participant_rewards = total_base_rewards * SYNC_REWARD_WEIGHT
            / WEIGHT_DENOMINATOR
            / config.slots_per_epoch;

        max_participant_rewards / config.sync_committee_size
    }

    fn process_sync_aggregates(&mut self) -> Result<()> {
        let participant_reward = self.sync_participant_reward();
        let proposer_reward_per_bit =
            participant_reward * PROPOSER_WEIGHT / (WEIGHT_DENOMINATOR.get() - PROPOSER_WEIGHT);

        let next = Arc::clone(&self.base.window.next);

        for block in next.blocks.iter().filter(|block| block.proposed) {
            let Some(sync_aggregate) = &block.sync_aggregate else {
                continue;
            };

            let proposer_reward = proposer_reward_per_bit * sync_aggregate.participant_count();

            *self
                .base
                .max_proposer_rewards
                .entry(block.proposer_index)
                .or_default() += proposer_reward;

            self.base.block_accumulator_mut(block.slot)?.manual_reward += proposer_reward;
        }

        Ok(())
    }

    /// Proposer rewards for votes included in the next epoch, computed the way
    /// `process_attestation` does it for each attestation.
    fn process_included_votes(&mut self) -> Result<()> {
        let config = Arc::clone(&self.base.config);
        let window = self.base.window.clone();
        let (current, next) = (&window.current, &window.next);
        let total_active_balance = self.base.next_total_active_balance;

        let proposer_reward_denominator = (WEIGHT_DENOMINATOR.get() - PROPOSER_WEIGHT)
            * WEIGHT_DENOMINATOR.get()
            / PROPOSER_WEIGHT;

        let mut earned = HashMap::<(Epoch, ValidatorIndex), ParticipationFlags>::new();

        for block in next.blocks.iter().filter(|block| block.proposed) {
            for attestation in &block.attestations {
                let data = attestation.data;
                let epoch = compute_epoch_at_slot(&config, data.slot);

                let (duties, source) = if epoch == current.epoch {
                    (&current.duties, current.current_justified_checkpoint)
                } else if epoch == next.epoch {
                    (&next.duties, next.current_justified_checkpoint)
                } else {
                    continue;
                };

                let Some(inclusion_delay) = block
                    .slot
                    .checked_sub(data.slot)
                    .filter(|delay| *delay > 0)
                else {
                    continue;
                };

                let canonical = CanonicalVotes {
                    source,
                    target: Checkpoint {
                        epoch,
                        root: get_block_root(&config, next, epoch)?,
                    },
                };

                let head_root = get_block_root_at_slot(&config, next, data.slot)?;
                let flags =
                    self.base
                        .participation_flags(data, inclusion_delay, canonical, head_root)?;

                let mut proposer_reward_numerator = 0;

                for validator_index in get_attesting_indices(duties, attestation)? {
                    let earned_before = earned.entry((epoch, validator_index)).or_default();
                    let mut new_vote = false;
                    let mut combined = [
                        earned_before.source(),
                        earned_before.target(),
                        earned_before.head(),
                    ];

                    for (flag_index, weight) in PARTICIPATION_FLAG_WEIGHTS {
                        if flags.get(flag_index) && !combined[flag_index] {
                            combined[flag_index] = true;
                            new_vote = true;
                            proposer_reward_numerator +=
                                self.base_reward(validator_index, total_active_balance)? * weight;
                        }
                    }

                    *earned_before = ParticipationFlags::new(combined[0], combined[1], combined[2]);

                    let accumulator = self.base.block_accumulator_mut(block.slot)?;
                    accumulator.votes_included += 1;
                    accumulator.new_votes_included += u64::from(new_vote);
                }

                let proposer_reward = proposer_reward_numerator / proposer_reward_denominator;

                *self
                    .base
                    .max_proposer_rewards
                    .entry(block.proposer_index)
                    .or_default() += proposer_reward;

                self.base.block_accumulator_mut(block.slot)?.manual_reward += proposer_reward;
            }
        }

        Ok(())
    }

    // weight * base_reward * attesting_increments / (total_active_increments * WEIGHT_DENOMINATOR)
    fn process_max_flag_rewards(&mut self) -> Result<()> {
        let config = Arc::clone(&self.base.config);
        let increment = config.effective_balance_increment;
        let total_active_balance = self.base.current_total_active_balance;
        let total_active_increments = total_active_balance / increment;
        let base_reward_per_increment = get_base_reward_per_increment(&config, total_active_balance);
        let validators = self.base.analysed_validators().collect::<Vec<_>>();

        for validator_index in validators {
            let position = self.base.position(validator_index)?;
            let effective_balance =
                get_validator(&self.base.window.current, validator_index)?.effective_balance;
            let base_reward =
                compute_base_reward(&config, effective_balance, base_reward_per_increment);

            let mut max_reward = 0;

            for (flag_index, weight) in PARTICIPATION_FLAG_WEIGHTS {
                if !self.base.is_flag_possible(validator_index, flag_index)? {
                    continue;
                }

                let attesting_increments = self.base.attesting_balance[flag_index] / increment;
                let numerator = weight * base_reward * attesting_increments;
                let denominator = total_active_increments * WEIGHT_DENOMINATOR.get();

                max_reward += numerator / denominator;
            }

            self.base.max_attester_rewards[position] += max_reward;
        }

        Ok(())
    }

    /// Every seat earns the participant reward for each slot that was not missed.
    fn process_max_sync_committee_rewards(&mut self) -> Result<()> {
        let next = Arc::clone(&self.base.window.next);

        let Some(sync_committee) = &next.current_sync_committee else {
            return Ok(());
        };

        let registry = (0..)
            .zip(&next.validators)
            .map(|(validator_index, validator)| (validator.pubkey, validator_index))
            .collect::<HashMap<PublicKeyBytes, ValidatorIndex>>();

        let missed_blocks = next.missed_blocks().count() as u64;
        let rewarded_slots = self
            .base
            .config
            .slots_per_epoch
            .get()
            .saturating_sub(missed_blocks);
        let seat_reward = self.sync_participant_reward() * rewarded_slots;

        for pubkey in &sync_committee.pubkeys {
            let validator_index = *registry
                .get(pubkey)
                .ok_or(Error::SyncCommitteeMemberNotFound { pubkey: *pubkey })?;

            *self
                .max_sync_committee_rewards
                .entry(validator_index)
                .or_default() += seat_reward;

            self.sync_committee_members.insert(validator_index);
        }

        Ok(())
    }
}

/// Part of a whistleblower reward that goes to the including proposer.
#[must_use]
pub fn proposer_share(whistleblower_reward: Gwei) -> Gwei {
    whistleblower_reward * PROPOSER_WEIGHT / WEIGHT_DENOMINATOR
}

impl RewardMetrics for AltairMetrics {
    fn init_bundle(
        config: Arc<Config>,
        window: EpochWindow,
        preference: ExternalRewardPreference,
    ) -> Self {
        let phase = config.phase_at_epoch(window.current.epoch);

        Self {
            base: MetricsBase::new(config, phase.max(Phase::Altair), preference, window),
            max_sync_committee_rewards: HashMap::new(),
            sync_committee_members: HashSet::new(),
        }
    }

    fn pre_process_bundle(&mut self) -> Result<()> {
        if !self.base.should_process() {
            debug!(
                "skipping reward passes for window ending in epoch {}",
                self.base.window.next.epoch,
            );
            return Ok(());
        }

        self.base.process_slashings(proposer_share)?;

        self.process_sync_aggregates()?;
        self.base.index_inclusion_opportunities()?;
        self.base.process_attestations()?;
        self.process_included_votes()?;
        self.process_max_flag_rewards()?;
        self.process_max_sync_committee_rewards()
    }

    fn get_max_reward(&self, validator_index: ValidatorIndex) -> Result<ValidatorRewards> {
        let position = self.base.position(validator_index)?;

        let (proposer_api, proposer_manual) = self
            .base
            .proposer_rewards(validator_index, &self.base.window.next.blocks);

        let components = RewardComponents {
            attester: self.base.max_attester_rewards[position],
            sync_committee: self
                .max_sync_committee_rewards
                .get(&validator_index)
                .copied()
                .unwrap_or_default(),
            proposer_api,
            proposer_manual,
            slashing: self
                .base
                .max_slashing_rewards
                .get(&validator_index)
                .copied()
                .unwrap_or_default(),
            base_reward: self
                .base_reward(validator_index, self.base.next_total_active_balance)
                .unwrap_or_default(),
            in_sync_committee: self.sync_committee_members.contains(&validator_index),
        };

        self.base.record(validator_index, components)
    }

    fn get_metrics_base(&self) -> &MetricsBase {
        &self.base
    }
}
