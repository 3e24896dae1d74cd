use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use anyhow::{Error as AnyhowError, Result};
use helper_functions::{
    accessors::{
        active_validator_count, get_attesting_indices, get_block_root, get_block_root_at_slot,
        get_validator, total_active_balance, total_active_real_balance,
    },
    misc,
    predicates::{is_active_validator, slashing_intersection, validator_status},
};
use log::trace;
use serde::Serialize;
use types::{
    altair::consts::{TIMELY_HEAD_FLAG_INDEX, TIMELY_SOURCE_FLAG_INDEX, TIMELY_TARGET_FLAG_INDEX},
    config::Config,
    nonstandard::{ExternalRewardPreference, ParticipationFlags, Phase},
    phase0::{
        consts::GENESIS_EPOCH,
        containers::{AttestationData, Checkpoint},
        primitives::{Gwei, GweiDelta, Slot, ValidatorIndex, H256},
    },
    records::{
        AttestationRecord, BlockSummary, EpochSummary, ProposerDuty, ValidatorRewards,
        WithdrawalRecord,
    },
    snapshot::{AgnosticBlock, AgnosticState},
};

use crate::error::Error;

/// Three consecutive terminal snapshots: the epoch whose duties are rewarded, the epoch in which
/// those rewards are computed and the epoch in which they show up in balances.
#[derive(Clone, Debug)]
pub struct EpochWindow {
    pub prev: Arc<AgnosticState>,
    pub current: Arc<AgnosticState>,
    pub next: Arc<AgnosticState>,
}

impl EpochWindow {
    /// Blocks of the previous and current epochs in slot order.
    pub fn blocks_before_next(&self) -> impl Iterator<Item = &AgnosticBlock> {
        self.prev.blocks.iter().chain(&self.current.blocks)
    }

    #[must_use]
    pub fn block_at_slot(&self, slot: Slot) -> Option<&AgnosticBlock> {
        [&self.prev, &self.current, &self.next]
            .into_iter()
            .find_map(|state| state.block_at_slot(slot))
    }
}

/// Mutable per-block figures. Only the thread building the bundle writes them.
#[derive(Clone, Copy, Default, Debug, Serialize)]
pub struct BlockAccumulator {
    pub manual_reward: Gwei,
    pub votes_included: u64,
    pub new_votes_included: u64,
}

/// Validator credited with an attestation for the first time in the window.
#[derive(Clone, Copy, Debug)]
pub struct Credit {
    pub validator_index: ValidatorIndex,
    pub inclusion_slot: Slot,
    pub proposer_index: ValidatorIndex,
    pub inclusion_delay: u64,
    pub flags: ParticipationFlags,
}

/// Canonical roots an attestation is compared against.
#[derive(Clone, Copy, Debug)]
pub struct CanonicalVotes {
    pub source: Checkpoint,
    pub target: Checkpoint,
}

/// Whistleblower reward for one slashing report, split between the including proposer and the
/// whistleblower.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SlashingReward {
    pub proposer: Gwei,
    pub whistleblower: Gwei,
}

impl SlashingReward {
    #[must_use]
    pub fn split(whistleblower_reward: Gwei, proposer_share: impl FnOnce(Gwei) -> Gwei) -> Self {
        let proposer = proposer_share(whistleblower_reward);

        Self {
            proposer,
            whistleblower: whistleblower_reward.saturating_sub(proposer),
        }
    }
}

/// Maximum reward components of one validator.
#[derive(Clone, Copy, Default, Debug)]
pub struct RewardComponents {
    pub attester: Gwei,
    pub sync_committee: Gwei,
    pub proposer_api: Option<Gwei>,
    pub proposer_manual: Gwei,
    pub slashing: Gwei,
    pub base_reward: Gwei,
    pub in_sync_committee: bool,
}

/// Aggregation context shared by every fork variant.
pub struct MetricsBase {
    pub config: Arc<Config>,
    pub phase: Phase,
    pub preference: ExternalRewardPreference,
    pub window: EpochWindow,
    pub current_total_active_balance: Gwei,
    pub next_total_active_balance: Gwei,
    pub max_attester_rewards: Vec<Gwei>,
    pub max_proposer_rewards: HashMap<ValidatorIndex, Gwei>,
    pub max_slashing_rewards: HashMap<ValidatorIndex, Gwei>,
    pub inclusion_delays: Vec<Option<u64>>,
    pub participation: Vec<ParticipationFlags>,
    pub attesting_balance: [Gwei; 3],
    pub attestation_count: u64,
    pub block_accumulators: BTreeMap<Slot, BlockAccumulator>,
    /// Delay of the first proposed block after each duty slot of the previous epoch.
    pub inclusion_opportunities: HashMap<Slot, Option<u64>>,
}

impl MetricsBase {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        phase: Phase,
        preference: ExternalRewardPreference,
        window: EpochWindow,
    ) -> Self {
        let validator_count = window.next.validators.len();

        let block_accumulators = [&window.prev, &window.current, &window.next]
            .into_iter()
            .flat_map(|state| &state.blocks)
            .map(|block| (block.slot, BlockAccumulator::default()))
            .collect();

        Self {
            current_total_active_balance: total_active_balance(&config, &window.current),
            next_total_active_balance: total_active_balance(&config, &window.next),
            max_attester_rewards: vec![0; validator_count],
            max_proposer_rewards: HashMap::new(),
            max_slashing_rewards: HashMap::new(),
            inclusion_delays: vec![None; validator_count],
            participation: vec![ParticipationFlags::default(); validator_count],
            attesting_balance: [0; 3],
            attestation_count: 0,
            block_accumulators,
            inclusion_opportunities: HashMap::new(),
            config,
            phase,
            preference,
            window,
        }
    }

    /// Rewards are only defined once two non-empty snapshots precede the window's last one.
    /// No rewards exist at genesis.
    #[must_use]
    pub fn should_process(&self) -> bool {
        !self.window.prev.is_empty()
            && !self.window.current.is_empty()
            && self.window.current.epoch != GENESIS_EPOCH
    }

    pub fn position(&self, validator_index: ValidatorIndex) -> Result<usize> {
        usize::try_from(validator_index)
            .ok()
            .filter(|position| *position < self.max_attester_rewards.len())
            .ok_or_else(|| Error::ValidatorOutsideBundle { validator_index }.into())
    }

    /// Validators whose duties in the previous epoch are rewarded by this window.
    pub fn analysed_validators(&self) -> impl Iterator<Item = ValidatorIndex> + '_ {
        let epoch = self.window.prev.epoch;

        (0..)
            .zip(&self.window.next.validators)
            .filter(move |(_, validator)| is_active_validator(validator, epoch))
            .map(|(validator_index, _)| validator_index)
    }

    pub fn max_inclusion_delay(&self, flag_index: usize) -> Result<u64> {
        if self.phase.uses_participation_flags() {
            misc::max_inclusion_delay(&self.config, flag_index)
        } else {
            // Phase 0 rewards matching votes regardless of timeliness.
            Ok(self.config.slots_per_epoch.get())
        }
    }

    pub fn block_accumulator_mut(&mut self, slot: Slot) -> Result<&mut BlockAccumulator> {
        self.block_accumulators
            .get_mut(&slot)
            .ok_or_else(|| Error::BlockNotInWindow { slot }.into())
    }

    /// Evaluates participation flags of a vote. Each flag is only checked once the one before it
    /// was earned, so a head flag always implies target and source flags.
    pub fn participation_flags(
        &self,
        data: AttestationData,
        inclusion_delay: u64,
        canonical: CanonicalVotes,
        head_root: H256,
    ) -> Result<ParticipationFlags> {
        let source = data.source == canonical.source
            && inclusion_delay <= self.max_inclusion_delay(TIMELY_SOURCE_FLAG_INDEX)?;

        let target = source
            && data.target == canonical.target
            && inclusion_delay <= self.max_inclusion_delay(TIMELY_TARGET_FLAG_INDEX)?;

        let head = target
            && data.beacon_block_root == head_root
            && inclusion_delay <= self.max_inclusion_delay(TIMELY_HEAD_FLAG_INDEX)?;

        Ok(ParticipationFlags::new(source, target, head))
    }

    /// Walks votes for the previous epoch included in the previous and current epochs in
    /// ascending inclusion order. The first inclusion of a validator determines its delay and
    /// flags. Later inclusions of the same validator are counted but not credited.
    pub fn process_attestations(&mut self) -> Result<Vec<Credit>> {
        let config = Arc::clone(&self.config);
        let window = self.window.clone();
        let epoch = window.prev.epoch;

        let canonical = CanonicalVotes {
            source: window.prev.current_justified_checkpoint,
            target: Checkpoint {
                epoch,
                root: get_block_root(&config, &window.current, epoch)?,
            },
        };

        let mut blocks = window
            .blocks_before_next()
            .filter(|block| block.proposed)
            .collect::<Vec<_>>();

        blocks.sort_by_key(|block| block.slot);

        let mut credits = vec![];

        for block in blocks {
            for attestation in &block.attestations {
                let data = attestation.data;

                if misc::compute_epoch_at_slot(&config, data.slot) != epoch {
                    continue;
                }

                let Some(inclusion_delay) = block
                    .slot
                    .checked_sub(data.slot)
                    .filter(|delay| *delay > 0)
                else {
                    continue;
                };

                let head_root = get_block_root_at_slot(&config, &window.current, data.slot)?;
                let flags = self.participation_flags(data, inclusion_delay, canonical, head_root)?;
                let attesting_indices = get_attesting_indices(&window.prev.duties, attestation)?;

                self.attestation_count += 1;

                trace!(
                    "vote for slot {} included at slot {} by {} validators with {flags:?}",
                    data.slot,
                    block.slot,
                    attesting_indices.len(),
                );

                for validator_index in attesting_indices {
                    let position = self.position(validator_index)?;
                    let effective_balance =
                        get_validator(&window.current, validator_index)?.effective_balance;

                    self.block_accumulator_mut(block.slot)?.votes_included += 1;

                    if self.inclusion_delays[position].is_some() {
                        continue;
                    }

                    self.block_accumulator_mut(block.slot)?.new_votes_included += 1;
                    self.inclusion_delays[position] = Some(inclusion_delay);
                    self.participation[position] = flags;

                    for (flag_index, balance) in self.attesting_balance.iter_mut().enumerate() {
                        if flags.get(flag_index) {
                            *balance += effective_balance;
                        }
                    }

                    credits.push(Credit {
                        validator_index,
                        inclusion_slot: block.slot,
                        proposer_index: block.proposer_index,
                        inclusion_delay,
                        flags,
                    });
                }
            }
        }

        Ok(credits)
    }

    /// Credits slashing rewards for reports included in the next epoch.
    /// The whistleblower is always the including proposer.
    pub fn process_slashings(&mut self, proposer_share: impl Fn(Gwei) -> Gwei) -> Result<()> {
        let next = Arc::clone(&self.window.next);

        for block in next.blocks.iter().filter(|block| block.proposed) {
            let whistleblower_index = block.proposer_index;

            let slashed_indices = block
                .attester_slashings
                .iter()
                .flat_map(|slashing| {
                    slashing_intersection(
                        &slashing.attestation_1.attesting_indices,
                        &slashing.attestation_2.attesting_indices,
                    )
                })
                .chain(
                    block
                        .proposer_slashings
                        .iter()
                        .map(|slashing| slashing.header_1.proposer_index),
                );

            for slashed_index in slashed_indices {
                let effective_balance = get_validator(&next, slashed_index)?.effective_balance;
                let whistleblower_reward =
                    effective_balance / self.config.whistleblower_reward_quotient;
                let reward = SlashingReward::split(whistleblower_reward, &proposer_share);

                *self
                    .max_slashing_rewards
                    .entry(block.proposer_index)
                    .or_default() += reward.proposer;

                *self
                    .max_slashing_rewards
                    .entry(whistleblower_index)
                    .or_default() += reward.whistleblower;
            }
        }

        Ok(())
    }

    /// Looks up the first inclusion opportunity of every duty slot of the previous epoch.
    /// No flag or inclusion reward allows a delay longer than an epoch.
    pub fn index_inclusion_opportunities(&mut self) -> Result<()> {
        let max_delay = self.config.slots_per_epoch.get();

        let duty_slots = self
            .window
            .prev
            .duties
            .beacon_committees()
            .iter()
            .map(|committee| committee.slot)
            .collect::<BTreeSet<_>>();

        for slot in duty_slots {
            let delay = self.scan_inclusion_opportunity(slot, max_delay)?;
            self.inclusion_opportunities.insert(slot, delay);
        }

        trace!(
            "indexed inclusion opportunities of {} duty slots",
            self.inclusion_opportunities.len(),
        );

        Ok(())
    }

    /// Delay of the first proposed block within `max_delay` slots after `slot`.
    pub fn first_inclusion_opportunity(&self, slot: Slot, max_delay: u64) -> Result<Option<u64>> {
        let delay = match self.inclusion_opportunities.get(&slot) {
            Some(delay) => *delay,
            None => self.scan_inclusion_opportunity(slot, max_delay)?,
        };

        Ok(delay.filter(|delay| *delay <= max_delay))
    }

    fn scan_inclusion_opportunity(&self, slot: Slot, max_delay: u64) -> Result<Option<u64>> {
        for delay in 1..=max_delay {
            let inclusion_slot = slot + delay;

            let block = self
                .window
                .block_at_slot(inclusion_slot)
                .ok_or(Error::BlockNotInWindow {
                    slot: inclusion_slot,
                })?;

            if block.proposed {
                return Ok(Some(delay));
            }
        }

        Ok(None)
    }

    /// Whether any block was proposed early enough for the validator's vote to earn the flag.
    pub fn is_flag_possible(&self, validator_index: ValidatorIndex, flag_index: usize) -> Result<bool> {
        let Some(duty_slot) = self.window.prev.duties.attestation_slot(validator_index) else {
            return Ok(false);
        };

        let max_delay = self.max_inclusion_delay(flag_index)?;

        Ok(self
            .first_inclusion_opportunity(duty_slot, max_delay)?
            .is_some())
    }

    /// Balance change between the current and next snapshots with withdrawals added back.
    pub fn epoch_reward(&self, validator_index: ValidatorIndex) -> Result<GweiDelta> {
        let missing = || AnyhowError::from(Error::ValidatorOutsideBundle { validator_index });

        let next_balance = self
            .window
            .next
            .balance(validator_index)
            .ok_or_else(missing)?;

        // The genesis state has no predecessor to compare against.
        if self.window.current.is_empty() {
            return Ok(0);
        }

        let current_balance = self.window.current.balance(validator_index).unwrap_or(0);

        let withdrawn = self
            .window
            .next
            .blocks
            .iter()
            .flat_map(|block| &block.withdrawals)
            .filter(|withdrawal| withdrawal.validator_index == validator_index)
            .map(|withdrawal| withdrawal.amount)
            .sum::<Gwei>();

        let delta = i128::from(next_balance) - i128::from(current_balance) + i128::from(withdrawn);

        GweiDelta::try_from(delta).map_err(Into::into)
    }

    /// Reported and locally computed proposer rewards of `validator_index` over `blocks`.
    pub fn proposer_rewards<'blocks>(
        &self,
        validator_index: ValidatorIndex,
        blocks: impl IntoIterator<Item = &'blocks AgnosticBlock>,
    ) -> (Option<Gwei>, Gwei) {
        let mut api_reward = None;
        let mut manual_reward = 0;

        for block in blocks {
            if !block.proposed || block.proposer_index != validator_index {
                continue;
            }

            if let Some(reward) = block.reward {
                *api_reward.get_or_insert(0) += reward.proposer_component();
            }

            if let Some(accumulator) = self.block_accumulators.get(&block.slot) {
                manual_reward += accumulator.manual_reward;
            }
        }

        (api_reward, manual_reward)
    }

    #[must_use]
    pub fn inclusion_delay(&self, position: usize) -> u64 {
        self.inclusion_delays
            .get(position)
            .copied()
            .flatten()
            .unwrap_or_else(|| misc::missing_inclusion_delay(&self.config))
    }

    pub fn record(
        &self,
        validator_index: ValidatorIndex,
        components: RewardComponents,
    ) -> Result<ValidatorRewards> {
        let position = self.position(validator_index)?;
        let next = &self.window.next;
        let validator = get_validator(next, validator_index)?;
        let flags = self.participation[position];

        let proposer_reward = self
            .preference
            .resolve(components.proposer_api, components.proposer_manual);

        let max_reward = self.max_attester_rewards[position]
            + components.sync_committee
            + proposer_reward
            + components.slashing;

        Ok(ValidatorRewards {
            validator_index,
            epoch: next.epoch,
            slot: next.slot,
            validator_balance: next.balance(validator_index).unwrap_or(0),
            reward: self.epoch_reward(validator_index)?,
            max_reward,
            attestation_reward: components.attester,
            sync_committee_reward: components.sync_committee,
            proposer_reward,
            slashing_reward: components.slashing,
            base_reward: components.base_reward,
            missing_source: !flags.source(),
            missing_target: !flags.target(),
            missing_head: !flags.head(),
            status: validator_status(validator, next.epoch),
            proposer_api_reward: components.proposer_api,
            proposer_manual_reward: components.proposer_manual,
            in_sync_committee: components.in_sync_committee,
            inclusion_delay: self.inclusion_delay(position),
            pool_name: None,
        })
    }

    /// Participation summary of the previous epoch.
    #[must_use]
    pub fn epoch_summary(&self) -> EpochSummary {
        let prev = &self.window.prev;

        let (mut missing_source, mut missing_target, mut missing_head) = (0, 0, 0);
        let mut attesting_validators = 0;

        for validator_index in self.analysed_validators() {
            let Ok(position) = self.position(validator_index) else {
                continue;
            };

            let flags = self.participation[position];

            missing_source += u64::from(!flags.source());
            missing_target += u64::from(!flags.target());
            missing_head += u64::from(!flags.head());
            attesting_validators += u64::from(self.inclusion_delays[position].is_some());
        }

        EpochSummary {
            epoch: prev.epoch,
            slot: prev.slot,
            attestation_count: self.attestation_count,
            attesting_validators,
            active_validators: active_validator_count(prev),
            total_balance: total_active_real_balance(prev),
            attesting_target_balance: self.attesting_balance[TIMELY_TARGET_FLAG_INDEX],
            total_effective_balance: total_active_balance(&self.config, prev),
            missing_source,
            missing_target,
            missing_head,
            missed_blocks: prev.missed_blocks().collect(),
        }
    }

    /// Proposer assignments of the previous epoch with the outcome of each slot.
    #[must_use]
    pub fn proposer_duties(&self) -> Vec<ProposerDuty> {
        let prev = &self.window.prev;

        prev.duties
            .proposer_duties()
            .iter()
            .map(|duty| ProposerDuty {
                validator_index: duty.validator_index,
                slot: duty.slot,
                proposed: prev
                    .block_at_slot(duty.slot)
                    .is_none_or(|block| block.proposed),
            })
            .collect()
    }

    /// One row per slot of the previous epoch, missed slots included.
    #[must_use]
    pub fn block_summaries(&self) -> Vec<BlockSummary> {
        let prev = &self.window.prev;

        prev.blocks
            .iter()
            .map(|block| BlockSummary {
                epoch: prev.epoch,
                slot: block.slot,
                proposer_index: block.proposer_index,
                proposed: block.proposed,
                attestation_count: block.attestations.len() as u64,
                sync_committee_participants: block
                    .sync_aggregate
                    .as_ref()
                    .map_or(0, |aggregate| aggregate.participant_count()),
                proposer_slashings: block.proposer_slashings.len() as u64,
                attester_slashings: block.attester_slashings.len() as u64,
                withdrawal_count: block.withdrawals.len() as u64,
                withdrawn_amount: block
                    .withdrawals
                    .iter()
                    .map(|withdrawal| withdrawal.amount)
                    .sum(),
                reported_reward: block.reward.map(|reward| reward.total),
            })
            .collect()
    }

    /// Aggregates included in the blocks of the previous epoch.
    #[must_use]
    pub fn attestation_records(&self) -> Vec<AttestationRecord> {
        let prev = &self.window.prev;

        prev.blocks
            .iter()
            .flat_map(|block| {
                block.attestations.iter().map(|attestation| {
                    let data = attestation.data;

                    AttestationRecord {
                        epoch: prev.epoch,
                        slot: block.slot,
                        attestation_slot: data.slot,
                        committee_index: data.index,
                        beacon_block_root: data.beacon_block_root,
                        source_epoch: data.source.epoch,
                        source_root: data.source.root,
                        target_epoch: data.target.epoch,
                        target_root: data.target.root,
                        participants: attestation.aggregation_bits.count_ones() as u64,
                    }
                })
            })
            .collect()
    }

    /// Withdrawals processed by the blocks of the previous epoch.
    #[must_use]
    pub fn withdrawal_records(&self) -> Vec<WithdrawalRecord> {
        let prev = &self.window.prev;

        prev.blocks
            .iter()
            .flat_map(|block| {
                block.withdrawals.iter().map(|withdrawal| WithdrawalRecord {
                    epoch: prev.epoch,
                    slot: block.slot,
                    index: withdrawal.index,
                    validator_index: withdrawal.validator_index,
                    amount: withdrawal.amount,
                })
            })
            .collect()
    }
}
