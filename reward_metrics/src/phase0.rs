use std::sync::Arc;

use anyhow::Result;
use helper_functions::accessors::{get_phase0_base_reward, get_validator};
use log::debug;
use types::{
    config::Config,
    nonstandard::{ExternalRewardPreference, Phase},
    phase0::primitives::{Gwei, ValidatorIndex},
    records::ValidatorRewards,
};

use crate::{
    base::{EpochWindow, MetricsBase, RewardComponents},
    RewardMetrics,
};

/// Reward accounting before Altair: attestations are rewarded per matching vote, with an extra
/// component that decays with inclusion delay and a share for the including proposer.
pub struct Phase0Metrics {
    base: MetricsBase,
}

impl Phase0Metrics {
    fn base_reward(&self, validator_index: ValidatorIndex) -> Result<Gwei> {
        let effective_balance =
            get_validator(&self.base.window.current, validator_index)?.effective_balance;

        Ok(get_phase0_base_reward(
            &self.base.config,
            effective_balance,
            self.base.current_total_active_balance,
        ))
    }

    fn proposer_reward(&self, validator_index: ValidatorIndex) -> Result<Gwei> {
        Ok(self.base_reward(validator_index)? / self.base.config.proposer_reward_quotient)
    }

    fn process_inclusion_delays(&mut self) -> Result<()> {
        let credits = self.base.process_attestations()?;

        for credit in credits {
            if !credit.flags.source() {
                continue;
            }

            let proposer_reward = self.proposer_reward(credit.validator_index)?;

            *self
                .base
                .max_proposer_rewards
                .entry(credit.proposer_index)
                .or_default() += proposer_reward;

            self.base
                .block_accumulator_mut(credit.inclusion_slot)?
                .manual_reward += proposer_reward;
        }

        Ok(())
    }

    fn process_max_attester_rewards(&mut self) -> Result<()> {
        let increment = self.base.config.effective_balance_increment;
        let total_increments = self.base.current_total_active_balance / increment;
        let validators = self.base.analysed_validators().collect::<Vec<_>>();

        for validator_index in validators {
            let position = self.base.position(validator_index)?;
            let base_reward = self.base_reward(validator_index)?;
            let mut max_reward = 0;

            for (flag_index, attesting_balance) in self.base.attesting_balance.into_iter().enumerate()
            {
                if !self.base.is_flag_possible(validator_index, flag_index)? {
                    continue;
                }

                max_reward += base_reward * (attesting_balance / increment) / total_increments;
            }

            if let Some(duty_slot) = self.base.window.prev.duties.attestation_slot(validator_index) {
                let max_delay = self.base.config.slots_per_epoch.get();

                if let Some(best_delay) =
                    self.base.first_inclusion_opportunity(duty_slot, max_delay)?
                {
                    let proposer_reward = base_reward / self.base.config.proposer_reward_quotient;
                    max_reward += (base_reward - proposer_reward) / best_delay;
                }
            }

            self.base.max_attester_rewards[position] += max_reward;
        }

        Ok(())
    }
}

/// Part of a whistleblower reward that goes to the including proposer.
#[must_use]
pub fn proposer_share(config: &Config, whistleblower_reward: Gwei) -> Gwei {
    whistleblower_reward / config.proposer_reward_quotient
}

impl RewardMetrics for Phase0Metrics {
    fn init_bundle(
        config: Arc<Config>,
        window: EpochWindow,
        preference: ExternalRewardPreference,
    ) -> Self {
        Self {
            base: MetricsBase::new(config, Phase::Phase0, preference, window),
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

        let config = Arc::clone(&self.base.config);

        self.base
            .process_slashings(|whistleblower_reward| proposer_share(&config, whistleblower_reward))?;

        self.base.index_inclusion_opportunities()?;
        self.process_inclusion_delays()?;
        self.process_max_attester_rewards()
    }

    fn get_max_reward(&self, validator_index: ValidatorIndex) -> Result<ValidatorRewards> {
        let position = self.base.position(validator_index)?;

        let (proposer_api, proposer_manual) = self
            .base
            .proposer_rewards(validator_index, self.base.window.blocks_before_next());

        let components = RewardComponents {
            attester: self.base.max_attester_rewards[position],
            sync_committee: 0,
            proposer_api,
            proposer_manual,
            slashing: self
                .base
                .max_slashing_rewards
                .get(&validator_index)
                .copied()
                .unwrap_or_default(),
            base_reward: self.base_reward(validator_index).unwrap_or_default(),
            in_sync_committee: false,
        };

        self.base.record(validator_index, components)
    }

    fn get_metrics_base(&self) -> &MetricsBase {
        &self.base
    }
}
