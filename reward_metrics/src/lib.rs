//! Fork-aware reward accounting over a window of three epoch snapshots.
//!
//! A bundle is built in two phases: [`RewardMetrics::init_bundle`] allocates per-validator
//! accumulators and [`RewardMetrics::pre_process_bundle`] runs the reward passes. After that the
//! bundle is frozen and shared with any number of readers through [`RewardMetrics::get_max_reward`].

use std::sync::Arc;

use anyhow::Result;
use log::debug;
use types::{
    config::Config,
    nonstandard::ExternalRewardPreference,
    phase0::primitives::ValidatorIndex,
    records::ValidatorRewards,
};

pub use crate::{
    altair::AltairMetrics,
    base::{BlockAccumulator, EpochWindow, MetricsBase, SlashingReward},
    error::Error,
    phase0::Phase0Metrics,
};

mod altair;
mod base;
mod error;
mod phase0;

pub trait RewardMetrics: Send + Sync {
    fn init_bundle(
        config: Arc<Config>,
        window: EpochWindow,
        preference: ExternalRewardPreference,
    ) -> Self
    where
        Self: Sized;

    fn pre_process_bundle(&mut self) -> Result<()>;

    fn get_max_reward(&self, validator_index: ValidatorIndex) -> Result<ValidatorRewards>;

    fn get_metrics_base(&self) -> &MetricsBase;
}

/// Builds and freezes the bundle for a window using the rules of the fork active in the
/// window's current epoch.
pub fn build_bundle(
    config: &Arc<Config>,
    window: EpochWindow,
    preference: ExternalRewardPreference,
) -> Result<Arc<dyn RewardMetrics>> {
    let phase = config.phase_at_epoch(window.current.epoch);

    debug!(
        "building {phase} metrics bundle for epochs {}..={}",
        window.prev.epoch, window.next.epoch,
    );

    if phase.uses_participation_flags() {
        build::<AltairMetrics>(config, window, preference)
    } else {
        build::<Phase0Metrics>(config, window, preference)
    }
}

fn build<M: RewardMetrics + 'static>(
    config: &Arc<Config>,
    window: EpochWindow,
    preference: ExternalRewardPreference,
) -> Result<Arc<dyn RewardMetrics>> {
    let mut metrics = M::init_bundle(Arc::clone(config), window, preference);
    metrics.pre_process_bundle()?;
    Ok(Arc::new(metrics))
}
