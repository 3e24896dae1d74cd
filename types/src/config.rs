use core::{num::NonZeroU64, time::Duration};
use std::borrow::Cow;

use nonzero_ext::nonzero;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use thiserror::Error;

use crate::{
    nonstandard::Phase,
    phase0::{
        consts::{FAR_FUTURE_EPOCH, GENESIS_EPOCH},
        primitives::{Epoch, UnixSeconds},
    },
};

/// Network profile consumed by the reward engine and the pipeline.
///
/// Values that differ between networks live here instead of in global constants.
/// Weights fixed by the protocol are in [`crate::altair::consts`] and [`crate::phase0::consts`].
///
/// The `*_fork_epoch` fields default to [`FAR_FUTURE_EPOCH`] for forks that are not scheduled.
#[expect(
    clippy::unsafe_derive_deserialize,
    reason = "A false positive triggered by `nonzero!`. \
             `Config` has no invariants beyond the ones encoded in its field types."
)]
#[expect(
    clippy::struct_field_names,
    reason = "config_name mirrors the name used in network configuration files"
)]
#[serde_as]
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Config {
    // Meta
    pub config_name: Cow<'static, str>,

    // Genesis
    pub genesis_time: UnixSeconds,

    // Forking
    pub altair_fork_epoch: Epoch,
    pub bellatrix_fork_epoch: Epoch,
    pub capella_fork_epoch: Epoch,
    pub deneb_fork_epoch: Epoch,

    // Time parameters
    pub slots_per_epoch: NonZeroU64,
    pub slots_per_historical_root: NonZeroU64,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub slot_duration: Duration,
    pub min_inclusion_delay: NonZeroU64,

    // Rewards and penalties
    pub base_reward_factor: u64,
    pub effective_balance_increment: NonZeroU64,
    pub proposer_reward_quotient: NonZeroU64,
    pub whistleblower_reward_quotient: NonZeroU64,

    // Sync committee
    pub sync_committee_size: NonZeroU64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Use `default` so that custom profiles are never mistaken for mainnet.
            config_name: Cow::Borrowed("default"),

            genesis_time: 1_606_824_023,

            altair_fork_epoch: FAR_FUTURE_EPOCH,
            bellatrix_fork_epoch: FAR_FUTURE_EPOCH,
            capella_fork_epoch: FAR_FUTURE_EPOCH,
            deneb_fork_epoch: FAR_FUTURE_EPOCH,

            slots_per_epoch: nonzero!(32_u64),
            slots_per_historical_root: nonzero!(8192_u64),
            slot_duration: Duration::from_secs(12),
            min_inclusion_delay: nonzero!(1_u64),

            base_reward_factor: 64,
            effective_balance_increment: nonzero!(1_000_000_000_u64),
            proposer_reward_quotient: nonzero!(8_u64),
            whistleblower_reward_quotient: nonzero!(512_u64),

            sync_committee_size: nonzero!(512_u64),
        }
    }
}

impl Config {
    #[must_use]
    pub fn mainnet() -> Self {
        Self {
            config_name: Cow::Borrowed("mainnet"),
            genesis_time: 1_606_824_023,
            altair_fork_epoch: 74_240,
            bellatrix_fork_epoch: 144_896,
            capella_fork_epoch: 194_048,
            deneb_fork_epoch: 269_568,
            ..Self::default()
        }
    }

    /// Gnosis Chain runs with shorter epochs and a lower base reward factor.
    #[must_use]
    pub fn gnosis() -> Self {
        Self {
            config_name: Cow::Borrowed("gnosis"),
            genesis_time: 1_638_968_400,
            altair_fork_epoch: 512,
            bellatrix_fork_epoch: 385_536,
            capella_fork_epoch: 648_704,
            deneb_fork_epoch: 889_856,
            slots_per_epoch: nonzero!(16_u64),
            slot_duration: Duration::from_secs(5),
            base_reward_factor: 25,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn sepolia() -> Self {
        Self {
            config_name: Cow::Borrowed("sepolia"),
            genesis_time: 1_655_733_600,
            altair_fork_epoch: 50,
            bellatrix_fork_epoch: 100,
            capella_fork_epoch: 56_832,
            deneb_fork_epoch: 132_608,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn holesky() -> Self {
        Self {
            config_name: Cow::Borrowed("holesky"),
            genesis_time: 1_695_902_400,
            altair_fork_epoch: 0,
            bellatrix_fork_epoch: 0,
            capella_fork_epoch: 256,
            deneb_fork_epoch: 29_696,
            ..Self::default()
        }
    }

    /// Small profile used in tests. No forks are scheduled.
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            config_name: Cow::Borrowed("minimal"),
            genesis_time: 1_578_009_600,
            slots_per_epoch: nonzero!(8_u64),
            slots_per_historical_root: nonzero!(64_u64),
            slot_duration: Duration::from_secs(6),
            sync_committee_size: nonzero!(32_u64),
            ..Self::default()
        }
    }

    /// Looks up a predefined profile by its `config_name`.
    #[must_use]
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "mainnet" => Some(Self::mainnet()),
            "gnosis" => Some(Self::gnosis()),
            "sepolia" => Some(Self::sepolia()),
            "holesky" => Some(Self::holesky()),
            "minimal" => Some(Self::minimal()),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.config_name.is_empty() {
            return Err(Error::NameEmpty);
        }

        for character in self.config_name.chars() {
            if !matches!(character, 'a'..='z' | '0'..='9' | '-') {
                return Err(Error::NameContainsIllegalCharacters);
            }
        }

        let fork_epochs = self.fork_epochs().map(|(_, epoch)| epoch);

        if !fork_epochs.is_sorted() {
            return Err(Error::ForkEpochsOutOfOrder);
        }

        Ok(())
    }

    #[inline]
    #[must_use]
    pub const fn fork_epoch(&self, phase: Phase) -> Epoch {
        match phase {
            Phase::Phase0 => GENESIS_EPOCH,
            Phase::Altair => self.altair_fork_epoch,
            Phase::Bellatrix => self.bellatrix_fork_epoch,
            Phase::Capella => self.capella_fork_epoch,
            Phase::Deneb => self.deneb_fork_epoch,
        }
    }

    #[must_use]
    pub fn phase_at_epoch(&self, epoch: Epoch) -> Phase {
        self.fork_epochs()
            .take_while(|(_, fork_epoch)| *fork_epoch <= epoch)
            .map(|(phase, _)| phase)
            .last()
            .unwrap_or(Phase::Phase0)
    }

    fn fork_epochs(&self) -> impl Iterator<Item = (Phase, Epoch)> + '_ {
        enum_iterator::all::<Phase>().map(|phase| (phase, self.fork_epoch(phase)))
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration name is empty")]
    NameEmpty,
    #[error("configuration name contains illegal characters")]
    NameContainsIllegalCharacters,
    #[error("fork epochs are not in ascending order")]
    ForkEpochsOutOfOrder,
}

#[expect(
    clippy::needless_pass_by_value,
    reason = "Refactoring worsens readability, which is more important in tests."
)]
