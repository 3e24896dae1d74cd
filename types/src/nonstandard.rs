use enum_iterator::Sequence;
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use strum::{AsRefStr, Display, EnumString};

use crate::{
    altair::consts::{TIMELY_HEAD_FLAG_INDEX, TIMELY_SOURCE_FLAG_INDEX, TIMELY_TARGET_FLAG_INDEX},
    phase0::primitives::Gwei,
};

#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Sequence,
    AsRefStr,
    Display,
    EnumString,
    DeserializeFromStr,
    SerializeDisplay,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Phase {
    Phase0,
    Altair,
    Bellatrix,
    Capella,
    Deneb,
}

impl Phase {
    /// Reward accounting changed once, at Altair. Later forks reuse the Altair rules.
    #[must_use]
    pub const fn uses_participation_flags(self) -> bool {
        !matches!(self, Self::Phase0)
    }
}

#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Debug,
    AsRefStr,
    Display,
    EnumString,
    DeserializeFromStr,
    SerializeDisplay,
)]
#[strum(serialize_all = "snake_case")]
pub enum ValidatorStatus {
    InQueue,
    Active,
    Exited,
    Slashed,
}

/// Block reward breakdown as reported by a beacon node.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug, Deserialize, Serialize)]
pub struct BlockRewards {
    pub total: Gwei,
    pub attestations: Gwei,
    pub sync_aggregate: Gwei,
    pub proposer_slashings: Gwei,
    pub attester_slashings: Gwei,
}

impl BlockRewards {
    /// Part of the reported total that rewards the proposer for including votes.
    /// Slashing rewards are accounted for separately.
    #[must_use]
    pub const fn proposer_component(self) -> Gwei {
        self.total
            .saturating_sub(self.proposer_slashings)
            .saturating_sub(self.attester_slashings)
    }
}

/// Policy for choosing between a reported proposer reward and the one computed locally.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Debug,
    AsRefStr,
    Display,
    EnumString,
    DeserializeFromStr,
    SerializeDisplay,
)]
#[strum(serialize_all = "kebab-case")]
pub enum ExternalRewardPreference {
    /// Use the reported figure only when it is greater than zero.
    #[default]
    StrictlyPositive,
    /// Use the reported figure whenever one is present, including zero.
    WheneverReported,
}

impl ExternalRewardPreference {
    #[must_use]
    pub const fn resolve(self, reported: Option<Gwei>, computed: Gwei) -> Gwei {
        match (self, reported) {
            (Self::StrictlyPositive, Some(reported)) if reported > 0 => reported,
            (Self::WheneverReported, Some(reported)) => reported,
            _ => computed,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug, Deserialize, Serialize)]
pub struct ParticipationFlags([bool; 3]);

impl ParticipationFlags {
    #[must_use]
    pub const fn new(source: bool, target: bool, head: bool) -> Self {
        Self([source, target, head])
    }

    #[must_use]
    pub const fn get(self, flag_index: usize) -> bool {
        flag_index < self.0.len() && self.0[flag_index]
    }

    #[must_use]
    pub const fn source(self) -> bool {
        self.0[TIMELY_SOURCE_FLAG_INDEX]
    }

    #[must_use]
    pub const fn target(self) -> bool {
        self.0[TIMELY_TARGET_FLAG_INDEX]
    }

    #[must_use]
    pub const fn head(self) -> bool {
        self.0[TIMELY_HEAD_FLAG_INDEX]
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        !self.source() && !self.target() && !self.head()
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(ExternalRewardPreference::StrictlyPositive, None, 7 => 7)]
    #[test_case(ExternalRewardPreference::StrictlyPositive, Some(0), 7 => 7)]
    #[test_case(ExternalRewardPreference::StrictlyPositive, Some(9), 7 => 9)]
    #[test_case(ExternalRewardPreference::WheneverReported, None, 7 => 7)]
    #[test_case(ExternalRewardPreference::WheneverReported, Some(0), 7 => 0)]
    #[test_case(ExternalRewardPreference::WheneverReported, Some(9), 7 => 9)]
    fn external_reward_preference_resolves(
        preference: ExternalRewardPreference,
        reported: Option<Gwei>,
        computed: Gwei,
    ) -> Gwei {
        preference.resolve(reported, computed)
    }

    #[test]
    fn proposer_component_excludes_slashing_rewards() {
        let rewards = BlockRewards {
            total: 100,
            attestations: 60,
            sync_aggregate: 10,
            proposer_slashings: 20,
            attester_slashings: 10,
        };

        assert_eq!(rewards.proposer_component(), 70);
    }

    #[test]
    fn phase_names_parse_case_insensitively() {
        assert_eq!("ALTAIR".parse::<Phase>().ok(), Some(Phase::Altair));
        assert_eq!(Phase::Capella.as_ref(), "capella");
        assert!(!Phase::Phase0.uses_participation_flags());
        assert!(Phase::Deneb.uses_participation_flags());
    }
}
