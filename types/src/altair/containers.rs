use bitvec::{order::Lsb0, vec::BitVec};
use serde::{Deserialize, Serialize};

use crate::phase0::primitives::PublicKeyBytes;

pub type SyncCommitteeBits = BitVec<u8, Lsb0>;

#[derive(Clone, PartialEq, Eq, Default, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SyncAggregate {
    pub sync_committee_bits: SyncCommitteeBits,
}

impl SyncAggregate {
    #[must_use]
    pub fn participant_count(&self) -> u64 {
        self.sync_committee_bits.count_ones() as u64
    }
}

/// Public keys of the current sync committee, one entry per seat.
/// A validator may occupy more than one seat.
#[derive(Clone, PartialEq, Eq, Default, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SyncCommittee {
    pub pubkeys: Vec<PublicKeyBytes>,
}
