use thiserror::Error;
use types::phase0::primitives::{CommitteeIndex, Slot, ValidatorIndex};

#[derive(Debug, Error)]
pub enum Error {
    #[error("aggregation bit {position} is outside committee {index} at slot {slot}")]
    AttesterNotInCommittee {
        slot: Slot,
        index: CommitteeIndex,
        position: usize,
    },
    #[error("no committee {index} at slot {slot}")]
    CommitteeNotFound { slot: Slot, index: CommitteeIndex },
    #[error("slot {slot} is outside the block roots kept by the state at slot {state_slot}")]
    SlotOutOfRange { slot: Slot, state_slot: Slot },
    #[error("unknown participation flag index {flag_index}")]
    UnknownFlagIndex { flag_index: usize },
    #[error("validator {validator_index} is not in the registry")]
    ValidatorNotFound { validator_index: ValidatorIndex },
}
