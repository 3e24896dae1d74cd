use thiserror::Error;
use types::phase0::primitives::{PublicKeyBytes, Slot, ValidatorIndex};

#[derive(Debug, Error)]
pub enum Error {
    #[error("slot {slot} has no block summary in the epoch window")]
    BlockNotInWindow { slot: Slot },
    #[error("sync committee member {pubkey:?} is not in the registry")]
    SyncCommitteeMemberNotFound { pubkey: PublicKeyBytes },
    #[error("validator {validator_index} is not covered by the metrics bundle")]
    ValidatorOutsideBundle { validator_index: ValidatorIndex },
}
