use serde::{Deserialize, Serialize};

use crate::phase0::primitives::{Gwei, ValidatorIndex, WithdrawalIndex};

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Withdrawal {
    pub index: WithdrawalIndex,
    pub validator_index: ValidatorIndex,
    pub amount: Gwei,
}
