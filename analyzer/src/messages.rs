use std::sync::Arc;

use reward_metrics::{EpochWindow, RewardMetrics};
use types::{
    phase0::primitives::{Slot, ValidatorIndex},
    records::{Row, Table},
};

pub struct EpochTask {
    pub window: EpochWindow,
    /// Whether the previous epoch was finalized when the next snapshot was taken.
    pub finalized: bool,
}

pub struct ValidatorTask {
    pub validator_indices: Vec<ValidatorIndex>,
    pub bundle: Arc<dyn RewardMetrics>,
    pub pool_name: Option<String>,
}

#[derive(Debug)]
pub enum WriterMessage {
    Row(Row),
    DeleteForSlot { table: Table, slot: Slot },
}
