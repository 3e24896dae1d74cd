use thiserror::Error;
use types::phase0::primitives::Slot;

#[derive(Debug, Error)]
pub enum Error {
    #[error("initial slot {init_slot} is after final slot {final_slot}")]
    InvalidSlotRange { init_slot: Slot, final_slot: Slot },
    #[error("at least one validator worker is required")]
    NoWorkers,
    #[error("writer batch size must be positive")]
    ZeroBatchSize,
    #[error("analysis was cancelled")]
    Cancelled,
}
