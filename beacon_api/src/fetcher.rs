use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use types::{
    nonstandard::BlockRewards,
    phase0::primitives::{Epoch, Slot},
    snapshot::{AgnosticBlock, AgnosticState, EpochDuties},
};

/// Source of raw chain data.
///
/// Implementations must report absent data with [`FetchError::NotFound`] so that callers can tell
/// an empty slot apart from a failed request.
///
/// [`FetchError::NotFound`]: crate::FetchError::NotFound
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn get_block(&self, slot: Slot) -> Result<AgnosticBlock>;

    /// State after processing `slot`. Blocks and duties are attached by the caller.
    async fn get_state(&self, slot: Slot) -> Result<AgnosticState>;

    async fn get_committees_and_duties(&self, epoch: Epoch) -> Result<EpochDuties>;

    async fn get_block_reward_report(&self, slot: Slot) -> Result<BlockRewards>;
}

#[async_trait]
impl<F: Fetcher + ?Sized> Fetcher for Arc<F> {
    async fn get_block(&self, slot: Slot) -> Result<AgnosticBlock> {
        self.as_ref().get_block(slot).await
    }

    async fn get_state(&self, slot: Slot) -> Result<AgnosticState> {
        self.as_ref().get_state(slot).await
    }

    async fn get_committees_and_duties(&self, epoch: Epoch) -> Result<EpochDuties> {
        self.as_ref().get_committees_and_duties(epoch).await
    }

    async fn get_block_reward_report(&self, slot: Slot) -> Result<BlockRewards> {
        self.as_ref().get_block_reward_report(slot).await
    }
}
