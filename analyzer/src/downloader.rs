use core::{future::Future, time::Duration};
use std::{collections::VecDeque, sync::Arc};

use anyhow::{anyhow, Result};
use beacon_api::{found, is_not_found, Fetcher, Resource};
use futures::future::try_join_all;
use helper_functions::misc::{compute_terminal_slot_at_epoch, slots_in_epoch};
use itertools::Itertools as _;
use log::{debug, trace};
use logging::{info_with_progress, warn_with_progress, PROGRESS_LOG_METRICS};
use reward_metrics::EpochWindow;
use state_cache::{Error as StateCacheError, StateCache};
use tokio::{select, sync::mpsc::Sender, time::sleep};
use tokio_util::sync::CancellationToken;
use types::{
    config::Config,
    phase0::{
        consts::{GENESIS_EPOCH, GENESIS_SLOT},
        primitives::{Epoch, Slot},
    },
    snapshot::{AgnosticBlock, AgnosticState, EpochDuties},
};

use crate::{config::AnalyzerConfig, messages::EpochTask, slot_range::SlotRange};

const WINDOW_LENGTH: usize = 3;

/// Fetches terminal snapshots of every epoch in the range and turns them into epoch tasks.
///
/// Snapshots are fetched ahead into the state cache while a second loop takes them out in slot
/// order and slides a three snapshot window over them. A snapshot that cannot be fetched makes
/// every window containing it unavailable. Those windows are reported back as abandoned.
pub struct Downloader<F> {
    config: Arc<Config>,
    range: SlotRange,
    fetch_retries: u32,
    fetch_retry_delay: Duration,
    fetcher: F,
    cache: Arc<StateCache>,
    epoch_tx: Sender<EpochTask>,
    cancel: CancellationToken,
}

impl<F: Fetcher> Downloader<F> {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        range: SlotRange,
        analyzer_config: &AnalyzerConfig,
        fetcher: F,
        cache: Arc<StateCache>,
        epoch_tx: Sender<EpochTask>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            range,
            fetch_retries: analyzer_config.state_fetch_retries,
            fetch_retry_delay: analyzer_config.state_fetch_retry_delay,
            fetcher,
            cache,
            epoch_tx,
            cancel,
        }
    }

    /// Returns the last epochs of the windows that could not be built.
    pub async fn run(self) -> Result<Vec<Epoch>> {
        let ((), abandoned_windows) =
            tokio::try_join!(self.fetch_snapshots(), self.assemble_windows())?;

        info_with_progress!(
            "downloader finished (epochs {:?}, {} windows abandoned)",
            self.range.download_epochs(),
            abandoned_windows.len(),
        );

        Ok(abandoned_windows)
    }

    async fn fetch_snapshots(&self) -> Result<()> {
        for epoch in self.range.download_epochs() {
            let slot = compute_terminal_slot_at_epoch(&self.config, epoch);

            let snapshot = select! {
                snapshot = self.download_snapshot(epoch, slot) => snapshot,
                () = self.cancel.cancelled() => return Ok(()),
            };

            match snapshot {
                Ok(snapshot) => {
                    let result = select! {
                        result = self.cache.insert(Arc::new(snapshot)) => result,
                        () = self.cancel.cancelled() => return Ok(()),
                    };

                    if let Err(error) = result {
                        return match error.downcast_ref() {
                            Some(StateCacheError::CacheClosed) => Ok(()),
                            _ => Err(error),
                        };
                    }
                }
                Err(error) => {
                    warn_with_progress!("failed to download snapshot of epoch {epoch}: {error:?}");
                    self.cache.mark_unavailable(slot);
                }
            }
        }

        Ok(())
    }

    async fn assemble_windows(&self) -> Result<Vec<Epoch>> {
        let placeholder = Arc::new(AgnosticState::empty(GENESIS_EPOCH, GENESIS_SLOT));

        let mut history = (0..self.range.pre_genesis_epochs())
            .map(|_| Some(Arc::clone(&placeholder)))
            .collect::<VecDeque<_>>();

        let mut abandoned_windows = vec![];

        for epoch in self.range.download_epochs() {
            let slot = compute_terminal_slot_at_epoch(&self.config, epoch);

            let result = select! {
                result = self.cache.wait(slot) => result,
                () = self.cancel.cancelled() => break,
            };

            let snapshot = match result {
                Ok(snapshot) => Some(snapshot),
                Err(error) => match error.downcast_ref() {
                    Some(StateCacheError::StateUnavailable { .. }) => None,
                    Some(StateCacheError::CacheClosed) => break,
                    None => return Err(error),
                },
            };

            history.push_back(snapshot);

            while history.len() > WINDOW_LENGTH {
                history.pop_front();
            }

            if !self.range.window_epochs().contains(&epoch) {
                continue;
            }

            let Some((Some(prev), Some(current), Some(next))) =
                history.iter().cloned().collect_tuple()
            else {
                warn_with_progress!("abandoning window of epoch {epoch}: it is incomplete");
                abandoned_windows.push(epoch);
                PROGRESS_LOG_METRICS.increment_processed_epoch_count();
                continue;
            };

            let task = EpochTask {
                finalized: next.finalized_checkpoint.epoch >= prev.epoch,
                window: EpochWindow {
                    prev,
                    current,
                    next,
                },
            };

            let sent = select! {
                result = self.epoch_tx.send(task) => result.is_ok(),
                () = self.cancel.cancelled() => break,
            };

            if !sent {
                debug!("epoch processor stopped before epoch {epoch}");
                break;
            }
        }

        // Wakes the producer if it is waiting for space that will never be freed.
        self.cache.close();

        Ok(abandoned_windows)
    }

    async fn download_snapshot(&self, epoch: Epoch, slot: Slot) -> Result<AgnosticState> {
        let fetcher = &self.fetcher;

        let mut state = self
            .with_retries(Resource::State, slot, move || fetcher.get_state(slot))
            .await?;

        let duties = self
            .with_retries(Resource::Duties, epoch, move || {
                fetcher.get_committees_and_duties(epoch)
            })
            .await?;

        let blocks = try_join_all(
            slots_in_epoch(&self.config, epoch).map(|slot| self.download_block(slot, &duties)),
        )
        .await?;

        state.blocks = blocks;
        state.duties = duties;

        debug!("downloaded snapshot of epoch {epoch} at slot {slot}");

        Ok(state)
    }

    async fn download_block(&self, slot: Slot, duties: &EpochDuties) -> Result<AgnosticBlock> {
        let fetcher = &self.fetcher;

        let block = self
            .with_retries(Resource::Block, slot, move || fetcher.get_block(slot))
            .await;

        let Some(block) = found(block)? else {
            let proposer_index = duties
                .proposer_duties()
                .iter()
                .find(|duty| duty.slot == slot)
                .map(|duty| duty.validator_index)
                .ok_or_else(|| anyhow!("no proposer is assigned to slot {slot}"))?;

            trace!("slot {slot} was missed by validator {proposer_index}");

            return Ok(AgnosticBlock::missed(slot, proposer_index));
        };

        let reward = match found(fetcher.get_block_reward_report(slot).await) {
            Ok(reward) => reward,
            Err(error) => {
                warn_with_progress!("reward report for slot {slot} is unavailable: {error:?}");
                None
            }
        };

        Ok(AgnosticBlock { reward, ..block })
    }

    async fn with_retries<T, R>(
        &self,
        resource: Resource,
        id: u64,
        mut fetch: impl FnMut() -> R,
    ) -> Result<T>
    where
        R: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            match fetch().await {
                Err(error) if !is_not_found(&error) && attempt < self.fetch_retries => {
                    attempt += 1;

                    warn_with_progress!(
                        "retrying {resource} {id} ({attempt}/{}) after error: {error:?}",
                        self.fetch_retries,
                    );

                    sleep(self.fetch_retry_delay).await;
                }
                result => return result,
            }
        }
    }
}
