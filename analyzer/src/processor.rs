use std::{collections::HashSet, sync::Arc};

use anyhow::Result;
use async_channel::Sender as ValidatorSender;
use itertools::Itertools as _;
use log::debug;
use logging::{error_with_progress, info_with_progress, PROGRESS_LOG_METRICS};
use reward_metrics::{build_bundle, EpochWindow, RewardMetrics};
use tokio::{
    select,
    sync::mpsc::{Receiver, Sender},
    task,
};
use tokio_util::sync::CancellationToken;
use types::{
    config::Config,
    nonstandard::ExternalRewardPreference,
    phase0::primitives::{Epoch, ValidatorIndex},
    records::Table,
};

use crate::{
    config::{AnalyzerConfig, Pool},
    messages::{EpochTask, ValidatorTask, WriterMessage},
    slot_range::SlotRange,
};

// Tables holding rows of individual slots, cleared slot by slot before a rewrite.
const BLOCK_TABLES: [Table; 3] = [Table::Blocks, Table::Attestations, Table::Withdrawals];

#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct ProcessorReport {
    /// Epochs whose validator rewards were queued.
    pub processed_epochs: Vec<Epoch>,
    /// Last epochs of the windows whose metrics bundle could not be built.
    pub abandoned_windows: Vec<Epoch>,
    pub validator_tasks: u64,
}

/// Builds one metrics bundle per epoch task and fans its validators out to the worker pool.
///
/// Epoch level rows are produced here. Validator rows are produced by the workers.
pub struct EpochProcessor {
    config: Arc<Config>,
    range: SlotRange,
    preference: ExternalRewardPreference,
    batch_count: usize,
    pools: Vec<Pool>,
    validator_subset: HashSet<ValidatorIndex>,
    rewrite: bool,
    epoch_rx: Receiver<EpochTask>,
    validator_tx: ValidatorSender<ValidatorTask>,
    writer_tx: Sender<WriterMessage>,
    cancel: CancellationToken,
}

impl EpochProcessor {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        range: SlotRange,
        analyzer_config: &AnalyzerConfig,
        epoch_rx: Receiver<EpochTask>,
        validator_tx: ValidatorSender<ValidatorTask>,
        writer_tx: Sender<WriterMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            range,
            preference: analyzer_config.external_reward_preference,
            batch_count: analyzer_config.validator_batch_count().get(),
            pools: analyzer_config.pools.clone(),
            validator_subset: analyzer_config.validator_indices.iter().copied().collect(),
            rewrite: analyzer_config.rewrite,
            epoch_rx,
            validator_tx,
            writer_tx,
            cancel,
        }
    }

    pub async fn run(mut self) -> Result<ProcessorReport> {
        let mut report = ProcessorReport::default();

        loop {
            let task = select! {
                task = self.epoch_rx.recv() => task,
                () = self.cancel.cancelled() => break,
            };

            // The downloader has finished and every queued task has been drained.
            let Some(task) = task else {
                break;
            };

            let epoch = task.window.next.epoch;

            info_with_progress!(
                "processing epoch {epoch} (finalized: {})",
                task.finalized,
            );

            let bundle = match self.build_bundle(task.window).await {
                Ok(bundle) => bundle,
                Err(error) => {
                    error_with_progress!("abandoning window of epoch {epoch}: {error:?}");
                    report.abandoned_windows.push(epoch);
                    PROGRESS_LOG_METRICS.increment_processed_epoch_count();
                    continue;
                }
            };

            if !self.queue_epoch_rows(bundle.as_ref()).await {
                break;
            }

            let Some(task_count) = self.queue_validator_tasks(&bundle).await else {
                break;
            };

            report.validator_tasks += task_count;

            if self.range.analysed_epochs().contains(&epoch) {
                report.processed_epochs.push(epoch);
            }

            PROGRESS_LOG_METRICS.increment_processed_epoch_count();
        }

        // Workers drain what is left in the queue and stop.
        self.validator_tx.close();

        info_with_progress!(
            "epoch processor finished ({} epochs processed, {} windows abandoned)",
            report.processed_epochs.len(),
            report.abandoned_windows.len(),
        );

        Ok(report)
    }

    async fn build_bundle(&self, window: EpochWindow) -> Result<Arc<dyn RewardMetrics>> {
        let config = Arc::clone(&self.config);
        let preference = self.preference;

        task::spawn_blocking(move || build_bundle(&config, window, preference)).await?
    }

    /// Returns `false` if the writer has stopped or the run was cancelled.
    async fn queue_epoch_rows(&self, bundle: &dyn RewardMetrics) -> bool {
        let base = bundle.get_metrics_base();

        if !self.range.writes_epoch_rows(&base.window) {
            return true;
        }

        let summary = base.epoch_summary();
        let duties = base.proposer_duties();
        let blocks = base.block_summaries();
        let mut messages = vec![];

        if self.rewrite {
            messages.push(WriterMessage::DeleteForSlot {
                table: Table::EpochSummary,
                slot: summary.slot,
            });

            messages.extend(duties.iter().map(|duty| WriterMessage::DeleteForSlot {
                table: Table::ProposerDuties,
                slot: duty.slot,
            }));

            messages.extend(
                blocks
                    .iter()
                    .cartesian_product(BLOCK_TABLES)
                    .map(|(block, table)| WriterMessage::DeleteForSlot {
                        table,
                        slot: block.slot,
                    }),
            );
        }

        messages.push(WriterMessage::Row(summary.into()));
        messages.extend(duties.into_iter().map(|duty| WriterMessage::Row(duty.into())));
        messages.extend(blocks.into_iter().map(|block| WriterMessage::Row(block.into())));

        messages.extend(
            base.attestation_records()
                .into_iter()
                .map(|attestation| WriterMessage::Row(attestation.into())),
        );

        messages.extend(
            base.withdrawal_records()
                .into_iter()
                .map(|withdrawal| WriterMessage::Row(withdrawal.into())),
        );

        for message in messages {
            if !self.send_to_writer(message).await {
                return false;
            }
        }

        true
    }

    /// Returns the number of tasks queued or [`None`] if the run has stopped.
    async fn queue_validator_tasks(&self, bundle: &Arc<dyn RewardMetrics>) -> Option<u64> {
        let base = bundle.get_metrics_base();

        if !self.range.writes_validator_rows(&base.window) {
            return Some(0);
        }

        if self.rewrite {
            let message = WriterMessage::DeleteForSlot {
                table: Table::ValidatorRewards,
                slot: base.window.next.slot,
            };

            if !self.send_to_writer(message).await {
                return None;
            }
        }

        let analysed = base
            .analysed_validators()
            .filter(|validator_index| {
                self.validator_subset.is_empty() || self.validator_subset.contains(validator_index)
            })
            .collect::<Vec<_>>();

        let tasks = if self.pools.is_empty() {
            split_into_batches(&analysed, self.batch_count)
                .map(|validator_indices| (validator_indices.to_vec(), None))
                .collect::<Vec<_>>()
        } else {
            let analysed = analysed.into_iter().collect::<HashSet<_>>();

            self.pools
                .iter()
                .map(|pool| {
                    let validator_indices = pool
                        .validators
                        .iter()
                        .copied()
                        .filter(|validator_index| analysed.contains(validator_index))
                        .collect();

                    (validator_indices, Some(pool.name.clone()))
                })
                .collect()
        };

        let mut task_count = 0;

        for (validator_indices, pool_name) in tasks {
            debug!(
                "queueing {} validators of epoch {} (pool: {pool_name:?})",
                validator_indices.len(),
                base.window.next.epoch,
            );

            let task = ValidatorTask {
                validator_indices,
                bundle: Arc::clone(bundle),
                pool_name,
            };

            let sent = select! {
                result = self.validator_tx.send(task) => result.is_ok(),
                () = self.cancel.cancelled() => false,
            };

            if !sent {
                return None;
            }

            task_count += 1;
        }

        Some(task_count)
    }

    async fn send_to_writer(&self, message: WriterMessage) -> bool {
        select! {
            result = self.writer_tx.send(message) => result.is_ok(),
            () = self.cancel.cancelled() => false,
        }
    }
}

/// Splits validators into at most `batch_count` contiguous batches.
///
/// Sizes differ by one at most. The first `len % batch_count` batches hold the extra validators.
fn split_into_batches(
    validator_indices: &[ValidatorIndex],
    batch_count: usize,
) -> impl Iterator<Item = &[ValidatorIndex]> {
    let batch_count = batch_count.clamp(1, validator_indices.len().max(1));
    let base_size = validator_indices.len() / batch_count;
    let remainder = validator_indices.len() % batch_count;

    let mut rest = validator_indices;

    (0..batch_count).map_while(move |position| {
        let size = base_size + usize::from(position < remainder);
        let remaining = rest;
        let batch = remaining.get(..size)?;
        rest = remaining.get(size..)?;
        (!batch.is_empty()).then_some(batch)
    })
}

#[cfg(test)]
mod tests {
    use itertools::Itertools as _;
    use test_case::test_case;

    use super::*;

    #[test_case(16, 3 => vec![6, 5, 5])]
    #[test_case(9, 4 => vec![3, 2, 2, 2])]
    #[test_case(16, 2 => vec![8, 8])]
    #[test_case(4, 8 => vec![1, 1, 1, 1])]
    #[test_case(5, 1 => vec![5])]
    #[test_case(0, 3 => Vec::<usize>::new())]
    fn batches_are_balanced(validator_count: u64, batch_count: usize) -> Vec<usize> {
        let validators = (0..validator_count).collect_vec();

        split_into_batches(&validators, batch_count)
            .map(<[_]>::len)
            .collect()
    }

    #[test]
    fn batches_cover_every_validator_once() {
        let validators = (0..17).collect_vec();

        let covered = split_into_batches(&validators, 4).flatten().copied().collect_vec();

        assert_eq!(covered, validators);
    }
}
