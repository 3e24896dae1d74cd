use core::time::Duration;
use std::{sync::Arc, time::Instant};

use anyhow::{bail, Error as AnyhowError, Result};
use beacon_api::Fetcher;
use database::Persister;
use itertools::Itertools as _;
use log::error;
use logging::{info_with_progress, PROGRESS_LOG_METRICS};
use parking_lot::Mutex;
use state_cache::StateCache;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use types::{config::Config, phase0::primitives::Epoch};

use crate::{
    batch_writer::BatchWriter,
    config::AnalyzerConfig,
    downloader::Downloader,
    error::Error,
    processor::EpochProcessor,
    slot_range::SlotRange,
    workers::ValidatorWorkers,
};

// A single queued epoch keeps the downloader from running ahead of processing.
const EPOCH_QUEUE_CAPACITY: usize = 1;

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RunReport {
    /// Epochs whose validator rewards were computed.
    pub processed_epochs: Vec<Epoch>,
    /// Epochs with missing rows that must be reprocessed, in ascending order.
    pub abandoned_epochs: Vec<Epoch>,
    pub validator_tasks: u64,
    pub validator_records: u64,
    pub rows_written: usize,
    pub rows_lost: usize,
    pub elapsed: Duration,
}

/// Wires the pipeline stages together and shuts them down in order.
pub struct Analyzer<F, D> {
    config: Arc<Config>,
    analyzer_config: AnalyzerConfig,
    fetcher: F,
    store: Arc<Mutex<D>>,
    cancel: CancellationToken,
}

impl<F, D> Analyzer<F, D>
where
    F: Fetcher + 'static,
    D: Persister + 'static,
{
    #[must_use]
    pub const fn new(
        config: Arc<Config>,
        analyzer_config: AnalyzerConfig,
        fetcher: F,
        store: Arc<Mutex<D>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            analyzer_config,
            fetcher,
            store,
            cancel,
        }
    }

    pub async fn run(self) -> Result<RunReport> {
        let Self {
            config,
            analyzer_config,
            fetcher,
            store,
            cancel,
        } = self;

        analyzer_config.validate()?;

        let range = SlotRange::new(&config, analyzer_config.init_slot, analyzer_config.final_slot)?;
        let started_at = Instant::now();

        PROGRESS_LOG_METRICS.reset(range.window_count());

        info_with_progress!(
            "analyzing slots {}..={} on {} with {} workers",
            analyzer_config.init_slot,
            analyzer_config.final_slot,
            config.config_name,
            analyzer_config.validator_workers,
        );

        let cache = Arc::new(StateCache::new(
            analyzer_config.snapshot_cache_capacity.get(),
        ));

        let (epoch_tx, epoch_rx) = mpsc::channel(EPOCH_QUEUE_CAPACITY);
        let (validator_tx, validator_rx) =
            async_channel::bounded(analyzer_config.validator_workers.get());

        let (writer, mut writer_handle) = BatchWriter::new(
            Arc::clone(&store),
            analyzer_config.batch_size,
            analyzer_config.writer_queue_capacity.get(),
        );

        let downloader = Downloader::new(
            Arc::clone(&config),
            range,
            &analyzer_config,
            fetcher,
            Arc::clone(&cache),
            epoch_tx,
            cancel.clone(),
        );

        let processor = EpochProcessor::new(
            Arc::clone(&config),
            range,
            &analyzer_config,
            epoch_rx,
            validator_tx,
            writer_handle.sender(),
            cancel.clone(),
        );

        let writer_task = tokio::spawn(writer.run());
        let download_task = tokio::spawn(downloader.run());
        let process_task = tokio::spawn(processor.run());

        let workers = ValidatorWorkers::spawn(
            analyzer_config.validator_workers.get(),
            &validator_rx,
            &writer_handle.sender(),
            &cancel,
        );

        // Only the workers may hold the receiving end, or the queue never drains.
        drop(validator_rx);

        let downloaded = join_stage("downloader", download_task, &cancel).await;
        let processed = join_stage("epoch processor", process_task, &cancel).await;
        let worked = workers.join().await;

        writer_handle.done_tasks();

        let written = writer_handle.wait_until_finished().await;
        let writer_result = join_stage("batch writer", writer_task, &cancel).await;

        cache.close();
        store.lock().close()?;

        let mut abandoned_windows = downloaded?;
        let processor_report = processed?;
        let worker_stats = worked?;
        let writer_report = written?;

        writer_result?;

        if cancel.is_cancelled() {
            bail!(Error::Cancelled);
        }

        abandoned_windows.extend(processor_report.abandoned_windows);

        let abandoned_epochs = abandoned_windows
            .into_iter()
            .flat_map(|next_epoch| range.epochs_covered_by(next_epoch))
            .sorted_unstable()
            .dedup()
            .collect();

        let report = RunReport {
            processed_epochs: processor_report.processed_epochs,
            abandoned_epochs,
            validator_tasks: processor_report.validator_tasks,
            validator_records: worker_stats.records,
            rows_written: writer_report.rows_written,
            rows_lost: writer_report.rows_lost,
            elapsed: started_at.elapsed(),
        };

        info_with_progress!(
            "analysis finished in {:?} ({} epochs processed, {} abandoned, {} rows written)",
            report.elapsed,
            report.processed_epochs.len(),
            report.abandoned_epochs.len(),
            report.rows_written,
        );

        Ok(report)
    }
}

/// Awaits a stage and cancels the rest of the pipeline if it failed.
async fn join_stage<T>(
    name: &str,
    handle: JoinHandle<Result<T>>,
    cancel: &CancellationToken,
) -> Result<T> {
    let result = handle.await.map_err(AnyhowError::from).and_then(|result| result);

    if let Err(error) = &result {
        error!("{name} failed: {error:?}");
        cancel.cancel();
    }

    result
}
