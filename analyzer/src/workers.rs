use std::sync::Arc;

use anyhow::Result;
use async_channel::Receiver as ValidatorReceiver;
use futures::future::try_join_all;
use log::{debug, trace};
use logging::warn_with_progress;
use parking_lot::Mutex;
use tokio::{select, sync::mpsc::Sender, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::messages::{ValidatorTask, WriterMessage};

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct WorkerStats {
    pub tasks: u64,
    pub records: u64,
    pub failed_records: u64,
}

/// Fixed number of workers resolving validator rewards against frozen metrics bundles.
pub struct ValidatorWorkers {
    handles: Vec<JoinHandle<Result<()>>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl ValidatorWorkers {
    #[must_use]
    pub fn spawn(
        worker_count: usize,
        validator_rx: &ValidatorReceiver<ValidatorTask>,
        writer_tx: &Sender<WriterMessage>,
        cancel: &CancellationToken,
    ) -> Self {
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        let handles = (0..worker_count)
            .map(|worker_id| {
                let worker = Worker {
                    worker_id,
                    validator_rx: validator_rx.clone(),
                    writer_tx: writer_tx.clone(),
                    stats: Arc::clone(&stats),
                    cancel: cancel.clone(),
                };

                tokio::spawn(worker.run())
            })
            .collect();

        Self { handles, stats }
    }

    /// Waits for every worker to exit. Workers exit once the validator queue is closed and empty.
    pub async fn join(self) -> Result<WorkerStats> {
        try_join_all(self.handles)
            .await?
            .into_iter()
            .collect::<Result<()>>()?;

        Ok(*self.stats.lock())
    }
}

struct Worker {
    worker_id: usize,
    validator_rx: ValidatorReceiver<ValidatorTask>,
    writer_tx: Sender<WriterMessage>,
    stats: Arc<Mutex<WorkerStats>>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) -> Result<()> {
        loop {
            let task = select! {
                task = self.validator_rx.recv() => task,
                () = self.cancel.cancelled() => break,
            };

            let Ok(task) = task else {
                break;
            };

            if !self.process_task(task).await {
                break;
            }
        }

        debug!("validator worker {} finished", self.worker_id);

        Ok(())
    }

    /// Returns `false` if the writer has stopped or the run was cancelled.
    async fn process_task(&self, task: ValidatorTask) -> bool {
        let ValidatorTask {
            validator_indices,
            bundle,
            pool_name,
        } = task;

        trace!(
            "worker {} resolving {} validators",
            self.worker_id,
            validator_indices.len(),
        );

        let mut records = 0;
        let mut failed_records = 0;

        for validator_index in validator_indices {
            let mut rewards = match bundle.get_max_reward(validator_index) {
                Ok(rewards) => rewards,
                Err(error) => {
                    warn_with_progress!(
                        "failed to resolve rewards of validator {validator_index}: {error:?}",
                    );
                    failed_records += 1;
                    continue;
                }
            };

            rewards.pool_name.clone_from(&pool_name);

            let sent = select! {
                result = self.writer_tx.send(WriterMessage::Row(rewards.into())) => result.is_ok(),
                () = self.cancel.cancelled() => false,
            };

            if !sent {
                return false;
            }

            records += 1;
        }

        let mut stats = self.stats.lock();

        stats.tasks += 1;
        stats.records += records;
        stats.failed_records += failed_records;

        true
    }
}
