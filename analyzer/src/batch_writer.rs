use core::mem;
use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use database::Persister;
use log::debug;
use logging::{error_with_progress, info_with_progress};
use parking_lot::Mutex;
use tokio::{
    select,
    sync::{
        mpsc::{self, Receiver, Sender},
        oneshot,
    },
    task,
};
use types::records::{Row, Table};

use crate::messages::WriterMessage;

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct WriterReport {
    pub rows_written: usize,
    /// Rows dropped because the store rejected them.
    pub rows_lost: usize,
    pub flushes: usize,
    pub deletes: usize,
}

/// Single consumer of every row produced by the pipeline.
///
/// Rows are buffered per table and flushed once a buffer reaches the batch size. A slot scoped
/// delete first flushes the buffer of its table so that rows queued before it are deleted too.
/// Store errors are logged and the rows are dropped. Store calls run on the blocking thread pool.
pub struct BatchWriter<D> {
    store: Arc<Mutex<D>>,
    batch_size: usize,
    message_rx: Receiver<WriterMessage>,
    done_rx: oneshot::Receiver<()>,
    finished_tx: oneshot::Sender<WriterReport>,
    buffers: HashMap<Table, Vec<Row>>,
    report: WriterReport,
}

/// Used by the orchestrator to feed the writer and to learn when it is done.
pub struct WriterHandle {
    message_tx: Sender<WriterMessage>,
    done_tx: Option<oneshot::Sender<()>>,
    finished_rx: oneshot::Receiver<WriterReport>,
}

impl WriterHandle {
    #[must_use]
    pub fn sender(&self) -> Sender<WriterMessage> {
        self.message_tx.clone()
    }

    /// Tells the writer that no more input is coming.
    pub fn done_tasks(&mut self) {
        if let Some(done_tx) = self.done_tx.take() {
            if done_tx.send(()).is_err() {
                debug!("batch writer stopped before it was told to finish");
            }
        }
    }

    /// Resolves after the final flush.
    pub async fn wait_until_finished(self) -> Result<WriterReport> {
        let Self { finished_rx, .. } = self;
        Ok(finished_rx.await?)
    }
}

impl<D: Persister + 'static> BatchWriter<D> {
    #[must_use]
    pub fn new(
        store: Arc<Mutex<D>>,
        batch_size: usize,
        queue_capacity: usize,
    ) -> (Self, WriterHandle) {
        let (message_tx, message_rx) = mpsc::channel(queue_capacity);
        let (done_tx, done_rx) = oneshot::channel();
        let (finished_tx, finished_rx) = oneshot::channel();

        let writer = Self {
            store,
            batch_size,
            message_rx,
            done_rx,
            finished_tx,
            buffers: HashMap::new(),
            report: WriterReport::default(),
        };

        let handle = WriterHandle {
            message_tx,
            done_tx: Some(done_tx),
            finished_rx,
        };

        (writer, handle)
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            let message = select! {
                biased;

                message = self.message_rx.recv() => message,
                _ = &mut self.done_rx => None,
            };

            let Some(message) = message else {
                break;
            };

            self.handle(message).await;
        }

        // Whatever was queued before the done signal is still written.
        self.message_rx.close();

        while let Some(message) = self.message_rx.recv().await {
            self.handle(message).await;
        }

        let tables = self.buffers.keys().copied().collect::<Vec<_>>();

        for table in tables {
            self.flush(table).await;
        }

        info_with_progress!(
            "batch writer finished ({} rows written, {} lost)",
            self.report.rows_written,
            self.report.rows_lost,
        );

        if self.finished_tx.send(self.report).is_err() {
            debug!("nobody is waiting for the batch writer to finish");
        }

        Ok(())
    }

    async fn handle(&mut self, message: WriterMessage) {
        match message {
            WriterMessage::Row(row) => {
                let table = row.table();
                let buffer = self.buffers.entry(table).or_default();

                buffer.push(row);

                if buffer.len() >= self.batch_size {
                    self.flush(table).await;
                }
            }
            WriterMessage::DeleteForSlot { table, slot } => {
                self.flush(table).await;

                let result = self
                    .with_store(move |store| store.delete_for_slot(table, slot))
                    .await;

                match result {
                    Ok(()) => self.report.deletes += 1,
                    Err(error) => {
                        error_with_progress!("failed to delete slot {slot} from {table}: {error:?}");
                    }
                }
            }
        }
    }

    async fn flush(&mut self, table: Table) {
        let rows = self
            .buffers
            .get_mut(&table)
            .map(mem::take)
            .unwrap_or_default();

        if rows.is_empty() {
            return;
        }

        let row_count = rows.len();

        match self.with_store(move |store| store.persist(table, &rows)).await {
            Ok(()) => {
                debug!("flushed {row_count} rows into {table}");
                self.report.rows_written += row_count;
                self.report.flushes += 1;
            }
            Err(error) => {
                error_with_progress!("failed to persist {row_count} rows into {table}: {error:?}");
                self.report.rows_lost += row_count;
            }
        }
    }

    async fn with_store<T: Send + 'static>(
        &self,
        operation: impl FnOnce(&mut D) -> Result<T> + Send + 'static,
    ) -> Result<T> {
        let store = Arc::clone(&self.store);
        task::spawn_blocking(move || operation(&mut *store.lock())).await?
    }
}
