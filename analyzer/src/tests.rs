use core::time::Duration;
use std::{collections::BTreeSet, sync::Arc};

use anyhow::{anyhow, Result};
use database::{Database, Persister};
use factory::{Chain, InMemoryFetcher};
use itertools::Itertools as _;
use nonzero_ext::nonzero;
use parking_lot::Mutex;
use reward_metrics::{build_bundle, EpochWindow};
use tempfile::TempDir;
use tokio::{sync::Notify, time::timeout};
use tokio_util::sync::CancellationToken;
use types::{
    capella::containers::Withdrawal,
    config::Config,
    nonstandard::ExternalRewardPreference,
    phase0::primitives::{Epoch, Slot},
    records::{Row, Table, ValidatorRewards},
};

use crate::{AnalyzerConfig, Analyzer, Error, Pool, RunReport};

const VALIDATOR_COUNT: u64 = 16;

const TABLES: [Table; 6] = [
    Table::ValidatorRewards,
    Table::EpochSummary,
    Table::ProposerDuties,
    Table::Blocks,
    Table::Attestations,
    Table::Withdrawals,
];

fn minimal_chain(last_epoch: Epoch) -> Chain {
    Chain::new(Arc::new(Config::minimal()), VALIDATOR_COUNT, last_epoch)
}

fn analyzer_config(init_slot: Slot, final_slot: Slot) -> AnalyzerConfig {
    AnalyzerConfig {
        init_slot,
        final_slot,
        validator_workers: nonzero!(2_usize),
        validator_batches: Some(nonzero!(3_usize)),
        batch_size: 7,
        state_fetch_retries: 1,
        state_fetch_retry_delay: Duration::ZERO,
        ..AnalyzerConfig::default()
    }
}

async fn analyze(
    chain: &Chain,
    fetcher: InMemoryFetcher,
    analyzer_config: AnalyzerConfig,
    database: Database,
) -> Result<(RunReport, Arc<Mutex<Database>>)> {
    let store = Arc::new(Mutex::new(database));

    let report = Analyzer::new(
        Arc::clone(chain.config()),
        analyzer_config,
        fetcher,
        Arc::clone(&store),
        CancellationToken::new(),
    )
    .run()
    .await?;

    Ok((report, store))
}

fn validator_rows(store: &Mutex<Database>) -> Result<Vec<ValidatorRewards>> {
    let rows = store
        .lock()
        .rows(Table::ValidatorRewards)?
        .into_iter()
        .filter_map(|row| match row {
            Row::ValidatorRewards(rewards) => Some(*rewards),
            _ => None,
        })
        .collect();

    Ok(rows)
}

fn epochs_of(rows: &[Row], slots_per_epoch: u64) -> Vec<Epoch> {
    rows.iter()
        .map(|row| row.slot() / slots_per_epoch)
        .sorted()
        .collect()
}

fn sorted_json(rows: &[Row]) -> Result<Vec<String>> {
    let mut lines = rows
        .iter()
        .map(serde_json::to_string)
        .collect::<Result<Vec<_>, _>>()?;

    lines.sort_unstable();

    Ok(lines)
}

#[tokio::test]
async fn every_validator_is_recorded_once_per_epoch() -> Result<()> {
    let chain = minimal_chain(6);

    let (report, store) = analyze(
        &chain,
        chain.fetcher(),
        analyzer_config(16, 39),
        Database::in_memory(),
    )
    .await?;

    assert_eq!(report.processed_epochs, [2, 3, 4]);
    assert!(report.abandoned_epochs.is_empty());
    assert_eq!(report.validator_tasks, 9);
    assert_eq!(report.validator_records, 3 * VALIDATOR_COUNT);
    assert_eq!(report.rows_lost, 0);

    let records = validator_rows(&store)?;

    let pairs = records
        .iter()
        .map(|rewards| (rewards.epoch, rewards.validator_index))
        .collect::<BTreeSet<_>>();

    let expected_pairs = (2..=4)
        .cartesian_product(0..VALIDATOR_COUNT)
        .collect::<BTreeSet<_>>();

    assert_eq!(records.len(), expected_pairs.len());
    assert_eq!(pairs, expected_pairs);

    let summaries = store.lock().rows(Table::EpochSummary)?;
    let duties = store.lock().rows(Table::ProposerDuties)?;
    let blocks = store.lock().rows(Table::Blocks)?;
    let attestations = store.lock().rows(Table::Attestations)?;

    let described_states = (2..=4)
        .map(|epoch| chain.state(epoch))
        .collect::<Result<Vec<_>>>()?;

    let expected_duties = described_states
        .iter()
        .map(|state| state.duties.proposer_duties().len())
        .sum::<usize>();

    let expected_attestations = described_states
        .iter()
        .flat_map(|state| &state.blocks)
        .map(|block| block.attestations.len())
        .sum::<usize>();

    assert_eq!(summaries.iter().map(Row::slot).collect_vec(), [23, 31, 39]);
    assert_eq!(duties.len(), expected_duties);
    assert_eq!(blocks.iter().map(Row::slot).collect_vec(), (16..40).collect_vec());
    assert_eq!(attestations.len(), expected_attestations);

    let stored_rows = TABLES
        .into_iter()
        .map(|table| -> Result<usize> { Ok(store.lock().rows(table)?.len()) })
        .sum::<Result<usize>>()?;

    assert_eq!(report.rows_written, stored_rows);

    Ok(())
}

#[tokio::test]
async fn contiguous_runs_describe_every_epoch_exactly_once() -> Result<()> {
    let chain = minimal_chain(9);
    let slots_per_epoch = chain.config().slots_per_epoch.get();
    let directory = TempDir::new()?;

    for (init_slot, final_slot) in [(16, 39), (40, 63)] {
        let (report, _) = analyze(
            &chain,
            chain.fetcher(),
            analyzer_config(init_slot, final_slot),
            Database::persistent(directory.path())?,
        )
        .await?;

        assert!(report.abandoned_epochs.is_empty());
    }

    let database = Database::persistent(directory.path())?;
    let duty_epochs = (2..=7)
        .flat_map(|epoch| core::iter::repeat_n(epoch, 8))
        .collect_vec();

    assert_eq!(
        epochs_of(&database.rows(Table::EpochSummary)?, slots_per_epoch),
        (2..=7).collect_vec(),
    );
    assert_eq!(
        epochs_of(&database.rows(Table::ProposerDuties)?, slots_per_epoch),
        duty_epochs,
    );
    assert_eq!(
        epochs_of(&database.rows(Table::Blocks)?, slots_per_epoch),
        duty_epochs,
    );

    let rewarded = validator_rows(&Mutex::new(database))?
        .iter()
        .map(|rewards| rewards.epoch)
        .counts();

    assert_eq!(
        rewarded.into_iter().sorted().collect_vec(),
        (2..=7).map(|epoch| (epoch, 16)).collect_vec(),
    );

    Ok(())
}

#[tokio::test]
async fn block_level_rows_describe_the_requested_epochs() -> Result<()> {
    let mut chain = minimal_chain(4);

    chain.block_mut(19)?.withdrawals.push(Withdrawal {
        index: 40,
        validator_index: 3,
        amount: 1_000,
    });

    chain.miss_block(20)?;

    let (_, store) = analyze(
        &chain,
        chain.fetcher(),
        analyzer_config(16, 23),
        Database::in_memory(),
    )
    .await?;

    let blocks = store.lock().rows(Table::Blocks)?;
    let withdrawals = store.lock().rows(Table::Withdrawals)?;
    let attestations = store.lock().rows(Table::Attestations)?;

    let missed = blocks
        .iter()
        .filter_map(|row| match row {
            Row::Block(block) => (!block.proposed).then_some(block.slot),
            _ => None,
        })
        .collect_vec();

    assert_eq!(blocks.len(), 8);
    assert_eq!(missed, [20]);
    assert_eq!(withdrawals.iter().map(Row::slot).collect_vec(), [19]);
    assert!(attestations.iter().all(|row| (16..24).contains(&row.slot())));
    assert!(!attestations.iter().any(|row| row.slot() == 20));

    Ok(())
}

#[tokio::test]
async fn stored_rewards_match_the_metrics_bundle() -> Result<()> {
    let chain = minimal_chain(5);

    let (_, store) = analyze(
        &chain,
        chain.fetcher(),
        analyzer_config(24, 31),
        Database::in_memory(),
    )
    .await?;

    let (prev, current, next) = chain.window(3)?;
    let bundle = build_bundle(
        chain.config(),
        EpochWindow {
            prev,
            current,
            next,
        },
        ExternalRewardPreference::default(),
    )?;

    let stored = validator_rows(&store)?
        .into_iter()
        .find(|rewards| rewards.validator_index == 5)
        .ok_or_else(|| anyhow!("validator 5 was not recorded"))?;

    assert_eq!(stored, bundle.get_max_reward(5)?);

    Ok(())
}

#[tokio::test]
async fn unavailable_snapshots_abandon_their_epochs() -> Result<()> {
    let chain = minimal_chain(9);
    let fetcher = chain.fetcher().with_failing_states([31]);

    let (report, store) = analyze(&chain, fetcher, analyzer_config(16, 63), Database::in_memory())
        .await?;

    // Epochs 2 and 3 also lose the summaries built from windows containing epoch 3.
    assert_eq!(report.processed_epochs, [2, 6, 7]);
    assert_eq!(report.abandoned_epochs, [2, 3, 4, 5]);

    let epochs = validator_rows(&store)?
        .iter()
        .map(|rewards| rewards.epoch)
        .collect::<BTreeSet<_>>();

    assert_eq!(epochs, BTreeSet::from([2, 6, 7]));

    Ok(())
}

#[tokio::test]
async fn genesis_epochs_have_no_rewards() -> Result<()> {
    let chain = minimal_chain(4);

    let (report, store) = analyze(
        &chain,
        chain.fetcher(),
        analyzer_config(0, 23),
        Database::in_memory(),
    )
    .await?;

    assert_eq!(report.processed_epochs, [0, 1, 2]);

    let genesis_records = validator_rows(&store)?
        .into_iter()
        .filter(|rewards| rewards.epoch < 2)
        .collect_vec();

    assert_eq!(genesis_records.len(), 2 * usize::try_from(VALIDATOR_COUNT)?);
    assert!(genesis_records.iter().all(|rewards| rewards.reward == 0));

    // Windows whose previous snapshot is a placeholder describe no epoch.
    let summaries = store.lock().rows(Table::EpochSummary)?;

    assert_eq!(summaries.iter().map(Row::slot).collect_vec(), [7, 15, 23]);

    Ok(())
}

#[tokio::test]
async fn pools_and_validator_subsets_limit_the_analysis() -> Result<()> {
    let chain = minimal_chain(6);

    let pools = vec![
        Pool {
            name: "lido".to_owned(),
            validators: vec![1, 2, 3, 99],
        },
        Pool {
            name: "rocket".to_owned(),
            validators: vec![4],
        },
    ];

    let (report, store) = analyze(
        &chain,
        chain.fetcher(),
        AnalyzerConfig {
            pools,
            ..analyzer_config(24, 31)
        },
        Database::in_memory(),
    )
    .await?;

    assert_eq!(report.validator_tasks, 2);

    let pooled = validator_rows(&store)?
        .into_iter()
        .map(|rewards| (rewards.validator_index, rewards.pool_name))
        .sorted()
        .collect_vec();

    assert_eq!(
        pooled,
        [
            (1, Some("lido".to_owned())),
            (2, Some("lido".to_owned())),
            (3, Some("lido".to_owned())),
            (4, Some("rocket".to_owned())),
        ],
    );

    let (_, store) = analyze(
        &chain,
        chain.fetcher(),
        AnalyzerConfig {
            validator_indices: vec![0, 5],
            ..analyzer_config(24, 39)
        },
        Database::in_memory(),
    )
    .await?;

    let subset = validator_rows(&store)?
        .iter()
        .map(|rewards| (rewards.epoch, rewards.validator_index))
        .sorted()
        .collect_vec();

    assert_eq!(subset, [(3, 0), (3, 5), (4, 0), (4, 5)]);

    Ok(())
}

#[tokio::test]
async fn rewriting_a_range_replaces_its_rows() -> Result<()> {
    let mut chain = minimal_chain(7);
    let directory = TempDir::new()?;

    chain.block_mut(27)?.withdrawals.push(Withdrawal {
        index: 7,
        validator_index: 11,
        amount: 2_000,
    });

    let rewrite_config = AnalyzerConfig {
        rewrite: true,
        ..analyzer_config(16, 47)
    };

    let snapshot = |store: &Mutex<Database>| -> Result<Vec<Vec<String>>> {
        TABLES
            .iter()
            .map(|table| sorted_json(&store.lock().rows(*table)?))
            .collect()
    };

    let (_, store) = analyze(
        &chain,
        chain.fetcher(),
        rewrite_config.clone(),
        Database::persistent(directory.path())?,
    )
    .await?;

    let first = snapshot(&store)?;

    let (_, store) = analyze(
        &chain,
        chain.fetcher(),
        rewrite_config,
        Database::persistent(directory.path())?,
    )
    .await?;

    assert_eq!(snapshot(&store)?, first);

    let (_, store) = analyze(
        &chain,
        chain.fetcher(),
        analyzer_config(16, 47),
        Database::persistent(directory.path())?,
    )
    .await?;

    assert!(first.iter().all(|rows| !rows.is_empty()));

    let duplicated = snapshot(&store)?;

    for (rows, once) in duplicated.iter().zip(&first) {
        assert_eq!(rows.len(), 2 * once.len());
    }

    Ok(())
}

#[tokio::test]
async fn cancelled_runs_report_cancellation() -> Result<()> {
    let chain = minimal_chain(4);
    let store = Arc::new(Mutex::new(Database::in_memory()));
    let cancel = CancellationToken::new();

    cancel.cancel();

    let error = Analyzer::new(
        Arc::clone(chain.config()),
        analyzer_config(16, 39),
        chain.fetcher(),
        store,
        cancel,
    )
    .run()
    .await
    .expect_err("a cancelled run cannot succeed");

    assert!(matches!(error.downcast_ref(), Some(Error::Cancelled)));

    Ok(())
}

/// Blocks in its first write until the run is cancelled.
struct StallingDatabase {
    database: Database,
    stalled: Arc<Notify>,
    cancel: CancellationToken,
}

impl Persister for StallingDatabase {
    fn persist(&mut self, table: Table, rows: &[Row]) -> Result<()> {
        self.stalled.notify_one();
        futures::executor::block_on(self.cancel.cancelled());
        self.database.persist(table, rows)
    }

    fn delete_for_slot(&mut self, table: Table, slot: Slot) -> Result<()> {
        self.database.delete_for_slot(table, slot)
    }

    fn close(&mut self) -> Result<()> {
        self.database.close()
    }
}

#[tokio::test]
async fn cancelling_a_stalled_run_stops_every_stage() -> Result<()> {
    let chain = minimal_chain(9);
    let stalled = Arc::new(Notify::new());
    let cancel = CancellationToken::new();

    let store = Arc::new(Mutex::new(StallingDatabase {
        database: Database::in_memory(),
        stalled: Arc::clone(&stalled),
        cancel: cancel.clone(),
    }));

    // Small queues fill up while the writer is stuck, blocking every producer behind it.
    let analyzer_config = AnalyzerConfig {
        writer_queue_capacity: nonzero!(2_usize),
        snapshot_cache_capacity: nonzero!(2_usize),
        ..analyzer_config(16, 63)
    };

    let run = tokio::spawn(
        Analyzer::new(
            Arc::clone(chain.config()),
            analyzer_config,
            chain.fetcher(),
            Arc::clone(&store),
            cancel.clone(),
        )
        .run(),
    );

    stalled.notified().await;
    cancel.cancel();

    let error = timeout(Duration::from_secs(10), run)
        .await??
        .expect_err("a cancelled run cannot succeed");

    assert!(matches!(error.downcast_ref(), Some(Error::Cancelled)));
    assert!(store.lock().database.is_closed());

    Ok(())
}

#[tokio::test]
async fn invalid_ranges_are_rejected_before_anything_runs() {
    let chain = minimal_chain(4);
    let store = Arc::new(Mutex::new(Database::in_memory()));

    let error = Analyzer::new(
        Arc::clone(chain.config()),
        analyzer_config(40, 39),
        chain.fetcher(),
        Arc::clone(&store),
        CancellationToken::new(),
    )
    .run()
    .await
    .expect_err("the range is empty");

    assert!(matches!(
        error.downcast_ref(),
        Some(Error::InvalidSlotRange { .. }),
    ));
}
