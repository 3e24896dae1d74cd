use std::{
    collections::HashMap,
    io::{BufRead as _, BufReader, BufWriter, ErrorKind, Write as _},
    path::{Path, PathBuf},
};

use anyhow::{ensure, Result};
use fs_err::{File, OpenOptions};
use itertools::Itertools as _;
use log::{debug, info};
use thiserror::Error;
use types::{
    phase0::primitives::Slot,
    records::{
        AttestationRecord, BlockSummary, EpochSummary, ProposerDuty, Row, Table,
        ValidatorRewards, WithdrawalRecord,
    },
};

/// Store that derived rows are written to.
///
/// Implementations need not be thread-safe. The batch writer serializes access to them.
pub trait Persister: Send {
    fn persist(&mut self, table: Table, rows: &[Row]) -> Result<()>;

    /// Removes every row of `table` scoped to `slot`.
    fn delete_for_slot(&mut self, table: Table, slot: Slot) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

pub struct Database {
    kind: DatabaseKind,
    closed: bool,
}

impl Database {
    /// Stores each table as a JSON Lines file named after the table inside `directory`.
    pub fn persistent(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();

        fs_err::create_dir_all(&directory)?;

        info!("database: {}", directory.display());

        Ok(Self {
            kind: DatabaseKind::Persistent { directory },
            closed: false,
        })
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            kind: DatabaseKind::InMemory {
                tables: HashMap::new(),
            },
            closed: false,
        }
    }

    /// Rows of `table` in insertion order.
    pub fn rows(&self, table: Table) -> Result<Vec<Row>> {
        match &self.kind {
            DatabaseKind::Persistent { directory } => read_table(&table_path(directory, table), table),
            DatabaseKind::InMemory { tables } => {
                Ok(tables.get(&table).cloned().unwrap_or_default())
            }
        }
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Persister for Database {
    fn persist(&mut self, table: Table, rows: &[Row]) -> Result<()> {
        ensure!(!self.closed, Error::Closed);

        if let Some(row) = rows.iter().find(|row| row.table() != table) {
            return Err(Error::TableMismatch {
                table,
                actual: row.table(),
            }
            .into());
        }

        match &mut self.kind {
            DatabaseKind::Persistent { directory } => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(table_path(directory, table))?;

                write_rows(file, rows)?;
            }
            DatabaseKind::InMemory { tables } => {
                tables.entry(table).or_default().extend_from_slice(rows);
            }
        }

        debug!("persisted {} rows into {table}", rows.len());

        Ok(())
    }

    fn delete_for_slot(&mut self, table: Table, slot: Slot) -> Result<()> {
        ensure!(!self.closed, Error::Closed);

        let removed = match &mut self.kind {
            DatabaseKind::Persistent { directory } => {
                let path = table_path(directory, table);
                let rows = read_table(&path, table)?;
                let (removed, retained): (Vec<_>, Vec<_>) =
                    rows.into_iter().partition(|row| row.slot() == slot);

                if !removed.is_empty() {
                    let temporary_path = path.with_extension("jsonl.tmp");
                    write_rows(File::create(&temporary_path)?, &retained)?;
                    fs_err::rename(temporary_path, path)?;
                }

                removed.len()
            }
            DatabaseKind::InMemory { tables } => {
                let rows = tables.entry(table).or_default();
                let length_before = rows.len();
                rows.retain(|row| row.slot() != slot);
                length_before - rows.len()
            }
        };

        debug!("deleted {removed} rows of slot {slot} from {table}");

        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        ensure!(!self.closed, Error::Closed);

        self.closed = true;

        info!("database closed");

        Ok(())
    }
}

enum DatabaseKind {
    Persistent { directory: PathBuf },
    InMemory { tables: HashMap<Table, Vec<Row>> },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("database is closed")]
    Closed,
    #[error("row belongs to {actual} and cannot be stored in {table}")]
    TableMismatch { table: Table, actual: Table },
}

fn table_path(directory: &Path, table: Table) -> PathBuf {
    directory.join(format!("{table}.jsonl"))
}

fn write_rows(file: File, rows: &[Row]) -> Result<()> {
    let mut writer = BufWriter::new(file);

    for row in rows {
        serde_json::to_writer(&mut writer, row)?;
        writer.write_all(b"\n")?;
    }

    writer.flush()?;

    Ok(())
}

fn read_table(path: &Path, table: Table) -> Result<Vec<Row>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(vec![]),
        Err(error) => return Err(error.into()),
    };

    BufReader::new(file)
        .lines()
        .filter_ok(|line| !line.is_empty())
        .map(|line| decode_row(&line?, table))
        .collect()
}

// Rows are untagged, so the table decides which type a line is decoded into.
fn decode_row(line: &str, table: Table) -> Result<Row> {
    let row = match table {
        Table::ValidatorRewards => serde_json::from_str::<ValidatorRewards>(line)?.into(),
        Table::EpochSummary => serde_json::from_str::<EpochSummary>(line)?.into(),
        Table::ProposerDuties => serde_json::from_str::<ProposerDuty>(line)?.into(),
        Table::Blocks => serde_json::from_str::<BlockSummary>(line)?.into(),
        Table::Attestations => serde_json::from_str::<AttestationRecord>(line)?.into(),
        Table::Withdrawals => serde_json::from_str::<WithdrawalRecord>(line)?.into(),
    };

    Ok(row)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use test_case::test_case;
    use types::{nonstandard::ValidatorStatus, phase0::primitives::H256};

    use super::*;

    type Constructor = fn() -> Result<(Database, Option<TempDir>)>;

    fn build_persistent_database() -> Result<(Database, Option<TempDir>)> {
        let temp_dir = TempDir::new()?;
        let database = Database::persistent(temp_dir.path().join("tables"))?;
        Ok((database, Some(temp_dir)))
    }

    fn build_in_memory_database() -> Result<(Database, Option<TempDir>)> {
        Ok((Database::in_memory(), None))
    }

    fn validator_rewards(validator_index: u64, slot: Slot) -> Row {
        ValidatorRewards {
            validator_index,
            epoch: slot / 8,
            slot,
            validator_balance: 32_000_000_000,
            reward: -1_500,
            max_reward: 20_000,
            attestation_reward: 18_000,
            sync_committee_reward: 0,
            proposer_reward: 2_000,
            slashing_reward: 0,
            base_reward: 4_000,
            missing_source: false,
            missing_target: false,
            missing_head: true,
            status: ValidatorStatus::Active,
            proposer_api_reward: None,
            proposer_manual_reward: 2_000,
            in_sync_committee: false,
            inclusion_delay: 1,
            pool_name: Some("pool".to_owned()),
        }
        .into()
    }

    fn proposer_duty(slot: Slot, proposed: bool) -> Row {
        ProposerDuty {
            validator_index: slot % 4,
            slot,
            proposed,
        }
        .into()
    }

    #[test_case(build_persistent_database)]
    #[test_case(build_in_memory_database)]
    fn rows_are_read_back_in_insertion_order(constructor: Constructor) -> Result<()> {
        let (mut database, _temp_dir) = constructor()?;

        let rows = [validator_rewards(0, 15), validator_rewards(1, 15)];
        let duties = [proposer_duty(8, true), proposer_duty(9, false)];

        database.persist(Table::ValidatorRewards, &rows)?;
        database.persist(Table::ProposerDuties, &duties)?;

        assert_eq!(database.rows(Table::ValidatorRewards)?, rows);
        assert_eq!(database.rows(Table::ProposerDuties)?, duties);
        assert!(database.rows(Table::EpochSummary)?.is_empty());

        Ok(())
    }

    #[test_case(build_persistent_database)]
    #[test_case(build_in_memory_database)]
    fn deleting_and_reinserting_a_slot_is_idempotent(constructor: Constructor) -> Result<()> {
        let (mut database, _temp_dir) = constructor()?;

        let earlier = [validator_rewards(0, 7), validator_rewards(1, 7)];
        let later = [validator_rewards(0, 15), validator_rewards(1, 15)];

        database.persist(Table::ValidatorRewards, &earlier)?;
        database.persist(Table::ValidatorRewards, &later)?;

        let original = database.rows(Table::ValidatorRewards)?;

        database.delete_for_slot(Table::ValidatorRewards, 15)?;

        assert_eq!(database.rows(Table::ValidatorRewards)?, earlier);

        database.persist(Table::ValidatorRewards, &later)?;

        assert_eq!(database.rows(Table::ValidatorRewards)?, original);

        Ok(())
    }

    #[test_case(build_persistent_database)]
    #[test_case(build_in_memory_database)]
    fn deleting_an_unknown_slot_is_a_no_op(constructor: Constructor) -> Result<()> {
        let (mut database, _temp_dir) = constructor()?;

        database.delete_for_slot(Table::EpochSummary, 3)?;
        database.persist(Table::ProposerDuties, &[proposer_duty(8, true)])?;
        database.delete_for_slot(Table::ProposerDuties, 3)?;

        assert_eq!(database.rows(Table::ProposerDuties)?, [proposer_duty(8, true)]);

        Ok(())
    }

    #[test_case(build_persistent_database)]
    #[test_case(build_in_memory_database)]
    fn rows_of_other_tables_are_rejected(constructor: Constructor) -> Result<()> {
        let (mut database, _temp_dir) = constructor()?;

        let error = database
            .persist(Table::EpochSummary, &[proposer_duty(8, true)])
            .expect_err("proposer duties do not belong in the epoch summary table");

        assert!(matches!(
            error.downcast_ref(),
            Some(Error::TableMismatch {
                table: Table::EpochSummary,
                actual: Table::ProposerDuties,
            }),
        ));

        Ok(())
    }

    #[test_case(build_persistent_database)]
    #[test_case(build_in_memory_database)]
    fn closed_database_rejects_writes(constructor: Constructor) -> Result<()> {
        let (mut database, _temp_dir) = constructor()?;

        database.close()?;

        assert!(database.is_closed());
        assert!(database.persist(Table::ProposerDuties, &[]).is_err());
        assert!(database.delete_for_slot(Table::ProposerDuties, 8).is_err());
        assert!(database.close().is_err());

        Ok(())
    }

    fn block_rows(slot: Slot) -> [Row; 3] {
        let block = BlockSummary {
            epoch: slot / 8,
            slot,
            proposer_index: 3,
            proposed: true,
            attestation_count: 1,
            sync_committee_participants: 30,
            proposer_slashings: 0,
            attester_slashings: 0,
            withdrawal_count: 1,
            withdrawn_amount: 12_345,
            reported_reward: Some(40_000),
        };

        let attestation = AttestationRecord {
            epoch: slot / 8,
            slot,
            attestation_slot: slot - 1,
            committee_index: 0,
            beacon_block_root: H256::repeat_byte(7),
            source_epoch: 1,
            source_root: H256::repeat_byte(1),
            target_epoch: slot / 8,
            target_root: H256::repeat_byte(2),
            participants: 4,
        };

        let withdrawal = WithdrawalRecord {
            epoch: slot / 8,
            slot,
            index: 90,
            validator_index: 6,
            amount: 12_345,
        };

        [block.into(), attestation.into(), withdrawal.into()]
    }

    #[test_case(build_persistent_database)]
    #[test_case(build_in_memory_database)]
    fn block_level_rows_are_stored_and_deleted_per_slot(constructor: Constructor) -> Result<()> {
        let (mut database, _temp_dir) = constructor()?;

        let kept = block_rows(17);
        let replaced = block_rows(18);

        for row in kept.iter().chain(&replaced) {
            database.persist(row.table(), core::slice::from_ref(row))?;
        }

        for (earlier, later) in kept.iter().zip(&replaced) {
            assert_eq!(
                database.rows(earlier.table())?,
                [earlier.clone(), later.clone()],
            );
        }

        for table in [Table::Blocks, Table::Attestations, Table::Withdrawals] {
            database.delete_for_slot(table, 18)?;
        }

        for row in &kept {
            assert_eq!(database.rows(row.table())?, [row.clone()]);
        }

        Ok(())
    }

    #[test]
    fn persistent_rows_survive_reopening() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let rows = [validator_rewards(4, 23)];

        let mut database = Database::persistent(temp_dir.path())?;
        database.persist(Table::ValidatorRewards, &rows)?;
        database.close()?;

        let reopened = Database::persistent(temp_dir.path())?;

        assert_eq!(reopened.rows(Table::ValidatorRewards)?, rows);

        Ok(())
    }
}
