use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use log::trace;
use serde::de::DeserializeOwned;
use types::{
    nonstandard::BlockRewards,
    phase0::primitives::{Epoch, Slot},
    snapshot::{AgnosticBlock, AgnosticState, EpochDuties},
};

use crate::{
    error::{FetchError, Resource},
    fetcher::Fetcher,
};

/// Replays snapshots dumped as JSON files:
///
/// ```text
/// <root>/states/<slot>.json
/// <root>/blocks/<slot>.json
/// <root>/duties/<epoch>.json
/// <root>/rewards/<slot>.json
/// ```
///
/// A missing file is reported as [`FetchError::NotFound`].
pub struct SnapshotDirectory {
    root: PathBuf,
}

impl SnapshotDirectory {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn path(&self, resource: Resource, id: u64) -> PathBuf {
        let subdirectory = match resource {
            Resource::Block => "blocks",
            Resource::BlockRewards => "rewards",
            Resource::Duties => "duties",
            Resource::State => "states",
        };

        self.root.join(subdirectory).join(format!("{id}.json"))
    }

    async fn read<T: DeserializeOwned>(&self, resource: Resource, id: u64) -> Result<T> {
        let path = self.path(resource, id);

        trace!("reading {resource} {id} from {}", path.display());

        let bytes = match fs_err::tokio::read(&path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(FetchError::NotFound { resource, id }.into());
            }
            Err(error) => {
                return Err(FetchError::Transport {
                    resource,
                    id,
                    message: error.to_string(),
                }
                .into());
            }
        };

        serde_json::from_slice(bytes.as_slice())
            .with_context(|| format!("failed to decode {resource} {id}"))
    }
}

#[async_trait]
impl Fetcher for SnapshotDirectory {
    async fn get_block(&self, slot: Slot) -> Result<AgnosticBlock> {
        self.read(Resource::Block, slot).await
    }

    async fn get_state(&self, slot: Slot) -> Result<AgnosticState> {
        self.read(Resource::State, slot).await
    }

    async fn get_committees_and_duties(&self, epoch: Epoch) -> Result<EpochDuties> {
        self.read(Resource::Duties, epoch).await
    }

    async fn get_block_reward_report(&self, slot: Slot) -> Result<BlockRewards> {
        self.read(Resource::BlockRewards, slot).await
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use types::phase0::{containers::BeaconCommittee, primitives::H256};

    use crate::error::is_not_found;

    use super::*;

    fn write_json(directory: &SnapshotDirectory, resource: Resource, id: u64, json: &str) -> Result<()> {
        let path = directory.path(resource, id);

        if let Some(parent) = path.parent() {
            fs_err::create_dir_all(parent)?;
        }

        fs_err::write(path, json)?;

        Ok(())
    }

    #[tokio::test]
    async fn reads_dumped_resources() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let directory = SnapshotDirectory::new(temp_dir.path());

        let state = AgnosticState {
            epoch: 2,
            slot: 23,
            state_root: H256::repeat_byte(4),
            balances: vec![32_000_000_000],
            ..AgnosticState::default()
        };

        let duties = EpochDuties::new(
            vec![BeaconCommittee {
                slot: 16,
                index: 0,
                validators: vec![0],
            }],
            vec![],
        );

        write_json(&directory, Resource::State, 23, &serde_json::to_string(&state)?)?;
        write_json(&directory, Resource::Duties, 2, &serde_json::to_string(&duties)?)?;

        assert_eq!(directory.get_state(23).await?, state);
        assert_eq!(directory.get_committees_and_duties(2).await?, duties);

        Ok(())
    }

    #[tokio::test]
    async fn missing_files_are_not_found() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let directory = SnapshotDirectory::new(temp_dir.path());

        let block_error = directory
            .get_block(5)
            .await
            .expect_err("block 5 was never dumped");

        let rewards_error = directory
            .get_block_reward_report(5)
            .await
            .expect_err("rewards for slot 5 were never dumped");

        assert!(is_not_found(&block_error));
        assert!(is_not_found(&rewards_error));

        Ok(())
    }

    #[tokio::test]
    async fn malformed_files_are_not_mistaken_for_absent_data() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let directory = SnapshotDirectory::new(temp_dir.path());

        write_json(&directory, Resource::Block, 9, "{\"slot\": ")?;

        let error = directory
            .get_block(9)
            .await
            .expect_err("truncated JSON cannot be decoded");

        assert!(!is_not_found(&error));

        Ok(())
    }
}
