use core::{fmt::Display, num::NonZeroUsize, time::Duration};
use std::{path::PathBuf, sync::Arc};

use analyzer::{AnalyzerConfig, Error as AnalyzerError, Pool};
use anyhow::{anyhow, Result};
use clap::{error::ErrorKind, CommandFactory as _, Error as ClapError, Parser};
use types::{
    config::Config as ChainConfig,
    nonstandard::ExternalRewardPreference,
    phase0::primitives::{Slot, ValidatorIndex},
};

const DEFAULT_VALIDATOR_WORKERS: usize = 50;
const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Replays dumped beacon chain snapshots and stores the rewards every validator earned
/// against the maximum it could have earned.
#[derive(Parser)]
#[clap(verbatim_doc_comment)]
pub struct StateAnalyzerArgs {
    /// Name of the network the snapshots belong to
    /// (mainnet, gnosis, sepolia, holesky or minimal)
    #[clap(long, default_value = "mainnet")]
    network: String,

    /// Directory with `states`, `blocks`, `duties` and `rewards` subdirectories
    #[clap(long, value_name = "DIRECTORY")]
    snapshot_directory: PathBuf,

    /// Directory the JSON Lines tables are written to
    #[clap(long, value_name = "DIRECTORY")]
    output_directory: PathBuf,

    /// First slot to analyse
    #[clap(long)]
    init_slot: Slot,

    /// Last slot to analyse. The rest of its epoch is analysed too.
    #[clap(long)]
    final_slot: Slot,

    /// Number of validator workers
    #[clap(long, default_value_t = DEFAULT_VALIDATOR_WORKERS)]
    workers: usize,

    /// Number of validator tasks per epoch [default: number of workers]
    #[clap(long)]
    batches: Option<NonZeroUsize>,

    /// Rows buffered per table before they are written
    #[clap(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Times a failed request for snapshot data is retried
    #[clap(long, default_value_t = 3)]
    state_fetch_retries: u32,

    /// Delay between retries in milliseconds
    #[clap(long, default_value_t = 1000)]
    state_fetch_retry_delay: u64,

    /// Delete rows already stored for a slot before writing it again
    #[clap(long)]
    rewrite: bool,

    /// When to trust the proposer reward reported by the beacon node
    /// (strictly-positive or whenever-reported)
    #[clap(long, default_value_t = ExternalRewardPreference::default())]
    external_reward_preference: ExternalRewardPreference,

    /// JSON file with a list of `{"name": …, "validators": […]}` pools
    #[clap(long, value_name = "JSON_FILE")]
    pools_file: Option<PathBuf>,

    /// Analyse only these validators
    #[clap(long, value_delimiter = ',')]
    validator_indices: Vec<ValidatorIndex>,
}

pub struct StateAnalyzerConfig {
    pub chain_config: Arc<ChainConfig>,
    pub analyzer_config: AnalyzerConfig,
    pub snapshot_directory: PathBuf,
    pub output_directory: PathBuf,
}

impl StateAnalyzerArgs {
    pub fn try_into_config(self) -> Result<StateAnalyzerConfig> {
        let Self {
            network,
            snapshot_directory,
            output_directory,
            init_slot,
            final_slot,
            workers,
            batches,
            batch_size,
            state_fetch_retries,
            state_fetch_retry_delay,
            rewrite,
            external_reward_preference,
            pools_file,
            validator_indices,
        } = self;

        let chain_config = ChainConfig::by_name(&network)
            .ok_or_else(|| anyhow!("unknown network: {network}"))?;

        let validator_workers = NonZeroUsize::new(workers).ok_or(AnalyzerError::NoWorkers)?;

        let pools = match pools_file {
            Some(path) => serde_json::from_slice::<Vec<Pool>>(&fs_err::read(path)?)?,
            None => vec![],
        };

        let analyzer_config = AnalyzerConfig {
            init_slot,
            final_slot,
            validator_workers,
            validator_batches: batches,
            batch_size,
            state_fetch_retries,
            state_fetch_retry_delay: Duration::from_millis(state_fetch_retry_delay),
            rewrite,
            external_reward_preference,
            pools,
            validator_indices,
            ..AnalyzerConfig::default()
        };

        analyzer_config.validate()?;

        Ok(StateAnalyzerConfig {
            chain_config: Arc::new(chain_config),
            analyzer_config,
            snapshot_directory,
            output_directory,
        })
    }

    #[must_use]
    pub fn clap_error(message: impl Display) -> ClapError {
        Self::command().error(ErrorKind::ValueValidation, message)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::NamedTempFile;

    use super::*;

    const REQUIRED: [&str; 9] = [
        "state_analyzer",
        "--snapshot-directory",
        "snapshots",
        "--output-directory",
        "tables",
        "--init-slot",
        "32",
        "--final-slot",
        "95",
    ];

    fn config_from_args(arguments: &[&str]) -> Result<StateAnalyzerConfig> {
        StateAnalyzerArgs::try_parse_from(REQUIRED.iter().chain(arguments).copied())?
            .try_into_config()
    }

    #[test]
    fn defaults_match_the_analyzer_defaults() -> Result<()> {
        let config = config_from_args(&[])?;

        assert_eq!(config.chain_config.config_name, "mainnet");
        assert_eq!(
            config.analyzer_config,
            AnalyzerConfig {
                init_slot: 32,
                final_slot: 95,
                ..AnalyzerConfig::default()
            },
        );

        Ok(())
    }

    #[test]
    fn options_are_mapped_onto_the_analyzer_config() -> Result<()> {
        let config = config_from_args(&[
            "--network",
            "minimal",
            "--workers",
            "4",
            "--batches",
            "8",
            "--rewrite",
            "--external-reward-preference",
            "whenever-reported",
            "--validator-indices",
            "7,3",
        ])?;

        let analyzer_config = &config.analyzer_config;

        assert_eq!(config.chain_config.config_name, "minimal");
        assert_eq!(analyzer_config.validator_workers.get(), 4);
        assert_eq!(analyzer_config.validator_batch_count().get(), 8);
        assert!(analyzer_config.rewrite);
        assert_eq!(
            analyzer_config.external_reward_preference,
            ExternalRewardPreference::WheneverReported,
        );
        assert_eq!(analyzer_config.validator_indices, [7, 3]);

        Ok(())
    }

    #[test]
    fn pools_are_read_from_a_file() -> Result<()> {
        let file = NamedTempFile::new()?;

        fs_err::write(file.path(), r#"[{"name": "lido", "validators": [1, 2]}]"#)?;

        let path = file.path().to_string_lossy().into_owned();
        let config = config_from_args(&["--pools-file", &path])?;

        assert_eq!(
            config.analyzer_config.pools,
            [Pool {
                name: "lido".to_owned(),
                validators: vec![1, 2],
            }],
        );

        Ok(())
    }

    #[test]
    fn zero_workers_are_rejected() {
        let error = config_from_args(&["--workers", "0"])
            .err()
            .and_then(|error| error.downcast::<AnalyzerError>().ok());

        assert!(matches!(error, Some(AnalyzerError::NoWorkers)));
    }

    #[test]
    fn unknown_networks_are_rejected() {
        assert!(config_from_args(&["--network", "goerli"]).is_err());
    }
}
