use core::future::Future;
use std::{process::ExitCode, sync::Arc};

use analyzer::Analyzer;
use anyhow::Result;
use beacon_api::SnapshotDirectory;
use clap::{Error as ClapError, Parser as _};
use database::Database;
use log::{error, info, warn};
use parking_lot::Mutex;
use tokio::{runtime::Builder, select};
use tokio_util::sync::CancellationToken;

use crate::state_analyzer_args::{StateAnalyzerArgs, StateAnalyzerConfig};

mod state_analyzer_args;

fn main() -> ExitCode {
    if let Err(error) = try_main() {
        error.downcast_ref().map(ClapError::exit);
        error!("{error:?}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn try_main() -> Result<()> {
    binary_utils::initialize_logger(module_path!(), cfg!(feature = "logger-always-write-style"))?;

    let config = StateAnalyzerArgs::try_parse()?
        .try_into_config()
        .map_err(StateAnalyzerArgs::clap_error)?;

    block_on(run(config))
}

async fn run(config: StateAnalyzerConfig) -> Result<()> {
    let StateAnalyzerConfig {
        chain_config,
        analyzer_config,
        snapshot_directory,
        output_directory,
    } = config;

    info!("replaying snapshots from {}", snapshot_directory.display());

    let fetcher = SnapshotDirectory::new(snapshot_directory);
    let store = Arc::new(Mutex::new(Database::persistent(output_directory)?));
    let cancel = CancellationToken::new();

    let analyzer = Analyzer::new(
        chain_config,
        analyzer_config,
        fetcher,
        store,
        cancel.clone(),
    );

    let analysis = tokio::spawn(analyzer.run());

    tokio::spawn(async move {
        select! {
            result = wait_for_signal() => match result {
                Ok(()) => {
                    warn!("received a signal, stopping the analysis");
                    cancel.cancel();
                }
                Err(error) => error!("failed to listen for signals: {error:?}"),
            },
            () = cancel.cancelled() => {}
        }
    });

    let report = analysis.await??;

    if !report.abandoned_epochs.is_empty() {
        warn!("epochs to reprocess: {:?}", report.abandoned_epochs);
    }

    if report.rows_lost > 0 {
        warn!("{} rows could not be stored", report.rows_lost);
    }

    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

fn block_on(future: impl Future<Output = Result<()>>) -> Result<()> {
    Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(future)
}
