use std::io::{IsTerminal as _, Write as _};

use anyhow::Result;
use chrono::{Local, SecondsFormat};
use env_logger::{Builder, Env, WriteStyle};
use log::LevelFilter;

const LOG_ENVIRONMENT_VARIABLE: &str = "STATE_ANALYZER_LOG";

const WORKSPACE_CRATES: &[&str] = &[
    "analyzer",
    "beacon_api",
    "binary_utils",
    "database",
    "helper_functions",
    "reward_metrics",
    "state_cache",
];

/// Logs crates of this workspace at `info` by default.
/// Directives in `STATE_ANALYZER_LOG` take precedence.
pub fn initialize_logger(module_path: &str, always_write_style: bool) -> Result<()> {
    let mut builder = Builder::new();

    builder.filter_level(LevelFilter::Off);

    for crate_name in WORKSPACE_CRATES.iter().copied().chain([module_path]) {
        builder.filter_module(crate_name, LevelFilter::Info);
    }

    builder
        .parse_env(Env::new().filter(LOG_ENVIRONMENT_VARIABLE))
        .format(|formatter, record| {
            writeln!(
                formatter,
                "[{}] {:<5} {}: {}",
                Local::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                record.level(),
                record.target(),
                record.args(),
            )
        });

    if always_write_style || std::io::stderr().is_terminal() {
        builder.write_style(WriteStyle::Always);
    }

    builder.try_init().map_err(Into::into)
}
