type Result<T> = color_eyre::eyre::Result<T>;

mod cli;

use clap::Parser;
use eyre::eyre;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Config};
use example_harness::scenarios::{broker_group, direct_group, Examples};
use example_harness::GroupReport;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_cli(cli)?;

    info!("running examples from {}", config.bin_dir.display());
    if let Some(ref wrapper) = config.harness.wrapper {
        info!("wrapping examples with {}", wrapper.program.display());
    }

    let reports = run_groups(&config).await;

    let mut failed = 0;
    for report in &reports {
        print!("{}", report);
        failed += report.failed();
    }

    if failed > 0 {
        error!("{} case(s) failed", failed);
        return Err(eyre!("{} case(s) failed", failed));
    }

    info!("all cases passed");
    Ok(())
}

/// Runs the broker group, then the direct group, one case at a time.
async fn run_groups(config: &Config) -> Vec<GroupReport> {
    let examples = Arc::new(Examples::in_dir(&config.bin_dir));
    let filter = config.filter.as_deref();

    let groups = [
        broker_group(config.harness.clone(), examples.clone(), config.messages),
        direct_group(config.harness.clone(), examples, config.messages),
    ];

    let mut reports = Vec::with_capacity(groups.len());
    for group in groups {
        reports.push(group.run(filter).await);
    }
    reports
}
