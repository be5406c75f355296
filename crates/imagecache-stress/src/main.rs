use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use imagecache::config::Config as ImageCacheConfig;
use tokio::task::JoinSet;

mod logging;
mod stresstest;
mod workloads;

use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Report errors and transactions to a local sentry sink.
    #[arg(long)]
    sentry: bool,

    /// Enable JSON logging into a no-op writer.
    #[arg(long)]
    tracing: bool,

    /// Report metrics to a local statsd sink.
    #[arg(long)]
    metrics: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let config_path = cli.config;
    let service_config = ImageCacheConfig::get(config_path.as_deref())?;

    let logging_config = logging::Config {
        backtraces: service_config.logging.enable_backtraces,
        sentry: cli.sentry,
        tracing: cli.tracing,
        metrics: cli.metrics,
    };
    // SAFETY: no other threads are running yet.
    let mut sinks = unsafe { logging::init(logging_config)? };
    if !cli.tracing {
        // SAFETY: see above.
        unsafe { imagecache::logging::init_logging(&service_config) };
    }
    if let Some(ref statsd) = service_config.metrics.statsd {
        imagecache::metrics::configure_statsd(
            &service_config.metrics.prefix,
            statsd.as_str(),
            service_config.metrics.custom_tags.clone(),
        )?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    let result = runtime.block_on(async move {
        let mut sink_tasks = JoinSet::new();
        sinks.spawn(&mut sink_tasks)?;

        perform_stresstest(service_config, workloads, cli.duration).await?;

        let counters = &sinks.counters;
        if cli.sentry {
            println!("Sentry envelopes: {}", counters.envelopes.load(Ordering::Relaxed));
        }
        if cli.metrics {
            println!("Statsd packets: {}", counters.packets.load(Ordering::Relaxed));
        }
        anyhow::Ok(())
    });

    if let Err(ref error) = result {
        imagecache::logging::ensure_log_error(error);
    }
    result
}
