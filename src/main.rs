use std::{process::ExitCode, sync::Arc, time::Duration};

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mandi::{
    config::MandiConfig,
    error::MandiResult,
    fetch::HttpFetcher,
    metrics,
    pipeline::{PipelineKernel, PipelineKind},
    sched::{Scheduler, schedules, today_ist},
};

#[derive(Debug, Parser)]
#[command(name = "mandi", about = "Market data ingestion pipelines for NSE/BSE")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the cron scheduler with the standing pipeline schedule.
    Deploy,
    /// Run one pipeline immediately for a date or a date range.
    Trigger {
        /// Pipeline name (e.g. equity-daily, combined-equity).
        pipeline: PipelineKind,
        /// Trading date (defaults to today in IST).
        date: Option<NaiveDate>,
        /// Start of an inclusive date range.
        #[arg(long, requires = "to")]
        from: Option<NaiveDate>,
        /// End of an inclusive date range.
        #[arg(long, requires = "from")]
        to: Option<NaiveDate>,
    },
    /// List the registered pipelines and their schedules.
    List,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "fatal");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> MandiResult<ExitCode> {
    let config = Arc::new(MandiConfig::from_env()?);

    match cli.command {
        Command::List => {
            for schedule in schedules() {
                println!(
                    "{:<24} {:<24} {}",
                    schedule.kind.as_str(),
                    schedule.cron,
                    schedule.description
                );
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Deploy => {
            metrics::install_recorder(config.metrics.port)?;
            if let Some(uri) = &config.pipeline.mlflow_tracking_uri {
                tracing::info!(uri = %uri, "mlflow_tracking_configured");
            }

            let fetcher = Arc::new(HttpFetcher::new(Duration::from_secs(120))?);
            let kernel = Arc::new(PipelineKernel::new(config, fetcher).with_warehouse()?);
            let scheduler = Scheduler::new(kernel);
            scheduler.deploy().await?;

            // Jobs fire until the process is stopped.
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("scheduler_stopped");
            Ok(ExitCode::SUCCESS)
        }

        Command::Trigger {
            pipeline,
            date,
            from,
            to,
        } => {
            metrics::install_recorder(config.metrics.port)?;
            let fetcher = Arc::new(HttpFetcher::new(Duration::from_secs(120))?);
            let kernel = Arc::new(PipelineKernel::new(config, fetcher).with_warehouse()?);
            let scheduler = Scheduler::new(kernel);

            let dates: Vec<NaiveDate> = match (from, to) {
                (Some(from), Some(to)) => from.iter_days().take_while(|d| *d <= to).collect(),
                _ => vec![date.unwrap_or_else(today_ist)],
            };

            let mut succeeded = 0usize;
            for trade_date in &dates {
                let run = scheduler.trigger(pipeline, *trade_date).await;
                if run.is_success() {
                    succeeded += 1;
                }
            }

            tracing::info!(
                pipeline = pipeline.as_str(),
                dates = dates.len(),
                succeeded,
                "trigger_complete"
            );
            // 0 all succeeded, 1 all failed, 2 partial.
            Ok(if succeeded == dates.len() {
                ExitCode::SUCCESS
            } else if succeeded == 0 {
                ExitCode::from(1)
            } else {
                ExitCode::from(2)
            })
        }
    }
}
