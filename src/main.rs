// Copyright 2026 Pagespec Contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use pagespec::config::ScrapeConfig;
use pagespec::coordinator::ScrapeCoordinator;
use pagespec::report::{self, FailureReport, ScrapeReport};
use pagespec::session::chromium::ChromiumSessionFactory;
use pagespec::stealth;

#[derive(Parser)]
#[command(
    name = "pagespec",
    about = "Pagespec — interaction-aware page analyzer for scraper generation",
    version,
    after_help = "Run 'pagespec <command> --help' for details on each command."
)]
struct Cli {
    /// Run the browser with a visible window
    #[arg(long, global = true)]
    headed: bool,

    /// Disable stealth measures (user-agent rotation, masking script)
    #[arg(long, global = true)]
    no_stealth: bool,

    /// Proxy server, e.g. "http://127.0.0.1:8080"
    #[arg(long, global = true)]
    proxy: Option<String>,

    /// Maximum attempts per URL
    #[arg(long, default_value = "3", global = true)]
    retries: u32,

    /// Maximum disclosure nesting depth to expand
    #[arg(long, default_value = "3", global = true)]
    depth: u32,

    /// Skip element interaction (observe the page as-is)
    #[arg(long, global = true)]
    no_interact: bool,

    /// Skip mutation/network monitoring
    #[arg(long, global = true)]
    no_monitor: bool,

    /// Write the JSON report here instead of stdout
    #[arg(long, short, global = true)]
    output: Option<PathBuf>,

    /// Enable verbose/debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a single URL
    Analyze {
        /// Target URL (http or https)
        url: String,
    },
    /// Analyze multiple URLs sequentially
    Batch {
        /// Target URLs
        urls: Vec<String>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase", untagged)]
enum BatchEntry {
    Report(Box<ScrapeReport>),
    Failure(Box<FailureReport>),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchReport {
    total_urls: usize,
    successful: usize,
    failed: usize,
    success_rate: f64,
    average_expandable_elements: f64,
    average_interactions: f64,
    results: BTreeMap<String, BatchEntry>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "pagespec=debug" } else { "pagespec=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_level.parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = ScrapeConfig {
        headless: !cli.headed,
        stealth: !cli.no_stealth,
        proxy: cli.proxy.clone(),
        max_retries: cli.retries,
        max_expansion_depth: cli.depth,
        interact_with_elements: !cli.no_interact,
        monitor_content: !cli.no_monitor,
        ..ScrapeConfig::default()
    };

    let result = tokio::select! {
        result = run(&cli, &config) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, shutting down");
            return Ok(());
        }
    };
    result
}

async fn run(cli: &Cli, config: &ScrapeConfig) -> Result<()> {
    let factory = Arc::new(
        ChromiumSessionFactory::launch(config)
            .await
            .context("failed to launch browser")?,
    );
    let coordinator = ScrapeCoordinator::new(config.clone(), factory);

    // A failed single-URL run still emits its document (error tag plus
    // whatever partial attempt data exists) before exiting nonzero.
    let (json, run_error) = match &cli.command {
        Commands::Analyze { url } => match coordinator.scrape(url).await {
            Ok(outcome) => {
                let scrape_report = report::build(outcome, config.stealth);
                (serde_json::to_string_pretty(&scrape_report)?, None)
            }
            Err(failure) => {
                let message = failure.error.to_string();
                let failure_report = report::build_failure(url, failure);
                (serde_json::to_string_pretty(&failure_report)?, Some(message))
            }
        },
        Commands::Batch { urls } => {
            anyhow::ensure!(!urls.is_empty(), "batch needs at least one URL");
            let batch = run_batch(&coordinator, urls, config).await;
            (serde_json::to_string_pretty(&batch)?, None)
        }
    };

    match &cli.output {
        Some(path) => {
            std::fs::write(path, &json)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), "report written");
        }
        None => println!("{json}"),
    }

    match run_error {
        Some(message) => Err(anyhow::anyhow!(message)),
        None => Ok(()),
    }
}

async fn run_batch(
    coordinator: &ScrapeCoordinator,
    urls: &[String],
    config: &ScrapeConfig,
) -> BatchReport {
    let mut results = BTreeMap::new();
    let mut successful = 0;
    let mut expandable_total = 0usize;
    let mut interaction_total = 0usize;

    for (index, url) in urls.iter().enumerate() {
        if index > 0 {
            stealth::human_delay(2.0, 5.0).await;
        }
        info!(url, position = index + 1, total = urls.len(), "batch item");
        match coordinator.scrape(url).await {
            Ok(outcome) => {
                let scrape_report = report::build(outcome, config.stealth);
                successful += 1;
                expandable_total += scrape_report.structure_analysis.expandable_elements;
                interaction_total += scrape_report.interaction_summary.total_interactions;
                results.insert(url.clone(), BatchEntry::Report(Box::new(scrape_report)));
            }
            Err(failure) => {
                warn!(url, error = %failure, "batch item failed");
                results.insert(
                    url.clone(),
                    BatchEntry::Failure(Box::new(report::build_failure(url, failure))),
                );
            }
        }
    }

    let denominator = successful.max(1) as f64;
    BatchReport {
        total_urls: urls.len(),
        successful,
        failed: urls.len() - successful,
        success_rate: successful as f64 / urls.len().max(1) as f64,
        average_expandable_elements: expandable_total as f64 / denominator,
        average_interactions: interaction_total as f64 / denominator,
        results,
    }
}
