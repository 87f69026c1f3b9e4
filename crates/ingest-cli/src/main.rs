//! `image-ingest`: run the ingestion pipeline for a merge event
//!
//! Exit codes: 0 when every asset was written or skipped, 1 when any asset
//! failed permanently, 2 when the run could not proceed at all.

mod cli;

use anyhow::{Context, Result};
use clap::ArgMatches;
use ingest_core::{GitDiffSource, Pipeline, RunReport, Stores};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const EXIT_FATAL: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let matches = cli::command().get_matches();
    let json_logs = matches
        .get_one::<String>("log-format")
        .is_some_and(|f| f == "json");
    init_tracing(json_logs);

    let outcome = match matches.subcommand() {
        Some(("run", args)) => run(args).await,
        Some(("reconcile", args)) => reconcile(args).await,
        Some(("status", args)) => status(args).await,
        _ => unreachable!("subcommand is required"),
    };

    match outcome {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(args: &ArgMatches) -> Result<u8> {
    let config = cli::load_config(args)?;
    let event = cli::event(args, &config)?;

    // Event paths still win; the repository also expands abbreviated commits.
    let repo = args
        .get_one::<std::path::PathBuf>("repo")
        .cloned()
        .unwrap_or_else(|| config.workspace_root.clone());
    let pipeline = Pipeline::new(config.clone(), Stores::filesystem(&config))?
        .with_diff_source(Arc::new(GitDiffSource::new(repo)));

    let report = pipeline.run(&event).await.context("pipeline run")?;
    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(u8::try_from(report.exit_code()).unwrap_or(1))
}

fn print_report(report: &RunReport) {
    println!("run {} commit {} ({})", report.run_id, report.commit, report.branch);
    for asset in &report.assets {
        println!(
            "  {:<48} {} [{} attempt(s), {}ms]",
            asset.key.as_str(),
            asset.outcome,
            asset.attempts,
            asset.elapsed_ms
        );
    }
    let counts = report.counts();
    println!(
        "written {} skipped {} rejected {} failed {}",
        counts.written, counts.skipped, counts.rejected, counts.failed
    );
}

async fn reconcile(args: &ArgMatches) -> Result<u8> {
    let config = cli::load_config(args)?;
    let pipeline = Pipeline::new(config.clone(), Stores::filesystem(&config))?;
    let sweep = pipeline.reconciler().sweep().await.context("reconciliation sweep")?;

    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&sweep)?);
    } else {
        println!(
            "promoted {} released {} orphans deleted {} contended {}",
            sweep.promoted.len(),
            sweep.released.len(),
            sweep.orphans_deleted.len(),
            sweep.contended
        );
    }
    Ok(0)
}

async fn status(args: &ArgMatches) -> Result<u8> {
    let config = cli::load_config(args)?;
    let stores = Stores::filesystem(&config);
    let status = stores
        .status(&config.object_prefix)
        .await
        .context("reading stores")?;

    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("claims    live {} expired {} succeeded {} failed {}", status.claimed, status.expired, status.succeeded, status.failed);
        println!("rows      success {} failure {}", status.rows_success, status.rows_failure);
        println!("objects   {}", status.objects);
    }
    Ok(0)
}
