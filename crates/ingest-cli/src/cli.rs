//! Command line definition and argument decoding

use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use ingest_asset::CommitSha;
use ingest_core::{ChangeEvent, PipelineConfig};
use std::path::PathBuf;

pub(crate) fn command() -> Command {
    Command::new("image-ingest")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Analyze image assets changed by a merged pull request")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("store-root")
                .long("store-root")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Directory holding the claim table, lookup table and objects"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .global(true)
                .default_value("pretty")
                .value_parser(["pretty", "json"])
                .help("Log output format"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Print the report as JSON"),
        )
        .subcommand(
            Command::new("run")
                .about("Process one merge event")
                .arg(
                    Arg::new("commit")
                        .long("commit")
                        .required_unless_present("event")
                        .help("Merge commit SHA"),
                )
                .arg(
                    Arg::new("base")
                        .long("base")
                        .help("Commit to diff against (defaults to the first parent)"),
                )
                .arg(
                    Arg::new("branch")
                        .long("branch")
                        .conflicts_with("ref")
                        .help("Target branch name"),
                )
                .arg(
                    Arg::new("ref")
                        .long("ref")
                        .help("Target git ref, e.g. refs/heads/main"),
                )
                .arg(
                    Arg::new("path")
                        .long("path")
                        .action(ArgAction::Append)
                        .help("Changed path (repeatable); omit to diff with git"),
                )
                .arg(
                    Arg::new("event")
                        .long("event")
                        .value_parser(value_parser!(PathBuf))
                        .conflicts_with_all(["commit", "path"])
                        .help("JSON merge event file"),
                )
                .arg(
                    Arg::new("repo")
                        .long("repo")
                        .value_parser(value_parser!(PathBuf))
                        .help("Repository to diff when the event has no path list"),
                )
                .arg(
                    Arg::new("workspace")
                        .long("workspace")
                        .value_parser(value_parser!(PathBuf))
                        .help("Checkout the image files are read from"),
                )
                .arg(
                    Arg::new("workers")
                        .long("workers")
                        .value_parser(value_parser!(usize))
                        .help("Concurrent analyses"),
                ),
        )
        .subcommand(
            Command::new("reconcile")
                .about("Release expired claims, promote interrupted writes, delete orphans"),
        )
        .subcommand(Command::new("status").about("Summarize the claim table, lookup table and objects"))
}

/// File, then environment, then flags
pub(crate) fn load_config(args: &ArgMatches) -> Result<PipelineConfig> {
    load_config_with(args, |name| std::env::var(name).ok())
}

/// [`load_config`] with environment lookups routed through `lookup`
pub(crate) fn load_config_with<F>(args: &ArgMatches, lookup: F) -> Result<PipelineConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let config = match args.get_one::<PathBuf>("config") {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => PipelineConfig::new(),
    };
    let mut config = config
        .apply_env_from(lookup)
        .context("applying environment overrides")?;

    if let Some(root) = args.get_one::<PathBuf>("store-root") {
        config = config.with_store_root(root);
    }
    if let Ok(Some(workspace)) = args.try_get_one::<PathBuf>("workspace") {
        config = config.with_workspace_root(workspace);
    }
    if let Ok(Some(workers)) = args.try_get_one::<usize>("workers") {
        config = config.with_workers(*workers);
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Build the merge event from `run` arguments
pub(crate) fn event(args: &ArgMatches, config: &PipelineConfig) -> Result<ChangeEvent> {
    if let Some(path) = args.get_one::<PathBuf>("event") {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading event {}", path.display()))?;
        return serde_json::from_str(&raw)
            .with_context(|| format!("parsing event {}", path.display()));
    }

    let Some(commit) = args.get_one::<String>("commit") else {
        bail!("either --commit or --event is required");
    };
    let mut event = ChangeEvent::new(CommitSha::new(commit).context("--commit")?)
        .with_branch(config.branch());

    if let Some(base) = args.get_one::<String>("base") {
        event = event.with_base(CommitSha::new(base).context("--base")?);
    }
    if let Some(branch) = args.get_one::<String>("branch") {
        event = event.with_branch(branch);
    }
    if let Some(git_ref) = args.get_one::<String>("ref") {
        event = event.with_ref(git_ref);
    }
    if let Some(paths) = args.get_many::<String>("path") {
        event = event.with_paths(paths.cloned());
    }
    Ok(event)
}
