use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};
use taskflow_engine::{BulkDriver, ContextBuilder, default_context, find_flows, load_document_file};
use taskflow_types::{BulkSpec, RunModes};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Run dependency-ordered task graphs described in YAML or JSON documents.
#[derive(Parser, Debug)]
#[command(name = "taskflow", version, about)]
struct Cli {
    /// Increase diagnostic verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the workflows in a document
    Run(RunArgs),
    /// List the workflows a document defines
    List {
        /// Path to the workflow YAML/JSON
        file: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to the workflow YAML/JSON
    file: PathBuf,

    /// Only run workflows with this name or path (repeatable)
    #[arg(short = 'F', long = "flow")]
    flows: Vec<String>,

    /// Run once per element of a collection, as <src.path>@<dst.path>
    #[arg(short = 'B', long)]
    bulk: Option<BulkSpec>,

    /// Number of workflow runs allowed at once
    #[arg(short = 'P', long, env = "TASKFLOW_PARALLEL", default_value_t = 1)]
    parallel: usize,

    #[arg(long)]
    plan: bool,
    #[arg(long)]
    apply: bool,
    #[arg(long)]
    init: bool,
    #[arg(long)]
    destroy: bool,
    /// Print the task graph before running
    #[arg(long)]
    preview: bool,

    /// Print per-task timings after each run
    #[arg(long)]
    stats: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Run(args) => run(args, cli.verbose).await,
        Command::List { file } => list(file),
    }
}

/// Filter used when `RUST_LOG` is unset; each `-v` lowers the threshold one level.
fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

fn init_tracing(verbosity: u8) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_directive(verbosity).into());
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

async fn run(args: RunArgs, verbosity: u8) -> Result<()> {
    let doc = load_document_file(&args.file)?;
    let flows = find_flows(&doc, &args.flows)?;
    let modes = RunModes {
        plan: args.plan,
        apply: args.apply,
        init: args.init,
        destroy: args.destroy,
        preview: args.preview,
        verbosity,
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling run");
                cancel.cancel();
            }
        }
    });

    let driver = BulkDriver::new(Arc::new(move || {
        default_context(ContextBuilder::new().modes(modes).cancel_token(cancel.clone()))
    }))
    .parallel(args.parallel)
    .bulk(args.bulk)
    .print_stats(args.stats);

    let summary = driver.run(&doc, &flows).await?;
    info!(file = %args.file.display(), jobs = summary.jobs, "all runs succeeded");
    Ok(())
}

fn list(file: PathBuf) -> Result<()> {
    let doc = load_document_file(&file)?;
    for flow in find_flows(&doc, &[])? {
        let path = if flow.root.is_root() { "<root>".to_string() } else { flow.root.to_string() };
        println!("{}\t{}", flow.name, path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn verbosity_sets_the_default_filter() {
        assert_eq!(default_directive(0), "info");
        assert_eq!(default_directive(1), "debug");
        assert_eq!(default_directive(2), "trace");
        assert_eq!(default_directive(5), "trace");
    }

    #[test]
    fn parses_run_options() {
        let cli = Cli::try_parse_from([
            "taskflow", "run", "flow.yaml", "-F", "deploy", "-F", "cleanup", "-B", "data.items@item", "-P", "4", "--plan", "-vv",
        ])
        .expect("parse");
        assert_eq!(cli.verbose, 2);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.flows, ["deploy", "cleanup"]);
        assert_eq!(args.bulk.expect("bulk").destination, "item");
        assert_eq!(args.parallel, 4);
        assert!(args.plan && !args.apply);
    }

    #[test]
    fn rejects_malformed_bulk() {
        let error = Cli::try_parse_from(["taskflow", "run", "flow.yaml", "-B", "no-separator"]).expect_err("bad bulk");
        assert!(error.to_string().contains("bad format for bulk"));
    }
}
