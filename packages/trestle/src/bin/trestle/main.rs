//! The binary entrypoint for `trestle`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::{Result, eyre::Context, eyre::bail};
use tracing::instrument;
use tracing_subscriber::util::SubscriberInitExt;
use trestle::{
    events::RunCommandEvent,
    graph::WorkspaceGraph,
    manifest,
    path::AbsDirPath,
    plan::{Mode, RunOptions, StdioMode},
    scheduler::{Scheduler, WatchOptions},
    vcs::GitProbe,
};

// Since this is a binary crate, we need to ensure these modules aren't pub
// so that they can correctly warn about dead code:
// https://github.com/rust-lang/rust/issues/74970
//
// Relatedly, in this file specifically nothing should be `pub`.
mod log;

#[derive(Clone, Debug, Parser)]
#[command(name = "trestle", about = "Monorepo task orchestrator", version)]
struct TopLevelFlags {
    #[command(subcommand)]
    command: Command,

    /// When to colorize output
    #[arg(long, value_enum, default_value_t = log::WhenColor::Auto)]
    color: log::WhenColor,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Run a target across the workspace graph
    Run(RunArgs),
}

#[derive(Clone, Debug, clap::Args)]
struct RunArgs {
    /// The target name to run, e.g. `build` or `lint`
    target: String,

    #[arg(long, value_enum, default_value_t = ModeArg::Parallel)]
    mode: ModeArg,

    /// Ignore the cache and re-run every selected workspace
    #[arg(long)]
    force: bool,

    /// Only run workspaces affected since this revision
    #[arg(long)]
    since: Option<String>,

    /// Upper bound of the affected revision range (default: working tree)
    #[arg(long, requires = "since")]
    until: Option<String>,

    /// Topological mode only: run up to (and including) this workspace
    #[arg(long)]
    to: Option<String>,

    /// Parallel mode only: restrict the run to these workspaces
    #[arg(long = "workspace")]
    workspaces: Vec<String>,

    /// Maximum number of tasks running concurrently within a step
    #[arg(long, env = "RUN_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Connect child-process stdio directly to this process's own
    #[arg(long)]
    inherit_stdio: bool,

    /// Keep running, rescheduling the affected subgraph on source changes
    #[arg(long)]
    watch: bool,

    /// Debounce window for watch-mode filesystem events
    #[arg(long, env = "RUN_DEBOUNCE_MS", default_value_t = 200)]
    debounce_ms: u64,

    /// Extra environment variables to set for every command, `KEY=VALUE`
    #[arg(long = "env", value_parser = parse_env_kv)]
    env: Vec<(String, String)>,

    /// Extra arguments appended to every command this run invokes
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, clap::ValueEnum)]
enum ModeArg {
    Parallel,
    Topological,
}

fn parse_env_kv(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))
}

#[instrument]
#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let top = TopLevelFlags::parse();

    log::make_logger(std::io::stderr, top.color).init();

    let Command::Run(args) = top.command;
    run(args).await
}

async fn run(args: RunArgs) -> Result<()> {
    let project_root = AbsDirPath::current().context("resolve current directory")?;
    let workspaces = manifest::load_project(&project_root)
        .await
        .context("load project manifests")?;
    let graph = Arc::new(WorkspaceGraph::new(workspaces)?);
    let vcs = Arc::new(GitProbe::new(project_root.clone()));
    let scheduler = Scheduler::new(graph, vcs, Arc::new(project_root));

    let options = RunOptions {
        mode: match args.mode {
            ModeArg::Parallel => Mode::Parallel,
            ModeArg::Topological => Mode::Topological,
        },
        force: args.force,
        affected: args.since.map(|rev1| (rev1, args.until)),
        stdio: if args.inherit_stdio {
            StdioMode::Inherit
        } else {
            StdioMode::Capture
        },
        to: args.to,
        workspaces: if args.workspaces.is_empty() {
            None
        } else {
            Some(args.workspaces.into_iter().collect::<BTreeSet<_>>())
        },
        concurrency: args.concurrency,
    };

    let env: HashMap<String, String> = args.env.into_iter().collect();
    let watch = args.watch.then_some(WatchOptions {
        debounce_ms: args.debounce_ms,
    });

    let handle = scheduler
        .run_command(&args.target, options, args.args, env, watch)
        .context("begin run_command")?;

    let mut failed = false;
    let mut stream_errored = false;
    while let Some(event) = handle.next().await {
        match event {
            Ok(event) => {
                if matches!(event, RunCommandEvent::NodeErrored { .. }) {
                    failed = true;
                }
                println!("{}", serde_json::to_string(&event).expect("event always serializes"));
            }
            Err(err) => {
                eprintln!("{err:?}");
                stream_errored = true;
                break;
            }
        }
    }

    if failed || stream_errored {
        bail!("run_command reported a failure");
    }
    Ok(())
}
