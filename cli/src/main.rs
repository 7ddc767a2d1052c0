/// FlowK CLI - command-line interface for the flow automation engine
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use flowk_core::{
    register_builtin_actions, ActionRegistry, DefinitionLoader, EventHub, FlowRunner, FlowkConfig,
    RunOptions,
};
use flowk_server::FlowServer;

#[derive(Parser)]
#[command(name = "flowk")]
#[command(about = "JSON-driven flow automation engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a flow definition
    Run(RunArgs),

    /// Print version information
    Version,

    /// Print build information and the registered action set
    Info {
        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Path to the flow definition file
    #[arg(long)]
    flow: PathBuf,

    /// Skip tasks until this task id is reached
    #[arg(
        long = "begin-from-task",
        conflicts_with_all = ["run_task", "run_subtask", "run_flow"]
    )]
    begin_from_task: Option<String>,

    /// Execute only the top-level task with this id
    #[arg(long = "run-task", conflicts_with_all = ["run_subtask", "run_flow"])]
    run_task: Option<String>,

    /// Execute only the composite child with this id
    #[arg(long = "run-subtask", conflicts_with = "run_flow")]
    run_subtask: Option<String>,

    /// Execute only tasks contributed by this flow id
    #[arg(long = "run-flow")]
    run_flow: Option<String>,

    /// Validate the definition and exit without running
    #[arg(
        long = "validate-only",
        conflicts_with_all = ["begin_from_task", "run_task", "run_subtask", "run_flow", "serve_ui"]
    )]
    validate_only: bool,

    /// Serve the HTTP surface for the visual UI instead of running once
    #[arg(long = "serve-ui")]
    serve_ui: bool,

    /// Config file path
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            let message = format!("error: {error}");
            if atty::is(atty::Stream::Stderr) {
                eprintln!("{}", message.red());
            } else {
                eprintln!("{message}");
            }
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Version => {
            println!("flowk {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Info { config } => info(config.as_deref()),
    }
}

fn init_tracing(filter: &str) {
    use tracing_subscriber::EnvFilter;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_registry() -> anyhow::Result<Arc<ActionRegistry>> {
    let mut registry = ActionRegistry::new();
    register_builtin_actions(&mut registry)?;
    Ok(Arc::new(registry))
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = FlowkConfig::load(args.config.as_deref())?;
    init_tracing(&config.logging.filter);

    let registry = build_registry()?;

    if args.validate_only {
        let loader = DefinitionLoader::new(&registry);
        let definition = loader.load(&args.flow)?;
        println!(
            "{} is valid: flow '{}' with {} tasks",
            args.flow.display(),
            definition.id,
            definition.tasks.len()
        );
        return Ok(());
    }

    let hub = Arc::new(EventHub::new());
    let runner = FlowRunner::new(
        registry.clone(),
        hub.clone(),
        &args.flow,
        &config.storage.log_dir,
    );

    if args.serve_ui {
        let server = FlowServer::new(&config, runner, hub, registry);
        server.run().await?;
        return Ok(());
    }

    let options = RunOptions {
        begin_from: args.begin_from_task,
        run_task: args.run_task,
        run_subtask: args.run_subtask,
        run_flow: args.run_flow,
        resume_from: None,
    };
    let handle = runner.start(options)?;
    handle.await??;
    println!("flow completed");
    Ok(())
}

fn info(config_path: Option<&std::path::Path>) -> anyhow::Result<()> {
    let config = FlowkConfig::load(config_path)?;
    let registry = build_registry()?;

    println!("flowk {}", env!("CARGO_PKG_VERSION"));
    println!(
        "config: {}",
        config_path
            .map(|p| p.display().to_string())
            .or_else(|| FlowkConfig::default_path().map(|p| p.display().to_string()))
            .unwrap_or_else(|| "<defaults>".to_string())
    );
    println!("log dir: {}", config.storage.log_dir.display());
    println!("server: {}", config.bind_address());
    println!("actions: {}", registry.names().join(", "));
    Ok(())
}
