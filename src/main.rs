use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use graphex_core::config::AppConfig;
use graphex_core::event::{Event, EventKind};
use graphex_core::node::NodeValues;
use graphex_core::{NodeStatus, RunStatus};
use graphex_engine::{Engine, RunSummary};
use graphex_graph::{validate_with, GraphDocument, ValidatedGraph};
use graphex_nodes::NodeTypeRegistry;

#[derive(Parser)]
#[command(
    name = "graphex",
    version,
    about = "Typed dataflow graphs for network and system automation"
)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "graphex.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP/WebSocket gateway
    Serve,
    /// Run a graph file and stream its events
    Run {
        /// Graph document (JSON)
        graph: PathBuf,
        /// Graph input as name=value; the value is parsed as JSON when it can be
        #[arg(short, long = "input", value_parser = parse_input)]
        inputs: Vec<(String, Value)>,
        /// Override the configured concurrency limit
        #[arg(long)]
        concurrency: Option<usize>,
        /// Only print the final summary
        #[arg(short, long)]
        quiet: bool,
    },
    /// Check a graph file without running it
    Validate {
        /// Graph document (JSON)
        graph: PathBuf,
    },
    /// List available node types
    Types,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("graphex=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "graphex", &mut std::io::stdout());
        return Ok(());
    }

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        AppConfig::load_default()?
    };
    config.validate()?;

    let registry = Arc::new(NodeTypeRegistry::with_builtins());
    let engine = Arc::new(Engine::new(registry.clone(), &config));

    match cli.command {
        Commands::Serve => {
            info!(bind = %config.gateway.bind, "Starting gateway");
            let server =
                graphex_gateway::GatewayServer::new(config.gateway.clone(), engine, registry);
            let cancel = tokio_util::sync::CancellationToken::new();
            let cancel_clone = cancel.clone();

            // Graceful shutdown on Ctrl-C
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down gateway...");
                cancel_clone.cancel();
            });

            server.run(cancel).await?;
        }
        Commands::Run {
            graph,
            inputs,
            concurrency,
            quiet,
        } => {
            let graph = load_graph(&graph, &engine)?;
            let inputs: NodeValues = inputs.into_iter().collect();
            let summary = run_once(&engine, &graph, inputs, concurrency, quiet).await?;
            print_summary(&summary);
            if summary.status != RunStatus::Succeeded {
                anyhow::bail!("run {} {}", summary.run_id, summary.status);
            }
        }
        Commands::Validate { graph } => {
            let graph = load_graph(&graph, &engine)?;
            println!(
                "Graph '{}' is valid: {} nodes, {} edges",
                graph.name(),
                graph.len(),
                graph.edges().len()
            );
            for (i, layer) in graph.topological_layers().enumerate() {
                let ids: Vec<&str> = layer.iter().map(|id| id.as_str()).collect();
                println!("  layer {}: {}", i, ids.join(", "));
            }
        }
        Commands::Types => {
            for info in registry.definitions() {
                println!(
                    "{:<18} {:<10} {}",
                    info.type_tag, info.category, info.description
                );
            }
        }
        Commands::Config => {
            let mut shown = config.clone();
            for value in shown.secrets.values_mut() {
                *value = "********".to_string();
            }
            println!("{}", toml::to_string_pretty(&shown)?);
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

fn parse_input(s: &str) -> Result<(String, Value), String> {
    let (name, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{}'", s))?;
    if name.is_empty() {
        return Err(format!("missing input name in '{}'", s));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((name.to_string(), value))
}

fn load_graph(path: &Path, engine: &Engine) -> anyhow::Result<ValidatedGraph> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {}", path.display(), e))?;
    let doc = GraphDocument::from_json(&json)?;
    let graph = doc.build(engine.catalog().as_ref())?;
    Ok(validate_with(graph, &engine.coercion())?)
}

async fn run_once(
    engine: &Engine,
    graph: &ValidatedGraph,
    inputs: NodeValues,
    concurrency: Option<usize>,
    quiet: bool,
) -> anyhow::Result<RunSummary> {
    let run_id = engine.submit_run(graph, inputs, concurrency)?;
    let mut events = engine.subscribe(&run_id)?;

    // Ctrl-C cancels the run; the summary still prints
    let printer = async {
        while let Some(event) = events.recv().await {
            if !quiet {
                print_event(&event);
            }
        }
    };
    tokio::select! {
        _ = printer => {}
        _ = tokio::signal::ctrl_c() => {
            warn!(run_id = %run_id, "Interrupted, cancelling run");
            engine.cancel_run(&run_id)?;
        }
    }

    Ok(engine.wait(&run_id).await?)
}

fn print_event(event: &Event) {
    match &event.kind {
        EventKind::RunStarted {
            graph_name,
            node_count,
        } => {
            eprintln!("[run {}] {} ({} nodes)", event.run_id, graph_name, node_count);
        }
        EventKind::NodeTransition {
            node_id,
            new_status,
            error_message,
            ..
        } => match error_message {
            Some(message) => eprintln!("[{}] {}: {}", node_id, new_status, message),
            None => eprintln!("[{}] {}", node_id, new_status),
        },
        EventKind::NodeLog {
            node_id, message, ..
        } => {
            eprintln!("  {} | {}", node_id, message);
        }
        EventKind::RunError { error_kind, message } => {
            eprintln!("[run error: {}] {}", error_kind, message);
        }
        EventKind::Overflow { dropped } => {
            eprintln!("[{} events dropped]", dropped);
        }
        EventKind::RunFinished { .. } => {}
    }
}

fn print_summary(summary: &RunSummary) {
    let counts: Vec<String> = [
        NodeStatus::Succeeded,
        NodeStatus::Failed,
        NodeStatus::Skipped,
        NodeStatus::Cancelled,
    ]
    .into_iter()
    .map(|s| (s, summary.count(s)))
    .filter(|(_, n)| *n > 0)
    .map(|(s, n)| format!("{} {}", n, s))
    .collect();
    println!(
        "Run {} {} ({})",
        summary.run_id,
        summary.status,
        counts.join(", ")
    );
}
