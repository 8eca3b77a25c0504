use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{Context, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use nodeboard::{
    backend::{EchoAgent, InMemorySections},
    board::Board,
    config::{BoardConfig, resolve_root_dir},
    graph::EdgeDirection,
    logger::init_tracing,
    message::Message,
    node::{NodeKind, NodeRef},
    observer::LoggingObserver,
    persistence::BoardSnapshot,
    runtime::{BoardRuntime, Submission},
    schema::write_schema,
    storage::Storage,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "nodeboard",
    about = "Wire agents, humans and documents together and route messages between them",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Emit JSON-Schema for the board snapshot, links and messages
    Schema(SchemaArgs),

    /// Print nodes, their neighbors and whether payloads can loop
    Inspect,

    /// Print the stored board as a snapshot document
    Export,

    /// Replace the stored board with a snapshot document
    Import { file: PathBuf },

    /// Send a message into a node and print the resulting transcripts
    Route(RouteArgs),
}

#[derive(Args, Debug)]
struct SchemaArgs {
    /// Output directory. Default: `<root>/schemas`
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RouteArgs {
    /// Destination node as `kind:id`, e.g. `human:me`
    #[arg(long)]
    to: String,

    #[arg(long)]
    text: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = resolve_root_dir();
    let config = BoardConfig::load(&root)?;
    init_tracing(&config.log_config())?;

    match cli.command {
        Commands::Schema(args) => {
            let out_dir = args.out.unwrap_or_else(|| config.root.join("schemas"));
            let written = write_schema(&out_dir)?;
            println!("{} schemas written to {}", written.len(), out_dir.display());
            Ok(())
        }
        Commands::Inspect => {
            let board = open_board(config.storage());
            inspect(&board);
            Ok(())
        }
        Commands::Export => {
            let board = open_board(config.storage());
            println!("{}", serde_json::to_string_pretty(&board.snapshot())?);
            Ok(())
        }
        Commands::Import { file } => {
            let raw = fs::read_to_string(&file)
                .with_context(|| format!("could not read {}", file.display()))?;
            let snapshot: BoardSnapshot = serde_json::from_str(&raw)?;
            let mut board = Board::new(config.storage());
            let summary = board.import(&snapshot)?;
            println!(
                "imported {} nodes and {} links ({} dropped)",
                summary.nodes, summary.links, summary.dropped
            );
            Ok(())
        }
        Commands::Route(args) => route(config.storage(), args).await,
    }
}

fn open_board(storage: Storage) -> Board {
    let mut board = Board::new(storage);
    board.subscribe(Arc::new(LoggingObserver));
    let summary = board.restore();
    info!(?summary, "board loaded");
    board
}

fn inspect(board: &Board) {
    for node in board.nodes() {
        let node_ref = node.node_ref();
        let outs = board.neighbors_of(node_ref, EdgeDirection::Out);
        let ins = board.neighbors_of(node_ref, EdgeDirection::In);
        println!("{node_ref}");
        for side in node.sides() {
            for port in node.ports_on(&side) {
                let direction = board
                    .registry()
                    .get_direction(port)
                    .map(|d| d.to_string())
                    .unwrap_or_default();
                println!("  port {port} ({direction})");
            }
        }
        for n in outs {
            println!("  -> {} via {}", n.node, n.connection_id);
        }
        for n in ins {
            println!("  <- {} via {}", n.node, n.connection_id);
        }
        if node.kind() == NodeKind::Agent && board.has_web_access(node_ref) {
            println!("  web access");
        }
    }
    let loops = if board.graph().has_feedback_loop() { "yes" } else { "no" };
    println!("{} connections, feedback loops: {loops}", board.graph().len());
}

async fn route(storage: Storage, args: RouteArgs) -> anyhow::Result<()> {
    let destination: NodeRef = args.to.parse().map_err(|e: String| anyhow!(e))?;
    let board = open_board(storage.clone());
    let sections = Arc::new(InMemorySections::new());
    let runtime = BoardRuntime::new(board, storage, Arc::new(EchoAgent), sections.clone());

    match runtime.submit(&destination, Message::new("cli", &args.text)).await {
        Submission::Queued(seq) => {
            println!("flow is paused; message queued as #{seq}");
            return Ok(());
        }
        Submission::Delivered(report) => {
            for failure in report.failures() {
                error!(target_node = %failure.target, outcome = ?failure.outcome, "delivery failed");
                if failure.connection_id.is_none() {
                    bail!("could not deliver to {destination}");
                }
            }
        }
    }
    runtime.wait_idle().await;

    for node in runtime.transcripts().nodes() {
        println!("== {node}");
        for entry in runtime.transcripts().entries(&node) {
            println!("  [{:?}] {}: {}", entry.speaker, entry.author, entry.text);
        }
    }
    for section in sections.section_ids() {
        println!("== section {section}");
        println!("{}", sections.content(&section).unwrap_or_default());
    }
    Ok(())
}
