//! Binary entry point for a Sombra storage node.
#![forbid(unsafe_code)]

use std::error::Error;
use std::io::Read;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use sombra_node::{
    config::{NodeConfig, NodeRole},
    log::FileLog,
    model::{EntityKind, OperationBatch, OperationBlob, OperationType},
    partition::{partition_dir, GraphPartition, KvPartition},
    types::{NodeId, PartitionId, QueueId},
    NodeDeps, StoreNode,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "sombra-node",
    version,
    about = "Sombra storage node: log replay, partition writes and snapshot commits",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a node until stdin closes
    Run(RunCmd),
    /// Append one operation to a node's file-backed log
    Append(AppendCmd),
    /// Print the recovered state of one partition
    Inspect(InspectCmd),
}

#[derive(Args, Debug)]
struct RunCmd {
    #[arg(long, value_name = "FILE", env = "SOMBRA_NODE_CONFIG", help = "TOML configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "DIR", help = "Place data, meta, log and download directories under DIR")]
    root: Option<PathBuf>,

    #[arg(long, help = "Override the node id")]
    node_id: Option<u32>,

    #[arg(long, value_enum, help = "Override the replica role")]
    role: Option<RoleArg>,

    #[arg(long, value_name = "DIR", help = "Primary partition root followed by a secondary")]
    primary_data_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct AppendCmd {
    #[arg(long, value_name = "DIR", help = "Log directory")]
    log_dir: PathBuf,

    #[arg(long, default_value_t = 0, help = "Node whose log receives the record")]
    node: u32,

    #[arg(long, help = "Snapshot id of the record")]
    snapshot: i64,

    #[arg(long, default_value_t = 0, help = "Ingestion queue")]
    queue: u32,

    #[arg(long, help = "Operation type, e.g. overwrite_vertex or create_vertex_type")]
    op: OperationType,

    #[arg(long, allow_hyphen_values = true, help = "Partition key; -1 broadcasts to every partition")]
    key: i64,

    #[arg(long, default_value = "", help = "Payload")]
    value: String,
}

#[derive(Args, Debug)]
struct InspectCmd {
    #[arg(long, value_name = "DIR", help = "Partition root of a node")]
    data_dir: PathBuf,

    #[arg(long, help = "Partition id")]
    partition: u32,

    #[arg(long, allow_hyphen_values = true, help = "Also print the latest vertex stored under KEY")]
    key: Option<i64>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum RoleArg {
    Primary,
    Secondary,
}

impl From<RoleArg> for NodeRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Primary => NodeRole::Primary,
            RoleArg::Secondary => NodeRole::Secondary,
        }
    }
}

#[derive(Serialize)]
struct AppendReport {
    node: NodeId,
    offset: i64,
}

#[derive(Serialize)]
struct RunReport {
    node: NodeId,
    snapshot_id: i64,
    ddl_snapshot_id: i64,
}

#[derive(Serialize)]
struct InspectReport {
    partition: PartitionId,
    durable_snapshot_id: i64,
    ddl_snapshot_id: i64,
    gc_snapshot_id: i64,
    live_entities: usize,
    vertex_types: Vec<String>,
    edge_types: Vec<String>,
    edge_kinds: Vec<String>,
    pending_loads: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(cmd) => {
            let report = run_node(cmd)?;
            emit(cli.format, &report, |report| {
                println!(
                    "node {} stopped at snapshot {} (ddl {})",
                    report.node, report.snapshot_id, report.ddl_snapshot_id
                )
            })?;
        }
        Command::Append(cmd) => {
            let report = append(cmd)?;
            emit(cli.format, &report, |report| println!("{}", report.offset))?;
        }
        Command::Inspect(cmd) => {
            let report = inspect(cmd)?;
            emit(cli.format, &report, print_inspect_text)?;
        }
    }
    Ok(())
}

fn emit<T: Serialize>(
    format: OutputFormat,
    value: &T,
    text: impl FnOnce(&T),
) -> Result<(), Box<dyn Error>> {
    match format {
        OutputFormat::Text => text(value),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sombra_node=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_node(cmd: RunCmd) -> Result<RunReport, Box<dyn Error>> {
    init_tracing();
    let mut config = match &cmd.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(root) = &cmd.root {
        config = config.with_root(root);
    }
    if let Some(node_id) = cmd.node_id {
        config.node_id = NodeId(node_id);
    }
    if let Some(role) = cmd.role {
        config.role = role.into();
    }
    if let Some(primary) = cmd.primary_data_dir {
        config.primary_data_dir = Some(primary);
    }
    config.validate()?;

    let deps = NodeDeps::local(&config)?;
    let node = StoreNode::new(config, deps)?;
    node.start()?;

    let (eof_tx, eof_rx) = crossbeam_channel::bounded::<()>(1);
    thread::Builder::new()
        .name("stdin-watch".into())
        .spawn(move || {
            let mut sink = Vec::new();
            let _ = std::io::stdin().read_to_end(&mut sink);
            let _ = eof_tx.send(());
        })?;

    let fatal = loop {
        if eof_rx.recv_timeout(Duration::from_millis(200)).is_ok() {
            break None;
        }
        if let Some(err) = node.fatal_error() {
            break Some(err);
        }
    };
    node.stop();
    if let Some(err) = fatal {
        return Err(format!("log consumption failed: {err}").into());
    }
    let info = node.snapshot_info();
    Ok(RunReport {
        node: node.config().node_id,
        snapshot_id: info.snapshot_id,
        ddl_snapshot_id: info.ddl_snapshot_id,
    })
}

fn append(cmd: AppendCmd) -> Result<AppendReport, Box<dyn Error>> {
    let log = FileLog::open(&cmd.log_dir)?;
    let op = OperationBlob::new(cmd.op, cmd.key, cmd.value.into_bytes());
    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0);
    let node = NodeId(cmd.node);
    let offset = log.append(
        node,
        QueueId(cmd.queue),
        cmd.snapshot,
        timestamp_ms,
        OperationBatch::new(vec![op]),
    )?;
    Ok(AppendReport { node, offset })
}

fn inspect(cmd: InspectCmd) -> Result<InspectReport, Box<dyn Error>> {
    let id = PartitionId(cmd.partition);
    let dir = partition_dir(&cmd.data_dir, id);
    if !dir.is_dir() {
        return Err(format!("no partition at {}", dir.display()).into());
    }
    // Opened as a replica of itself so inspection never writes.
    let mut partition = KvPartition::open_secondary(id, &dir, &dir)?;
    partition.recover()?;
    let value = cmd.key.and_then(|key| {
        partition
            .get_latest(EntityKind::Vertex, key)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    });
    Ok(InspectReport {
        partition: id,
        durable_snapshot_id: partition.durable_snapshot_id(),
        ddl_snapshot_id: partition.ddl_snapshot_id(),
        gc_snapshot_id: partition.gc_snapshot_id(),
        live_entities: partition.live_entity_count(),
        vertex_types: partition.vertex_types(),
        edge_types: partition.edge_types(),
        edge_kinds: partition.edge_kinds(),
        pending_loads: partition.pending_loads(),
        value,
    })
}

fn print_inspect_text(report: &InspectReport) {
    println!("partition        {}", report.partition);
    println!("durable snapshot {}", report.durable_snapshot_id);
    println!("ddl snapshot     {}", report.ddl_snapshot_id);
    println!("gc snapshot      {}", report.gc_snapshot_id);
    println!("live entities    {}", report.live_entities);
    println!("vertex types     {}", report.vertex_types.join(", "));
    println!("edge types       {}", report.edge_types.join(", "));
    println!("edge kinds       {}", report.edge_kinds.join(", "));
    if !report.pending_loads.is_empty() {
        println!("pending loads    {}", report.pending_loads.join(", "));
    }
    if let Some(value) = &report.value {
        println!("value            {value}");
    }
}
