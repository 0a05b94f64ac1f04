//! dagheal - command line access to a self-healing block store
//!
//! Usage:
//!   dagheal --store ./blocks add a.bin b.bin c.bin
//!   dagheal --store ./blocks encode <cid> --redundancy 2
//!   dagheal --store ./blocks get <child> --parent <recovery-node>
//!
//! Logging is controlled with RUST_LOG (default: info).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use dagheal::dag::{encode_dag, BlockDagService, DagService, NodeGetter};
use dagheal::reedsolomon::{self, ReedSolomonEncoder, ReedSolomonRecoverer};
use dagheal::{
    BlockStore, CancelToken, Cid, CodecRegistry, DagSession, FsBlockStore, Node, ProtoNode,
    RecoveryConfig, RecoveryMetrics, Strategy,
};

#[derive(Parser)]
#[command(name = "dagheal")]
#[command(version, about = "Self-healing Merkle DAG block store", long_about = None)]
struct Cli {
    /// Block store directory
    #[arg(short = 's', long, global = true, default_value = ".dagheal")]
    store: PathBuf,

    /// Recovery strategy: requested, data or all (overrides --config)
    #[arg(long, global = true)]
    strategy: Option<Strategy>,

    /// Recovery config file (JSON)
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store files as raw blocks under a new plain node
    Add {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Encode a plain node into a recovery node
    Encode {
        cid: Cid,

        /// Number of parity shards
        #[arg(short, long, default_value = "2")]
        redundancy: usize,
    },

    /// Encode every node of the DAG under a node
    EncodeDag {
        cid: Cid,

        /// Number of parity shards per node
        #[arg(short, long, default_value = "2")]
        redundancy: usize,
    },

    /// Fetch a node, recovering it through its parent if needed
    Get {
        cid: Cid,

        /// Recovery node to load first
        #[arg(short, long)]
        parent: Option<Cid>,
    },

    /// Delete a block
    Rm { cid: Cid },

    /// Print a JSON description of a node
    Stat { cid: Cid },
}

fn load_config(cli: &Cli) -> Result<RecoveryConfig> {
    let mut config = match &cli.config {
        Some(path) => RecoveryConfig::read_from(path)
            .with_context(|| format!("failed to read config {}", path.display()))?
            .unwrap_or_default(),
        None => RecoveryConfig::default(),
    };
    if let Some(strategy) = cli.strategy {
        config.strategy = strategy;
    }
    Ok(config)
}

fn add(token: &CancelToken, dag: &dyn DagService, files: &[PathBuf]) -> Result<Cid> {
    let mut parent = ProtoNode::default();
    for path in files {
        let data =
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let child = Node::raw(data);
        dag.add(token, &child)?;
        parent.add_node_link(file_name(path), &child);
    }
    let parent = Node::Proto(parent);
    dag.add(token, &parent)?;
    Ok(parent.cid())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let token = CancelToken::new();
    let store: Arc<dyn BlockStore> = Arc::new(
        FsBlockStore::open(&cli.store)
            .with_context(|| format!("failed to open store {}", cli.store.display()))?,
    );
    let registry: Arc<CodecRegistry> = Arc::new(reedsolomon::registry());
    let dag = Arc::new(BlockDagService::new(Arc::clone(&store), Arc::clone(&registry)));

    match &cli.command {
        Commands::Add { files } => {
            println!("{}", add(&token, dag.as_ref(), files)?);
        }
        Commands::Encode { cid, redundancy } => {
            let node = dag.get(&token, cid)?;
            let encoded = reedsolomon::encode(&token, dag.as_ref(), &node, *redundancy)?;
            println!("{}", encoded.cid());
        }
        Commands::EncodeDag { cid, redundancy } => {
            let node = dag.get(&token, cid)?;
            let encoder = ReedSolomonEncoder::new(dag.clone());
            let root = encode_dag(&token, dag.as_ref(), &encoder, &node, *redundancy)?;
            println!("{}", root.cid());
        }
        Commands::Get { cid, parent } => {
            let metrics = Arc::new(RecoveryMetrics::new());
            let recoverer = ReedSolomonRecoverer::with_metrics(
                &token,
                dag.clone(),
                Arc::clone(&registry),
                config.strategy,
                Arc::clone(&metrics),
            );
            let session = DagSession::new(&token, store, Arc::new(recoverer), registry)
                .with_config(config)
                .with_metrics(Arc::clone(&metrics));

            if let Some(parent) = parent {
                let node = session.get(&token, parent)?;
                if node.cid() == *parent {
                    bail!("{} is not a recovery node", parent);
                }
            }
            let node = session.get(&token, cid)?;
            session.close();
            print_json(&node.stat())?;

            let snapshot = metrics.snapshot();
            if snapshot.nodes_recovered > 0 {
                info!(recovered = snapshot.nodes_recovered, "Recovered missing nodes");
            }
        }
        Commands::Rm { cid } => {
            dag.remove(&token, cid)?;
            println!("removed {}", cid);
        }
        Commands::Stat { cid } => {
            print_json(&dag.get(&token, cid)?.stat())?;
        }
    }
    Ok(())
}
