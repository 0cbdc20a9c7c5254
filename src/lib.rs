// src/lib.rs
pub mod bazaar;
pub mod capsule;
pub mod config;
pub mod errors;
pub mod ledger;
pub mod network;
pub mod node;
pub mod rating;
pub mod storage;
pub mod wallet;
pub mod worker;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing_subscriber::EnvFilter;

use bazaar::TaskBazaar;
use capsule::CapsuleStore;
use config::Config;
use network::{GossipConfig, GossipNode};
use node::Node;
use rating::RatingStore;
use wallet::Wallet;
use worker::TaskWorker;

#[derive(Parser, Debug)]
#[command(name = "capsule-mesh")]
#[command(about = "Peer-to-peer mesh for memory capsules and task auctions")]
struct Cli {
    /// Config file path (default: ~/.capsule-mesh.json)
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize a node configuration
    Init {
        #[arg(default_value = "MeshNode")]
        name: String,
        /// Gossip listen port (0 picks an ephemeral port)
        #[arg(long, default_value_t = 0)]
        port: u16,
        /// Bootstrap peer address (host:port)
        #[arg(long)]
        bootstrap: Option<String>,
        /// Comma-separated capability tags
        #[arg(long)]
        tags: Option<String>,
        #[arg(long, default_value = "./data")]
        data_dir: String,
        /// Run as the genesis leader (orders the ledger, mints supply)
        #[arg(long)]
        genesis: bool,
        #[arg(long, default_value_t = 1_000_000)]
        genesis_supply: i64,
    },
    /// Start the node
    Start,
    /// Import wallet key material. Refused when the key is inconsistent
    /// or would change an established genesis leader key.
    ImportWallet {
        /// Path to a wallet JSON file
        file: PathBuf,
    },
}

fn random_node_id() -> String {
    let mut raw = [0u8; 8];
    rand::thread_rng().fill(&mut raw);
    format!("node_{}", hex::encode(raw))
}

pub async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Start) {
        Commands::Init {
            name,
            port,
            bootstrap,
            tags,
            data_dir,
            genesis,
            genesis_supply,
        } => {
            let node_id = random_node_id();
            let cfg = Config {
                name,
                node_id: node_id.clone(),
                port,
                bootstrap_nodes: bootstrap.map(|b| vec![b]).unwrap_or_default(),
                tags: tags
                    .map(|s| s.split(',').map(|t| t.trim().to_string()).collect())
                    .unwrap_or_default(),
                data_dir,
                is_genesis_node: genesis,
                genesis_supply,
                token: "MESH".to_string(),
                publish_fee: 1,
                confirmation_target: 1,
                confirm_timeout_ms: 15_000,
                created_at: chrono::Utc::now().to_rfc3339(),
            };
            if genesis {
                // Create the leader wallet eagerly so the operator
                // account is known before first start.
                let wallet = Wallet::load_or_generate(&cfg.wallet_path())
                    .context("create leader wallet")?;
                println!("Genesis operator account: {}", wallet.account_id());
            }
            cfg.save(cli.config.clone()).context("save config")?;
            let path = cli.config.unwrap_or_else(Config::default_path);
            println!("Node initialized: {} ({})", cfg.name, node_id);
            println!("  Config: {}", path.display());
            Ok(())
        }
        Commands::Start => {
            let cfg = Config::load(cli.config.clone())
                .context("no config found; run `capsule-mesh init` first")?;
            start_node(cfg).await
        }
        Commands::ImportWallet { file } => {
            let cfg = Config::load(cli.config.clone())
                .context("no config found; run `capsule-mesh init` first")?;
            let text = std::fs::read_to_string(&file).context("read wallet file")?;
            let parsed: wallet::WalletFile =
                serde_json::from_str(&text).context("parse wallet file")?;
            // A genesis node whose ledger already carries a leader key
            // must not switch identities.
            let leader_pem = if cfg.is_genesis_node {
                let db = storage::open_db(cfg.db_path().to_str().unwrap_or("./data/db"));
                ledger::Ledger::open(db)?.leader_pem()
            } else {
                None
            };
            let imported = Wallet::import(&cfg.wallet_path(), &parsed, leader_pem.as_deref())?;
            println!("Imported wallet for account {}", imported.account_id());
            Ok(())
        }
    }
}

async fn start_node(cfg: Config) -> Result<()> {
    std::fs::create_dir_all(&cfg.data_dir).context("create data dir")?;
    let db = storage::open_db(cfg.db_path().to_str().unwrap_or("./data/db"));
    let wallet = Arc::new(Wallet::load_or_generate(&cfg.wallet_path())?);
    tracing::info!(node = %cfg.node_id, account = %wallet.account_id(), "starting node");

    let ledger = Arc::new(ledger::Ledger::open(db.clone())?);
    ledger.initialize(cfg.is_genesis_node, &wallet, cfg.genesis_supply)?;

    let capsules = Arc::new(CapsuleStore::new(db.clone()));
    let ratings = Arc::new(RatingStore::new(db.clone()));
    let bazaar = Arc::new(AsyncMutex::new(TaskBazaar::open(
        cfg.node_id.clone(),
        db.clone(),
    )?));

    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
    let gossip = Arc::new(GossipNode::new(
        cfg.node_id.clone(),
        cfg.bootstrap_nodes.clone(),
        inbound_tx,
        Some(cfg.peers_path()),
        GossipConfig::default(),
    ));
    let port = Arc::clone(&gossip).start(cfg.port).await?;
    tracing::info!(port, "gossip transport up");

    let node = Arc::new(Node::new(
        cfg.clone(),
        wallet,
        ledger,
        capsules,
        ratings,
        bazaar,
        gossip,
    ));
    Arc::clone(&node).spawn_workers();

    let worker_node = Arc::clone(&node);
    tokio::spawn(async move {
        TaskWorker::new(worker_node).run().await;
    });

    loop {
        tokio::select! {
            inbound = inbound_rx.recv() => {
                match inbound {
                    Some(inbound) => node.handle_inbound(inbound).await,
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }
    Ok(())
}
