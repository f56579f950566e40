// CLI commands and the node runtime wiring

use crate::consensus::params::DEFAULT_PORT;
use crate::core::Hash256;
use crate::miner::Miner;
use crate::network::{Handler, Network};
use crate::node::{Mode, Node, NodeConfig};
use crate::rpc::RpcServer;
use crate::storage::Store;
use crate::wallet::{Keystore, TransactionBuilder};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Parser)]
#[command(name = "ironcoin")]
#[command(about = "Proof-of-work cryptocurrency node", long_about = None)]
pub struct Cli {
    /// Body retention: archive keeps everything, pruned drops old bodies
    #[arg(long, default_value = "archive")]
    pub mode: String,

    /// Data directory for chain state and keys
    #[arg(long, default_value = "./data")]
    pub datadir: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full node: listener, sync, relay, RPC, optional miner
    Node {
        /// P2P listen address
        #[arg(long, default_value_t = format!("0.0.0.0:{}", DEFAULT_PORT))]
        listen: String,

        /// Seed peers to dial on startup
        #[arg(long)]
        connect: Vec<String>,

        /// RPC listen address
        #[arg(long, default_value = "127.0.0.1:9002")]
        rpc: String,

        /// Mine blocks
        #[arg(long, default_value_t = false)]
        mine: bool,

        /// Reward address for mined blocks (defaults to the wallet)
        #[arg(long)]
        address: Option<String>,

        /// Advertised node id (defaults to detected outbound IP + port)
        #[arg(long)]
        node_id: Option<String>,

        /// Connection cap
        #[arg(long, default_value_t = 8)]
        max_peers: usize,
    },

    /// Show chain status
    Info,

    /// Wallet commands
    #[command(subcommand)]
    Wallet(WalletCommands),

    /// Block queries
    #[command(subcommand)]
    Block(BlockCommands),
}

#[derive(Subcommand)]
pub enum WalletCommands {
    /// Create a new address
    NewAddress,

    /// List all addresses
    List,

    /// Get balance for an address
    Balance {
        /// Address to check (uses the default if not specified)
        address: Option<String>,
    },

    /// Build, sign and submit a payment
    Send {
        /// Recipient address
        to: String,
        /// Amount to send
        amount: u64,
        /// Transaction fee
        #[arg(short, long, default_value_t = 1)]
        fee: u64,
    },
}

#[derive(Subcommand)]
pub enum BlockCommands {
    /// Current chain height
    Height,

    /// Best block hash
    Best,

    /// Get a block by hash or height
    Get {
        /// Block hash (hex) or height
        id: String,
    },
}

pub struct CliHandler {
    node: Arc<Node>,
    keystore: Keystore,
    keystore_path: String,
}

impl CliHandler {
    pub fn new(datadir: &str, mode: Mode) -> Result<Self, String> {
        std::fs::create_dir_all(datadir)
            .map_err(|e| format!("failed to create {}: {}", datadir, e))?;
        let store = Store::open(format!("{}/chain", datadir))?;
        let config = NodeConfig {
            mode,
            ..NodeConfig::default()
        };
        let node = Node::open(store, config)?;

        let keystore_path = format!("{}/keystore.json", datadir);
        let keystore = if std::path::Path::new(&keystore_path).exists() {
            log::info!("loading keystore from {}", keystore_path);
            Keystore::load(&keystore_path)?
        } else {
            Keystore::new()
        };

        Ok(Self {
            node,
            keystore,
            keystore_path,
        })
    }

    pub async fn run(cli: Cli) -> Result<(), String> {
        let mode: Mode = cli.mode.parse()?;
        let mut handler = Self::new(&cli.datadir, mode)?;
        handler.handle(cli.command).await
    }

    async fn handle(&mut self, command: Commands) -> Result<(), String> {
        match command {
            Commands::Node {
                listen,
                connect,
                rpc,
                mine,
                address,
                node_id,
                max_peers,
            } => {
                self.run_node(listen, connect, rpc, mine, address, node_id, max_peers)
                    .await
            }
            Commands::Info => self.info().await,
            Commands::Wallet(cmd) => self.wallet(cmd).await,
            Commands::Block(cmd) => self.block(cmd).await,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_node(
        &mut self,
        listen: String,
        connect: Vec<String>,
        rpc: String,
        mine: bool,
        address: Option<String>,
        node_id: Option<String>,
        max_peers: usize,
    ) -> Result<(), String> {
        let node_id = node_id.unwrap_or_else(|| advertised_addr(&listen));
        log::info!("node id: {}", node_id);

        let network = Network::new(Arc::clone(&self.node), listen, node_id, max_peers);
        self.node.set_broadcaster(network.clone());
        let handler = Handler::new(Arc::clone(&self.node), Arc::clone(&network));
        network.start(Arc::clone(&handler), &connect).await?;

        // reward address: explicit flag, else the wallet default, creating
        // one on first run
        let reward_address = match address {
            Some(addr) => addr,
            None => match self.keystore.default_address() {
                Some(addr) => addr.clone(),
                None => {
                    let addr = self.keystore.new_address();
                    self.keystore.save(&self.keystore_path)?;
                    log::info!("created wallet address {}", addr);
                    addr
                }
            },
        };

        let wallet = Arc::new(Mutex::new(std::mem::take(&mut self.keystore)));
        let rpc_server = RpcServer::new(
            Arc::clone(&self.node),
            Some(Arc::clone(&network)),
            wallet,
        );
        rpc_server.start(&rpc).await?;

        if mine {
            let miner = Miner::new(Arc::clone(&self.node), reward_address);
            tokio::spawn(miner.run());
        }

        // the runtime's tasks do all the work from here on
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        }
    }

    async fn info(&self) -> Result<(), String> {
        let state = self.node.lock().await;
        println!("height:    {}", state.height());
        println!("tip:       {}", state.tip().hash);
        println!("work:      {}", state.tree.best().cum_work.to_str_radix(16));
        println!("sync:      {:?}", state.sync_state);
        println!("mempool:   {} transactions", state.mempool.len());
        println!("index:     {} entries", state.tree.len());
        Ok(())
    }

    async fn wallet(&mut self, cmd: WalletCommands) -> Result<(), String> {
        match cmd {
            WalletCommands::NewAddress => {
                let addr = self.keystore.new_address();
                self.keystore.save(&self.keystore_path)?;
                println!("{}", addr);
                Ok(())
            }
            WalletCommands::List => {
                for addr in self.keystore.list_addresses() {
                    let marker = if Some(&addr) == self.keystore.default_address() {
                        " (default)"
                    } else {
                        ""
                    };
                    println!("{}{}", addr, marker);
                }
                Ok(())
            }
            WalletCommands::Balance { address } => {
                let addr = match address.or_else(|| self.keystore.default_address().cloned()) {
                    Some(a) => a,
                    None => return Err("no address given and wallet is empty".to_string()),
                };
                println!("{}", self.node.balance(&addr).await);
                Ok(())
            }
            WalletCommands::Send { to, amount, fee } => {
                let from = self
                    .keystore
                    .default_address()
                    .cloned()
                    .ok_or("wallet is empty; run wallet new-address first")?;
                let keypair = self.keystore.get(&from).ok_or("default key missing")?;
                let tx = {
                    let state = self.node.lock().await;
                    TransactionBuilder::build(&state.utxo, keypair, &to, amount, fee)?
                };
                let txid = tx.id.clone();
                self.node.add_transaction(tx).await?;
                println!("{}", txid);
                Ok(())
            }
        }
    }

    async fn block(&self, cmd: BlockCommands) -> Result<(), String> {
        match cmd {
            BlockCommands::Height => {
                println!("{}", self.node.height().await);
                Ok(())
            }
            BlockCommands::Best => {
                println!("{}", self.node.tip_hash().await);
                Ok(())
            }
            BlockCommands::Get { id } => {
                let block = if let Ok(height) = id.parse::<u64>() {
                    self.node.get_block_by_height(height).await
                } else {
                    self.node.get_block(&Hash256::from_hex(&id)?).await
                };
                let block = block.ok_or("block not found")?;
                let dto = crate::network::dto::BlockDto::from_block(&block);
                println!(
                    "{}",
                    serde_json::to_string_pretty(&dto).map_err(|e| e.to_string())?
                );
                Ok(())
            }
        }
    }
}

/// Advertised address: the configured listen port on the detected
/// outbound interface when listening on a wildcard address.
fn advertised_addr(listen: &str) -> String {
    let port = listen.rsplit(':').next().unwrap_or("9001");
    if !listen.starts_with("0.0.0.0") && !listen.starts_with("[::]") {
        return listen.to_string();
    }
    match detect_outbound_ip() {
        Some(ip) => format!("{}:{}", ip, port),
        None => listen.to_string(),
    }
}

fn detect_outbound_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}
