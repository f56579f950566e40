// Proof-of-work cryptocurrency node

pub mod cli;
pub mod consensus;
pub mod core;
pub mod mempool;
pub mod miner;
pub mod network;
pub mod node;
pub mod rpc;
pub mod storage;
pub mod wallet;

// Re-exports for convenience
pub use cli::{Cli, CliHandler};
pub use crate::core::{Block, Hash256, Transaction, TxInput, TxOutput};
pub use mempool::Mempool;
pub use miner::Miner;
pub use network::{Handler, Message, Network, Peer};
pub use node::{BlockAccept, Node, NodeConfig, SyncState};
pub use storage::{Store, UtxoSet};
pub use wallet::{KeyPair, Keystore, TransactionBuilder};
