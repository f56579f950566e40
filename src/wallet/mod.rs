// Wallet: key management and transaction building

mod keystore;
mod tx_builder;

pub use keystore::{KeyPair, Keystore};
pub use tx_builder::TransactionBuilder;
