// Consensus rules: parameters, proof of work, validation

pub mod params;
pub mod pow;
pub mod validation;

pub use validation::{validate_block, validate_chain, verify_transaction, ValidationError};
