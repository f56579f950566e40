// Block and transaction validation against consensus rules

use crate::consensus::params::{DIFFICULTY_INTERVAL, INTERVAL_TIMESPAN_SECS};
use crate::consensus::pow::{big_to_compact, compact_to_big, hash_meets_target};
use crate::core::{compute_merkle_root, Block, Hash256, Transaction};
use crate::storage::UtxoSet;
use num_bigint::BigUint;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A chain to validate carries no blocks.
    EmptyChain,
    /// Previous-hash field does not reference the parent.
    BadLink,
    /// Height is not parent height + 1.
    BadHeight,
    /// Bits disagree with the difficulty schedule.
    BadDifficulty,
    /// Stored hash does not match the recomputed header hash.
    HashMismatch,
    /// Header hash exceeds the target.
    InvalidProofOfWork,
    /// Merkle root does not match the transactions.
    InvalidMerkleRoot,
    /// Block has no transactions.
    NoTransactions,
    /// First transaction is not a coinbase.
    MissingCoinbase,
    /// Coinbase appears outside the first position.
    CoinbaseNotFirst,
    /// Coinbase pays more than reward plus fees.
    ExcessCoinbaseValue,
    /// Two transactions in the block share an id, or an id collides with a
    /// live outpoint.
    DuplicateTxId(String),
    /// Transaction has no inputs or no outputs.
    EmptyTransaction,
    /// An input references an outpoint that does not exist.
    MissingUtxo(String),
    /// An input's public key does not hash to the outpoint's recipient.
    OwnerMismatch(String),
    /// An input spends the same outpoint twice.
    DoubleSpend(String),
    /// ECDSA signature verification failed.
    InvalidSignature(String),
    /// Input sum is below output sum.
    OutputsExceedInputs,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ValidationError::EmptyChain => write!(f, "chain has no blocks"),
            ValidationError::BadLink => write!(f, "prev hash mismatch"),
            ValidationError::BadHeight => write!(f, "invalid height"),
            ValidationError::BadDifficulty => write!(f, "bits disagree with difficulty schedule"),
            ValidationError::HashMismatch => write!(f, "stored hash does not match header"),
            ValidationError::InvalidProofOfWork => write!(f, "invalid proof of work"),
            ValidationError::InvalidMerkleRoot => write!(f, "invalid merkle root"),
            ValidationError::NoTransactions => write!(f, "block has no transactions"),
            ValidationError::MissingCoinbase => write!(f, "coinbase must be first"),
            ValidationError::CoinbaseNotFirst => write!(f, "coinbase outside first position"),
            ValidationError::ExcessCoinbaseValue => write!(f, "coinbase exceeds reward plus fees"),
            ValidationError::DuplicateTxId(id) => write!(f, "duplicate transaction id {}", id),
            ValidationError::EmptyTransaction => write!(f, "transaction has no inputs or outputs"),
            ValidationError::MissingUtxo(op) => write!(f, "missing input utxo: {}", op),
            ValidationError::OwnerMismatch(op) => write!(f, "pubkey does not match utxo owner: {}", op),
            ValidationError::DoubleSpend(op) => write!(f, "outpoint spent twice: {}", op),
            ValidationError::InvalidSignature(e) => write!(f, "signature check failed: {}", e),
            ValidationError::OutputsExceedInputs => write!(f, "inputs below outputs"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Difficulty retarget: scale the old target by the ratio of the actual
/// interval span to the expected one, clamped to [expected/4, expected*4]
/// and capped at `max` (the network's easiest target, i.e. the genesis
/// target). Depends only on header data so it also runs during
/// headers-first sync.
pub fn retarget(old_target: &BigUint, actual_span_secs: i64, max: &BigUint) -> BigUint {
    let min_span = INTERVAL_TIMESPAN_SECS / 4;
    let max_span = INTERVAL_TIMESPAN_SECS * 4;
    let span = actual_span_secs.clamp(min_span, max_span);

    let mut new_target = old_target * BigUint::from(span as u64);
    new_target /= BigUint::from(INTERVAL_TIMESPAN_SECS as u64);

    if new_target > *max {
        max.clone()
    } else {
        new_target
    }
}

/// Header integrity + proof of work: the stored hash must match the
/// recomputed header hash and lie at or below the target encoded in bits.
pub fn check_proof_of_work(block: &Block) -> Result<(), ValidationError> {
    if block.hash != block.compute_hash() {
        return Err(ValidationError::HashMismatch);
    }
    if !hash_meets_target(&block.hash, &compact_to_big(block.bits)) {
        return Err(ValidationError::InvalidProofOfWork);
    }
    Ok(())
}

/// Validate a non-coinbase transaction against a view of spendable
/// outputs. `resolve` looks up an outpoint's (value, recipient); for block
/// validation it reads the speculative UTXO clone, for mempool admission
/// it also covers in-pool parent outputs.
pub fn verify_transaction<F>(tx: &Transaction, resolve: F) -> Result<(), ValidationError>
where
    F: Fn(&str, u32) -> Option<(u64, String)>,
{
    if tx.is_coinbase {
        return Ok(());
    }
    if tx.inputs.is_empty() || tx.outputs.is_empty() {
        return Err(ValidationError::EmptyTransaction);
    }

    let mut seen = HashSet::new();
    let mut input_sum: u64 = 0;
    for input in &tx.inputs {
        let key = format!("{}_{}", input.txid, input.index);
        if !seen.insert(key.clone()) {
            return Err(ValidationError::DoubleSpend(key));
        }

        let (value, to) =
            resolve(&input.txid, input.index).ok_or(ValidationError::MissingUtxo(key.clone()))?;

        let addr = Transaction::input_address(input)
            .map_err(|e| ValidationError::InvalidSignature(e))?;
        if addr != to {
            return Err(ValidationError::OwnerMismatch(key));
        }
        input_sum += value;
    }

    tx.verify_signatures()
        .map_err(ValidationError::InvalidSignature)?;

    if input_sum < tx.output_sum() {
        return Err(ValidationError::OutputsExceedInputs);
    }
    Ok(())
}

/// Full block validation against its parent and the current UTXO set.
/// `expected_bits` comes from the difficulty schedule (retarget on interval
/// boundaries, otherwise the parent's bits). On success the block can be
/// connected; the UTXO set itself is untouched.
pub fn validate_block(
    block: &Block,
    parent_hash: &Hash256,
    parent_height: u64,
    expected_bits: u32,
    utxo: &UtxoSet,
    reward: u64,
) -> Result<(), ValidationError> {
    // link
    if block.prev_hash != *parent_hash {
        return Err(ValidationError::BadLink);
    }
    if block.height != parent_height + 1 {
        return Err(ValidationError::BadHeight);
    }

    // difficulty schedule
    if block.bits != expected_bits {
        return Err(ValidationError::BadDifficulty);
    }

    // proof of work
    check_proof_of_work(block)?;

    // coinbase placement
    if block.transactions.is_empty() {
        return Err(ValidationError::NoTransactions);
    }
    if !block.transactions[0].is_coinbase {
        return Err(ValidationError::MissingCoinbase);
    }
    for tx in &block.transactions[1..] {
        if tx.is_coinbase {
            return Err(ValidationError::CoinbaseNotFirst);
        }
    }

    // merkle root
    if compute_merkle_root(&block.transactions) != block.merkle_root {
        return Err(ValidationError::InvalidMerkleRoot);
    }

    // replay transactions against a speculative copy so later transactions
    // can spend outputs of earlier ones in the same block
    let mut tmp = utxo.clone_detached();
    let mut ids = HashSet::new();
    let mut fees: u64 = 0;

    for (i, tx) in block.transactions.iter().enumerate() {
        if tx.id != tx.compute_id() {
            return Err(ValidationError::HashMismatch);
        }
        if !ids.insert(tx.id.clone()) {
            return Err(ValidationError::DuplicateTxId(tx.id.clone()));
        }
        for out_index in 0..tx.outputs.len() {
            if tmp.contains(&tx.id, out_index as u32) {
                return Err(ValidationError::DuplicateTxId(tx.id.clone()));
            }
        }

        if i > 0 {
            verify_transaction(tx, |txid, index| {
                tmp.get(txid, index).map(|u| (u.value, u.to.clone()))
            })?;
            fees += tx.fee_with(|txid, index| tmp.get(txid, index).map(|u| u.value));
            tmp.spend(tx)
                .map_err(|e| ValidationError::MissingUtxo(e))?;
        }
        tmp.add(tx);
    }

    // coinbase may claim at most reward + fees
    if block.transactions[0].output_sum() > reward + fees {
        return Err(ValidationError::ExcessCoinbaseValue);
    }

    Ok(())
}

/// Expected bits for the child of `parent` computed over a dense chain
/// slice, mirroring the block tree's schedule walk.
fn expected_bits_in_chain(chain: &[Block], parent: &Block) -> u32 {
    if (parent.height + 1) % DIFFICULTY_INTERVAL != 0 {
        return parent.bits;
    }
    let base = chain[0].height;
    let first_height = parent
        .height
        .saturating_sub(DIFFICULTY_INTERVAL - 1)
        .max(base);
    let first = &chain[(first_height - base) as usize];
    let span = parent.timestamp - first.timestamp;
    let floor = compact_to_big(chain[0].bits);
    big_to_compact(&retarget(&compact_to_big(parent.bits), span, &floor))
}

/// Replay a dense chain from its root, enforcing every block rule —
/// linkage, difficulty schedule, proof of work, merkle root, signatures,
/// outpoint existence and ownership, input-covers-output, and coinbase
/// economics. Returns the resulting UTXO set. This is the gate a
/// competitor branch must pass before a reorganization or sync completion
/// adopts it.
pub fn validate_chain(chain: &[Block], reward: u64) -> Result<UtxoSet, ValidationError> {
    let root = chain.first().ok_or(ValidationError::EmptyChain)?;

    let mut utxo = UtxoSet::new(None);
    for tx in &root.transactions {
        utxo.add(tx);
    }

    let mut parent = root;
    for block in &chain[1..] {
        let expected_bits = expected_bits_in_chain(chain, parent);
        validate_block(block, &parent.hash, parent.height, expected_bits, &utxo, reward)?;
        for tx in &block.transactions {
            if !tx.is_coinbase {
                utxo.spend(tx).map_err(ValidationError::MissingUtxo)?;
            }
            utxo.add(tx);
        }
        parent = block;
    }

    Ok(utxo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::params::{max_target, BLOCK_REWARD};
    use crate::consensus::pow::big_to_compact;
    use crate::core::{TxInput, TxOutput};
    use secp256k1::rand::rngs::OsRng;
    use secp256k1::{Secp256k1, SecretKey};

    const EASY_BITS: u32 = 0x207fffff;

    fn keypair() -> (SecretKey, String) {
        let secp = Secp256k1::new();
        let mut rng = OsRng;
        let sk = SecretKey::new(&mut rng);
        let addr = crate::core::address::pubkey_to_address(&sk.public_key(&secp).serialize());
        (sk, addr)
    }

    fn mine(mut block: Block) -> Block {
        let target = compact_to_big(block.bits);
        loop {
            block.hash = block.compute_hash();
            if hash_meets_target(&block.hash, &target) {
                return block;
            }
            block.nonce += 1;
        }
    }

    fn child_of(parent: &Block, txs: Vec<Transaction>) -> Block {
        mine(Block::new(
            parent.height + 1,
            parent.hash,
            parent.timestamp + 30,
            EASY_BITS,
            txs,
        ))
    }

    fn genesis_utxo() -> (Block, UtxoSet) {
        let genesis = Block::genesis(EASY_BITS);
        let mut utxo = UtxoSet::new(None);
        utxo.add(&genesis.transactions[0]);
        (genesis, utxo)
    }

    #[test]
    fn test_valid_empty_block() {
        let (genesis, utxo) = genesis_utxo();
        let block = child_of(&genesis, vec![Transaction::coinbase("miner", BLOCK_REWARD, "1")]);
        assert_eq!(
            validate_block(&block, &genesis.hash, 0, EASY_BITS, &utxo, BLOCK_REWARD),
            Ok(())
        );
    }

    #[test]
    fn test_bad_link_and_height() {
        let (genesis, utxo) = genesis_utxo();
        let block = child_of(&genesis, vec![Transaction::coinbase("miner", BLOCK_REWARD, "1")]);

        let wrong_parent = Hash256::new([9; 32]);
        assert_eq!(
            validate_block(&block, &wrong_parent, 0, EASY_BITS, &utxo, BLOCK_REWARD),
            Err(ValidationError::BadLink)
        );
        assert_eq!(
            validate_block(&block, &genesis.hash, 5, EASY_BITS, &utxo, BLOCK_REWARD),
            Err(ValidationError::BadHeight)
        );
    }

    #[test]
    fn test_difficulty_schedule_enforced() {
        let (genesis, utxo) = genesis_utxo();
        let block = child_of(&genesis, vec![Transaction::coinbase("miner", BLOCK_REWARD, "1")]);
        assert_eq!(
            validate_block(&block, &genesis.hash, 0, 0x1d00ffff, &utxo, BLOCK_REWARD),
            Err(ValidationError::BadDifficulty)
        );
    }

    #[test]
    fn test_pow_rejected_on_hard_target() {
        let (genesis, utxo) = genesis_utxo();
        // bits encode an effectively unreachable target; the unmined hash fails
        let hard_bits = 0x03000001;
        let mut block = Block::new(
            1,
            genesis.hash,
            genesis.timestamp + 30,
            hard_bits,
            vec![Transaction::coinbase("miner", BLOCK_REWARD, "1")],
        );
        block.hash = block.compute_hash();
        assert_eq!(
            validate_block(&block, &genesis.hash, 0, hard_bits, &utxo, BLOCK_REWARD),
            Err(ValidationError::InvalidProofOfWork)
        );
    }

    #[test]
    fn test_tampered_hash_rejected() {
        let (genesis, utxo) = genesis_utxo();
        let mut block = child_of(&genesis, vec![Transaction::coinbase("miner", BLOCK_REWARD, "1")]);
        block.hash = Hash256::zero();
        assert_eq!(
            validate_block(&block, &genesis.hash, 0, EASY_BITS, &utxo, BLOCK_REWARD),
            Err(ValidationError::HashMismatch)
        );
    }

    #[test]
    fn test_missing_coinbase_rejected() {
        let (genesis, utxo) = genesis_utxo();
        let (sk, _) = keypair();
        let mut tx = Transaction::new(
            vec![TxInput::new("aa".repeat(32), 0)],
            vec![TxOutput::new(1, "bob".to_string())],
        );
        tx.sign(&sk).unwrap();
        let block = child_of(&genesis, vec![tx]);
        assert_eq!(
            validate_block(&block, &genesis.hash, 0, EASY_BITS, &utxo, BLOCK_REWARD),
            Err(ValidationError::MissingCoinbase)
        );
    }

    #[test]
    fn test_excess_coinbase_rejected() {
        let (genesis, utxo) = genesis_utxo();
        let block = child_of(
            &genesis,
            vec![Transaction::coinbase("miner", BLOCK_REWARD + 1, "1")],
        );
        assert_eq!(
            validate_block(&block, &genesis.hash, 0, EASY_BITS, &utxo, BLOCK_REWARD),
            Err(ValidationError::ExcessCoinbaseValue)
        );
    }

    #[test]
    fn test_coinbase_may_claim_fees() {
        // mine a spendable output first
        let (sk, addr) = keypair();
        let (genesis, mut utxo) = genesis_utxo();
        let fund = child_of(&genesis, vec![Transaction::coinbase(&addr, BLOCK_REWARD, "1")]);
        utxo.add(&fund.transactions[0]);

        let mut spend = Transaction::new(
            vec![TxInput::new(fund.transactions[0].id.clone(), 0)],
            vec![TxOutput::new(BLOCK_REWARD - 3, "bob".to_string())],
        );
        spend.sign(&sk).unwrap();

        let block = child_of(
            &fund,
            vec![Transaction::coinbase("miner", BLOCK_REWARD + 3, "2"), spend],
        );
        assert_eq!(
            validate_block(&block, &fund.hash, 1, EASY_BITS, &utxo, BLOCK_REWARD),
            Ok(())
        );
    }

    #[test]
    fn test_spend_of_missing_utxo_rejected() {
        let (genesis, utxo) = genesis_utxo();
        let (sk, _) = keypair();
        let mut ghost = Transaction::new(
            vec![TxInput::new("bb".repeat(32), 7)],
            vec![TxOutput::new(1, "bob".to_string())],
        );
        ghost.sign(&sk).unwrap();
        let block = child_of(
            &genesis,
            vec![Transaction::coinbase("miner", BLOCK_REWARD, "1"), ghost],
        );
        assert!(matches!(
            validate_block(&block, &genesis.hash, 0, EASY_BITS, &utxo, BLOCK_REWARD),
            Err(ValidationError::MissingUtxo(_))
        ));
    }

    #[test]
    fn test_in_block_chaining_allowed() {
        // a transaction may spend the output of an earlier one in the block
        let (sk, addr) = keypair();
        let (sk2, addr2) = keypair();
        let (genesis, mut utxo) = genesis_utxo();
        let fund = child_of(&genesis, vec![Transaction::coinbase(&addr, BLOCK_REWARD, "1")]);
        utxo.add(&fund.transactions[0]);

        let mut first = Transaction::new(
            vec![TxInput::new(fund.transactions[0].id.clone(), 0)],
            vec![TxOutput::new(BLOCK_REWARD, addr2.clone())],
        );
        first.sign(&sk).unwrap();
        let mut second = Transaction::new(
            vec![TxInput::new(first.id.clone(), 0)],
            vec![TxOutput::new(BLOCK_REWARD, "carol".to_string())],
        );
        second.sign(&sk2).unwrap();

        let block = child_of(
            &fund,
            vec![Transaction::coinbase("miner", BLOCK_REWARD, "2"), first, second],
        );
        assert_eq!(
            validate_block(&block, &fund.hash, 1, EASY_BITS, &utxo, BLOCK_REWARD),
            Ok(())
        );
    }

    #[test]
    fn test_double_spend_within_block_rejected() {
        let (sk, addr) = keypair();
        let (genesis, mut utxo) = genesis_utxo();
        let fund = child_of(&genesis, vec![Transaction::coinbase(&addr, BLOCK_REWARD, "1")]);
        utxo.add(&fund.transactions[0]);

        let mut a = Transaction::new(
            vec![TxInput::new(fund.transactions[0].id.clone(), 0)],
            vec![TxOutput::new(BLOCK_REWARD, "bob".to_string())],
        );
        a.sign(&sk).unwrap();
        let mut b = Transaction::new(
            vec![TxInput::new(fund.transactions[0].id.clone(), 0)],
            vec![TxOutput::new(BLOCK_REWARD, "carol".to_string())],
        );
        b.sign(&sk).unwrap();

        let block = child_of(
            &fund,
            vec![Transaction::coinbase("miner", BLOCK_REWARD, "2"), a, b],
        );
        assert!(matches!(
            validate_block(&block, &fund.hash, 1, EASY_BITS, &utxo, BLOCK_REWARD),
            Err(ValidationError::MissingUtxo(_))
        ));
    }

    #[test]
    fn test_bad_merkle_rejected() {
        let (genesis, utxo) = genesis_utxo();
        let mut block = child_of(&genesis, vec![Transaction::coinbase("miner", BLOCK_REWARD, "1")]);
        block.merkle_root = Hash256::new([3; 32]);
        block = mine(block);
        assert_eq!(
            validate_block(&block, &genesis.hash, 0, EASY_BITS, &utxo, BLOCK_REWARD),
            Err(ValidationError::InvalidMerkleRoot)
        );
    }

    #[test]
    fn test_validate_chain_accepts_valid_chain() {
        let (sk, addr) = keypair();
        let genesis = Block::genesis(EASY_BITS);
        let fund = child_of(&genesis, vec![Transaction::coinbase(&addr, BLOCK_REWARD, "1")]);

        let mut spend = Transaction::new(
            vec![TxInput::new(fund.transactions[0].id.clone(), 0)],
            vec![TxOutput::new(BLOCK_REWARD - 2, "bob".to_string())],
        );
        spend.sign(&sk).unwrap();
        let next = child_of(
            &fund,
            vec![Transaction::coinbase("miner", BLOCK_REWARD + 2, "2"), spend],
        );

        let utxo = validate_chain(&[genesis, fund, next], BLOCK_REWARD).unwrap();
        assert_eq!(utxo.balance("bob"), BLOCK_REWARD - 2);
        assert_eq!(utxo.balance("miner"), BLOCK_REWARD + 2);
    }

    #[test]
    fn test_validate_chain_rejects_value_creation() {
        // a mid-chain transaction minting coins out of thin air must fail
        // the replay even though it is structurally well-formed
        let (sk, addr) = keypair();
        let genesis = Block::genesis(EASY_BITS);
        let fund = child_of(&genesis, vec![Transaction::coinbase(&addr, BLOCK_REWARD, "1")]);

        let mut minty = Transaction::new(
            vec![TxInput::new(fund.transactions[0].id.clone(), 0)],
            vec![TxOutput::new(BLOCK_REWARD * 5, "thief".to_string())],
        );
        minty.sign(&sk).unwrap();
        let bad = child_of(
            &fund,
            vec![Transaction::coinbase("miner", BLOCK_REWARD, "2"), minty],
        );
        let good_tip = child_of(&bad, vec![Transaction::coinbase("miner", BLOCK_REWARD, "3")]);

        assert_eq!(
            validate_chain(&[genesis, fund, bad, good_tip], BLOCK_REWARD).err(),
            Some(ValidationError::OutputsExceedInputs)
        );
    }

    #[test]
    fn test_validate_chain_rejects_empty() {
        assert_eq!(
            validate_chain(&[], BLOCK_REWARD).err(),
            Some(ValidationError::EmptyChain)
        );
    }

    #[test]
    fn test_retarget_clamps_and_caps() {
        let cap = max_target();
        let old = max_target() >> 16;

        // perfect spacing keeps the target
        assert_eq!(retarget(&old, INTERVAL_TIMESPAN_SECS, &cap), old);

        // instant blocks clamp to a quarter
        assert_eq!(retarget(&old, 0, &cap), &old / BigUint::from(4u32));

        // a huge span clamps to four times
        assert_eq!(
            retarget(&old, INTERVAL_TIMESPAN_SECS * 100, &cap),
            &old * BigUint::from(4u32)
        );

        // the result never exceeds the network maximum
        assert_eq!(retarget(&cap, INTERVAL_TIMESPAN_SECS * 100, &cap), cap);
    }
}
