// Network consensus parameters

use num_bigint::BigUint;

/// Base block subsidy paid to the miner, before fees.
pub const BLOCK_REWARD: u64 = 100;

/// Difficulty is recomputed every this many blocks.
pub const DIFFICULTY_INTERVAL: u64 = 10;

/// Desired seconds between blocks.
pub const TARGET_SPACING_SECS: i64 = 30;

/// Expected wall-clock span of one difficulty interval.
pub const INTERVAL_TIMESPAN_SECS: i64 = DIFFICULTY_INTERVAL as i64 * TARGET_SPACING_SECS;

/// Cap on transactions packed into a mined block, coinbase included.
pub const MAX_TXS_PER_BLOCK: usize = 100;

/// Mempool capacity before lowest-fee eviction kicks in.
pub const MEMPOOL_MAX_TXS: usize = 1000;

/// Headers served per getheaders response.
pub const MAX_HEADERS_PER_MSG: usize = 2000;

/// In pruned mode, bodies deeper than this below the tip are dropped.
pub const PRUNE_DEPTH: u64 = 100;

/// Default peer-to-peer port.
pub const DEFAULT_PORT: u16 = 9001;

/// The easiest allowed target (minimum difficulty), also the genesis target.
pub fn max_target() -> BigUint {
    BigUint::parse_bytes(
        b"00000fffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        16,
    )
    .expect("max target literal is valid hex")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_target_magnitude() {
        // 20 leading zero bits: 256 - 20 = 236 significant bits
        assert_eq!(max_target().bits(), 236);
    }
}
