// Miner: template assembly and a preemptible proof-of-work loop

use crate::consensus::pow::{compact_to_big, hash_meets_target_bytes, target_to_hash};
use crate::core::Block;
use crate::node::{BlockAccept, Node};
use std::sync::Arc;
use std::time::Duration;

/// Nonces tried between preemption checks.
const ABORT_CHECK_INTERVAL: u64 = 1024;

/// Iterate the nonce until the header hash meets the target encoded in the
/// block's bits. `abort` is polled every 1024 nonces; a true return
/// abandons the candidate.
pub fn solve_pow<F>(mut block: Block, mut abort: F) -> Option<Block>
where
    F: FnMut() -> bool,
{
    let target = compact_to_big(block.bits);
    let target_hash = target_to_hash(&target);

    let mut nonce: u64 = 0;
    loop {
        if nonce % ABORT_CHECK_INTERVAL == 0 && abort() {
            return None;
        }

        block.nonce = nonce;
        let hash = block.compute_hash();
        if hash_meets_target_bytes(&hash, &target_hash) {
            block.hash = hash;
            return Some(block);
        }

        nonce = match nonce.checked_add(1) {
            Some(n) => n,
            None => return None,
        };
    }
}

pub struct Miner {
    node: Arc<Node>,
    address: String,
}

impl Miner {
    pub fn new(node: Arc<Node>, address: String) -> Self {
        Self { node, address }
    }

    /// Mining loop: wait for sync, snapshot the tip, solve, submit through
    /// the normal acceptance path, broadcast. A tip change signalled on the
    /// preemption channel or observed by reloading the tip hash aborts the
    /// current candidate.
    pub async fn run(self) {
        let mut reset_rx = match self.node.take_reset_receiver() {
            Some(rx) => rx,
            None => {
                log::error!("miner preemption channel already taken; not mining");
                return;
            }
        };
        log::info!("miner started, rewards to {}", self.address);

        loop {
            if !self.node.is_synced().await {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            // stale signals from before this template are meaningless
            while reset_rx.try_recv().is_ok() {}

            let (template, tip_hash) = {
                let state = self.node.lock().await;
                (self.node.build_template(&state, &self.address), state.tip().hash)
            };
            let height = template.height;

            let node = Arc::clone(&self.node);
            let solved = tokio::task::spawn_blocking(move || {
                let result = solve_pow(template, || {
                    if reset_rx.try_recv().is_ok() {
                        return true;
                    }
                    node.blocking_lock().tip().hash != tip_hash
                });
                (result, reset_rx)
            })
            .await;

            let (result, rx) = match solved {
                Ok(pair) => pair,
                Err(e) => {
                    log::error!("mining task failed: {}", e);
                    return;
                }
            };
            reset_rx = rx;

            let block = match result {
                Some(block) => block,
                None => {
                    log::debug!("mining preempted at height {}", height);
                    continue;
                }
            };

            log::info!("mined block {} at height {}", block.hash, block.height);
            match self.node.accept_block(block.clone()).await {
                BlockAccept::Connected { tip_advanced: true } => {
                    if let Some(broadcaster) = self.node.broadcaster() {
                        broadcaster.announce_block(block);
                    }
                }
                other => log::warn!("self-mined block not connected: {:?}", other),
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
