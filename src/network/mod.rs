// P2P networking

pub mod addr;
pub mod dto;
pub mod handler;
pub mod message;
pub mod peer;
pub mod peer_manager;

pub use addr::AddrManager;
pub use dto::{BlockDto, HeaderDto, TxDto};
pub use handler::Handler;
pub use message::{InvKind, InvPayload, Message, VersionPayload};
pub use peer::{Peer, PeerState};

use crate::core::Block;
use crate::node::{Broadcaster, Node};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

pub const PROTOCOL_VERSION: u32 = 1;

/// Peer registry and broadcast fan-out. Listener, dialing and maintenance
/// live in `peer_manager`; the message state machine in `handler`.
pub struct Network {
    pub node: Arc<Node>,
    pub listen_addr: String,
    /// Advertised identity; used for self-connect and duplicate detection.
    pub node_id: String,
    pub max_peers: usize,
    peers: StdMutex<HashMap<String, Arc<Peer>>>,
    pub addr_manager: AddrManager,
}

impl Network {
    pub fn new(node: Arc<Node>, listen_addr: String, node_id: String, max_peers: usize) -> Arc<Self> {
        Arc::new(Self {
            node,
            listen_addr,
            node_id,
            max_peers,
            peers: StdMutex::new(HashMap::new()),
            addr_manager: AddrManager::new(),
        })
    }

    /// Register a connection; refuses past the peer cap.
    pub fn register(&self, peer: Arc<Peer>) -> bool {
        let mut peers = self.peers.lock().expect("peers lock");
        if peers.len() >= self.max_peers {
            return false;
        }
        peers.insert(peer.addr.clone(), peer);
        true
    }

    pub fn remove(&self, addr: &str) {
        if self.peers.lock().expect("peers lock").remove(addr).is_some() {
            log::info!("peer disconnected: {}", addr);
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().expect("peers lock").len()
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.peers.lock().expect("peers lock").contains_key(addr)
    }

    pub fn outbound_count(&self) -> usize {
        self.peers
            .lock()
            .expect("peers lock")
            .values()
            .filter(|p| p.outbound && !p.is_closed())
            .count()
    }

    /// Snapshot of active peers; taken without the node lock so broadcast
    /// sends never nest inside it.
    pub fn active_peers(&self) -> Vec<Arc<Peer>> {
        self.peers
            .lock()
            .expect("peers lock")
            .values()
            .filter(|p| p.is_active() && !p.is_closed())
            .cloned()
            .collect()
    }

    /// Find an older connection claiming the same node id ("prefer new").
    pub fn find_duplicate(&self, node_id: &str, except_addr: &str) -> Option<Arc<Peer>> {
        if node_id.is_empty() {
            return None;
        }
        self.peers
            .lock()
            .expect("peers lock")
            .values()
            .find(|p| p.addr != except_addr && p.node_id() == node_id)
            .cloned()
    }

    /// Drop closed connections from the registry.
    pub fn cleanup(&self) {
        let mut peers = self.peers.lock().expect("peers lock");
        peers.retain(|addr, peer| {
            if peer.is_closed() {
                log::info!("peer removed: {}", addr);
                false
            } else {
                true
            }
        });
    }

    pub async fn version_payload(&self) -> VersionPayload {
        VersionPayload {
            version: PROTOCOL_VERSION,
            height: self.node.height().await,
            cum_work: self.node.best_cum_work_hex().await,
            node_id: self.node_id.clone(),
        }
    }

    /// Send an inventory announcement to every active peer except the
    /// originator.
    pub fn broadcast_inv(&self, kind: InvKind, hash: String, except_addr: Option<&str>) {
        let msg = Message::Inv(InvPayload {
            kind,
            hashes: vec![hash],
        });
        for peer in self.active_peers() {
            if Some(peer.addr.as_str()) == except_addr {
                continue;
            }
            let msg = msg.clone();
            tokio::spawn(async move {
                if let Err(e) = peer.send(&msg).await {
                    log::debug!("inv send to {} failed: {}", peer.addr, e);
                }
            });
        }
    }

    /// Push a full block to every active peer (used for self-mined blocks).
    pub fn broadcast_block(&self, block: &Block) {
        let msg = Message::Block(BlockDto::from_block(block));
        let peers = self.active_peers();
        log::info!("broadcasting block {} to {} peers", block.hash, peers.len());
        for peer in peers {
            let msg = msg.clone();
            tokio::spawn(async move {
                if let Err(e) = peer.send(&msg).await {
                    log::debug!("block send to {} failed: {}", peer.addr, e);
                }
            });
        }
    }
}

impl Broadcaster for Network {
    fn announce_block(&self, block: Block) {
        self.broadcast_block(&block);
    }

    fn announce_tx(&self, txid: String) {
        self.broadcast_inv(InvKind::Tx, txid, None);
    }
}
