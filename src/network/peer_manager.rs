// Peer lifecycle: listener, outbound dialing, maintenance

use crate::network::handler::Handler;
use crate::network::message::{Message, PingPayload};
use crate::network::peer::{read_message, Peer, PeerState};
use crate::network::Network;
use crate::storage::BUCKET_PEERSTORE;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

/// Seconds of silence before the maintenance task pings a peer.
const PING_AFTER_SECS: i64 = 60;

/// Persisted record of a previously reachable peer.
#[derive(Serialize, Deserialize)]
struct PeerRecord {
    addr: String,
    last_seen: i64,
}

impl Network {
    /// Bind the listener, restore and dial known peers, and start the
    /// maintenance task. Returns the actual bound address (the configured
    /// one may carry port 0).
    pub async fn start(
        self: &Arc<Self>,
        handler: Arc<Handler>,
        seeds: &[String],
    ) -> Result<String, String> {
        for seed in seeds {
            if seed != &self.listen_addr && seed != &self.node_id {
                self.addr_manager.add(seed);
            }
        }
        for addr in self.load_peer_addrs() {
            self.addr_manager.add(&addr);
        }

        let listener = TcpListener::bind(&self.listen_addr)
            .await
            .map_err(|e| format!("failed to bind {}: {}", self.listen_addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| format!("no local addr: {}", e))?
            .to_string();
        log::info!("p2p listening on {}", local_addr);

        let network = Arc::clone(self);
        let accept_handler = Arc::clone(&handler);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        network
                            .on_connection(stream, remote.to_string(), false, &accept_handler)
                            .await;
                    }
                    Err(e) => {
                        log::warn!("accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
        });

        let network = Arc::clone(self);
        let maintain_handler = Arc::clone(&handler);
        tokio::spawn(async move {
            network.maintain_loop(maintain_handler).await;
        });

        self.ensure_peers(&handler).await;
        Ok(local_addr)
    }

    /// Dial an address, skipping ourselves, duplicates and the outbound cap.
    pub async fn connect(self: &Arc<Self>, addr: &str, handler: &Arc<Handler>) {
        if addr == self.listen_addr || addr == self.node_id || self.contains(addr) {
            return;
        }
        if self.outbound_count() >= self.max_peers / 2 + 1 {
            return;
        }

        match TcpStream::connect(addr).await {
            Ok(stream) => {
                self.on_connection(stream, addr.to_string(), true, handler).await;
                self.save_peer(addr);
            }
            Err(e) => log::debug!("dial {} failed: {}", addr, e),
        }
    }

    /// Wrap an established connection in a peer and spawn its read loop.
    async fn on_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        addr: String,
        outbound: bool,
        handler: &Arc<Handler>,
    ) {
        let _ = stream.set_nodelay(true);
        let (mut reader, writer) = stream.into_split();
        let peer = Arc::new(Peer::new(writer, addr.clone(), outbound));

        if !self.register(Arc::clone(&peer)) {
            log::warn!("peer cap reached, refusing {}", addr);
            peer.close().await;
            return;
        }
        log::info!(
            "new {} connection: {}",
            if outbound { "outbound" } else { "inbound" },
            addr
        );

        if outbound {
            self.addr_manager.add(&addr);
            let version = self.version_payload().await;
            if peer.send(&Message::Version(version)).await.is_err() {
                self.remove(&addr);
                return;
            }
            peer.set_state(PeerState::VersionSent);
        }

        let network = Arc::clone(self);
        let handler = Arc::clone(handler);
        tokio::spawn(async move {
            loop {
                if peer.is_closed() {
                    break;
                }
                match read_message(&mut reader).await {
                    Ok(msg) => handler.on_message(&peer, msg).await,
                    Err(e) => {
                        log::debug!("peer {} read loop ended: {}", peer.addr, e);
                        break;
                    }
                }
            }
            peer.mark_closed();
            network.remove(&peer.addr);
        });
    }

    /// Top the peer set back up from the address manager.
    pub async fn ensure_peers(self: &Arc<Self>, handler: &Arc<Handler>) {
        let have = self.peer_count();
        if have >= self.max_peers {
            return;
        }
        for addr in self.addr_manager.get_some(self.max_peers - have) {
            self.connect(&addr, handler).await;
        }
    }

    async fn maintain_loop(self: Arc<Self>, handler: Arc<Handler>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            ticker.tick().await;
            self.cleanup();
            self.ensure_peers(&handler).await;
            self.ping_idle_peers().await;
        }
    }

    async fn ping_idle_peers(&self) {
        let now = crate::node::now_secs();
        for peer in self.active_peers() {
            if now - peer.last_seen() >= PING_AFTER_SECS {
                let nonce: u64 = rand::random();
                let _ = peer.send(&Message::Ping(PingPayload { nonce })).await;
            }
        }
    }

    fn save_peer(&self, addr: &str) {
        let record = PeerRecord {
            addr: addr.to_string(),
            last_seen: crate::node::now_secs(),
        };
        if let Ok(bytes) = serde_json::to_vec(&record) {
            if let Err(e) = self.node.db.put(BUCKET_PEERSTORE, addr, &bytes) {
                log::warn!("failed to persist peer {}: {}", addr, e);
            }
        }
    }

    fn load_peer_addrs(&self) -> Vec<String> {
        let mut addrs = Vec::new();
        let _ = self.node.db.iterate(BUCKET_PEERSTORE, |k, _| {
            addrs.push(String::from_utf8_lossy(k).to_string());
        });
        if !addrs.is_empty() {
            log::info!("restoring {} known peers", addrs.len());
        }
        addrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::miner::solve_pow;
    use crate::node::{BlockAccept, Node, NodeConfig};
    use crate::storage::Store;
    use crate::wallet::KeyPair;
    use num_bigint::BigUint;

    fn test_config() -> NodeConfig {
        NodeConfig {
            max_target: (BigUint::from(1u32) << 255) - BigUint::from(1u32),
            ..NodeConfig::default()
        }
    }

    fn open_node() -> Arc<Node> {
        Node::open(Store::memory().unwrap(), test_config()).unwrap()
    }

    async fn mine_one(node: &Arc<Node>, address: &str) -> crate::core::Block {
        let template = {
            let state = node.lock().await;
            node.build_template(&state, address)
        };
        let block = solve_pow(template, || false).unwrap();
        assert_eq!(
            node.accept_block(block.clone()).await,
            BlockAccept::Connected { tip_advanced: true }
        );
        block
    }

    /// Spin up a node with listener + handler on an ephemeral port.
    async fn start_network(node: Arc<Node>, id: &str) -> (Arc<Network>, Arc<Handler>, String) {
        let network = Network::new(
            Arc::clone(&node),
            "127.0.0.1:0".to_string(),
            id.to_string(),
            8,
        );
        node.set_broadcaster(network.clone());
        let handler = Handler::new(node, Arc::clone(&network));
        let addr = network.start(Arc::clone(&handler), &[]).await.unwrap();
        (network, handler, addr)
    }

    async fn wait_until<F, Fut>(what: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..400 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn test_headers_first_sync() {
        // a fresh node joins a network whose tip is past a retarget
        // boundary and catches up: headers in batches, then bodies oldest
        // to newest, then a full UTXO rebuild
        let server = open_node();
        let miner = KeyPair::generate();
        for _ in 0..12 {
            mine_one(&server, &miner.address).await;
        }

        let (_snet, _shandler, server_addr) = start_network(Arc::clone(&server), "server").await;

        let client = open_node();
        let (cnet, chandler, _caddr) = start_network(Arc::clone(&client), "client").await;
        cnet.connect(&server_addr, &chandler).await;

        let c = Arc::clone(&client);
        wait_until("client sync", move || {
            let c = Arc::clone(&c);
            async move { c.is_synced().await && c.height().await == 12 }
        })
        .await;

        assert_eq!(client.tip_hash().await, server.tip_hash().await);
        assert_eq!(
            client.balance(&miner.address).await,
            server.balance(&miner.address).await
        );

        // UTXO matches an independent replay of the full chain
        let state = client.lock().await;
        let mut replay = crate::storage::UtxoSet::new(None);
        replay.rebuild(&state.chain).unwrap();
        assert_eq!(
            state.utxo.balance(&miner.address),
            replay.balance(&miner.address)
        );
        assert_eq!(state.utxo.len(), replay.len());
    }

    #[tokio::test]
    async fn test_live_block_relay() {
        // two synced nodes; a block mined on one propagates to the other
        let n1 = open_node();
        let n2 = open_node();
        let (_net1, _h1, addr1) = start_network(Arc::clone(&n1), "relay-1").await;
        let (net2, h2, _addr2) = start_network(Arc::clone(&n2), "relay-2").await;

        net2.connect(&addr1, &h2).await;
        let netc = Arc::clone(&net2);
        wait_until("handshake", move || {
            let net = Arc::clone(&netc);
            async move { !net.active_peers().is_empty() }
        })
        .await;

        // mine on n1 and push through its broadcaster, as the miner does
        let a = KeyPair::generate();
        let block = mine_one(&n1, &a.address).await;
        n1.broadcaster().unwrap().announce_block(block.clone());

        let n2c = Arc::clone(&n2);
        let expect = block.hash;
        wait_until("relay", move || {
            let n = Arc::clone(&n2c);
            async move { n.tip_hash().await == expect }
        })
        .await;
        assert_eq!(n2.height().await, 1);
    }

    #[tokio::test]
    async fn test_self_connect_rejected() {
        let node = open_node();
        let (network, handler, addr) = start_network(Arc::clone(&node), "selfish").await;

        // dialing our own listen address with our own node id
        network.connect(&addr, &handler).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        // the handshake is refused: no peer ever reaches active state
        assert!(network.active_peers().is_empty());
    }
}
