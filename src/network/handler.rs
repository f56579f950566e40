// Protocol state machine: one handler shared by every peer read loop

use crate::consensus::params::MAX_HEADERS_PER_MSG;
use crate::consensus::pow::{compact_to_big, hash_meets_target};
use crate::core::Hash256;
use crate::network::dto::{BlockDto, HeaderDto};
use crate::network::message::{
    AddrPayload, GetDataPayload, GetHeadersPayload, HeadersPayload, InvKind, InvPayload, Message,
    TxPayload, VersionPayload,
};
use crate::network::peer::{Peer, PeerState};
use crate::network::Network;
use crate::node::{BlockAccept, Node, SyncState};
use std::sync::Arc;

pub struct Handler {
    pub node: Arc<Node>,
    pub network: Arc<Network>,
}

impl Handler {
    pub fn new(node: Arc<Node>, network: Arc<Network>) -> Arc<Self> {
        Arc::new(Self { node, network })
    }

    pub async fn on_message(&self, peer: &Arc<Peer>, msg: Message) {
        peer.touch();
        log::debug!("{} <- {}", peer.addr, msg.kind());

        match msg {
            Message::Version(v) => self.handle_version(peer, v).await,
            Message::Verack => self.handle_verack(peer).await,
            Message::Getaddr => self.handle_getaddr(peer).await,
            Message::Addr(payload) => self.handle_addr(peer, payload).await,
            Message::Getheaders(req) => self.handle_getheaders(peer, req).await,
            Message::Headers(payload) => self.handle_headers(peer, payload).await,
            Message::Inv(inv) => self.handle_inv(peer, inv).await,
            Message::Getdata(req) => self.handle_getdata(peer, req).await,
            Message::Block(dto) => self.handle_block(peer, dto).await,
            Message::Tx(payload) => self.handle_tx(peer, payload).await,
            Message::Ping(p) => {
                let _ = peer.send(&Message::Pong(p)).await;
            }
            Message::Pong(_) => {}
        }
    }

    // ------------------------------------------------------------------
    // handshake
    // ------------------------------------------------------------------

    async fn handle_version(&self, peer: &Arc<Peer>, v: VersionPayload) {
        // self-connect: a version carrying our own identity
        if v.node_id == self.network.node_id {
            log::warn!("rejecting self-connection via {}", peer.addr);
            peer.close().await;
            return;
        }
        peer.set_meta(v.height, v.cum_work.clone(), v.node_id);

        match peer.state() {
            PeerState::Init => {
                // inbound: answer with our version, then acknowledge
                let version = self.network.version_payload().await;
                if peer.send(&Message::Version(version)).await.is_err() {
                    return;
                }
                let _ = peer.send(&Message::Verack).await;
                peer.set_state(PeerState::VersionRecv);
            }
            PeerState::VersionSent => {
                let _ = peer.send(&Message::Verack).await;
                peer.set_state(PeerState::VersionRecv);
            }
            _ => {}
        }
    }

    async fn handle_verack(&self, peer: &Arc<Peer>) {
        if peer.state() < PeerState::VersionRecv {
            return;
        }

        // an older connection from the same node gives way to the new one
        if let Some(old) = self.network.find_duplicate(&peer.node_id(), &peer.addr) {
            log::info!(
                "duplicate peer {} (old connection {}), closing the old one",
                peer.node_id(),
                old.addr
            );
            self.network.remove(&old.addr);
            tokio::spawn(async move { old.close().await });
        }

        peer.set_state(PeerState::Active);
        log::info!("peer active: {} ({})", peer.addr, peer.node_id());

        // address discovery, then headers-first sync kickoff
        let _ = peer.send(&Message::Getaddr).await;
        self.send_getheaders(peer).await;
    }

    async fn send_getheaders(&self, peer: &Arc<Peer>) {
        let locators = self
            .node
            .locator()
            .await
            .iter()
            .map(|h| h.to_hex())
            .collect();
        let _ = peer
            .send(&Message::Getheaders(GetHeadersPayload { locators }))
            .await;
    }

    // ------------------------------------------------------------------
    // address gossip
    // ------------------------------------------------------------------

    async fn handle_getaddr(&self, peer: &Arc<Peer>) {
        let mut addrs = self.network.addr_manager.get_all();
        addrs.truncate(1000);
        let count = addrs.len();
        if peer.send(&Message::Addr(AddrPayload { addrs })).await.is_ok() {
            log::debug!("sent {} addrs to {}", count, peer.addr);
        }
    }

    async fn handle_addr(&self, peer: &Arc<Peer>, payload: AddrPayload) {
        let fresh: Vec<String> = payload
            .addrs
            .into_iter()
            .filter(|a| {
                a != &self.network.listen_addr
                    && a != &self.network.node_id
                    && !self.network.contains(a)
            })
            .collect();
        let added = self.network.addr_manager.add_many(&fresh);
        if added > 0 {
            log::info!("learned {} new addresses from {}", added, peer.addr);
        }
    }

    // ------------------------------------------------------------------
    // inventory
    // ------------------------------------------------------------------

    async fn handle_inv(&self, peer: &Arc<Peer>, inv: InvPayload) {
        match inv.kind {
            InvKind::Block => {
                for hash_hex in &inv.hashes {
                    let hash = match Hash256::from_hex(hash_hex) {
                        Ok(h) => h,
                        Err(_) => continue,
                    };
                    if !self.node.has_full_block(&hash).await {
                        let _ = peer
                            .send(&Message::Getdata(GetDataPayload {
                                kind: InvKind::Block,
                                hash: hash_hex.clone(),
                            }))
                            .await;
                    }
                }
            }
            InvKind::Tx => {
                for txid in &inv.hashes {
                    let known = self.node.lock().await.mempool.has(txid);
                    if !known {
                        let _ = peer
                            .send(&Message::Getdata(GetDataPayload {
                                kind: InvKind::Tx,
                                hash: txid.clone(),
                            }))
                            .await;
                    }
                }
            }
        }
    }

    async fn handle_getdata(&self, peer: &Arc<Peer>, req: GetDataPayload) {
        match req.kind {
            InvKind::Block => {
                let hash = match Hash256::from_hex(&req.hash) {
                    Ok(h) => h,
                    Err(_) => return,
                };
                if let Some(block) = self.node.get_block(&hash).await {
                    let _ = peer.send(&Message::Block(BlockDto::from_block(&block))).await;
                }
            }
            InvKind::Tx => {
                let tx = self.node.lock().await.mempool.get_decoded(&req.hash);
                if let Some(tx) = tx {
                    let _ = peer
                        .send(&Message::Tx(TxPayload {
                            tx: crate::network::dto::TxDto::from_tx(&tx),
                        }))
                        .await;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // blocks and transactions
    // ------------------------------------------------------------------

    async fn handle_block(&self, peer: &Arc<Peer>, dto: BlockDto) {
        let block = match dto.to_block() {
            Ok(block) => block,
            Err(e) => {
                log::warn!("undecodable block from {}: {}", peer.addr, e);
                return;
            }
        };
        let hash = block.hash;
        log::debug!("block {} at height {} from {}", hash, block.height, peer.addr);

        match self.node.accept_block(block).await {
            BlockAccept::AlreadyKnown => {
                if !self.node.is_synced().await {
                    self.request_next_body(peer).await;
                }
            }
            BlockAccept::Orphan => {
                // recover the gap through a header request
                self.send_getheaders(peer).await;
            }
            BlockAccept::Rejected(e) => {
                log::warn!("block {} from {} rejected: {}", hash, peer.addr, e);
            }
            BlockAccept::Connected { tip_advanced } => {
                if !self.node.is_synced().await {
                    // body backfill continues, no relay while syncing
                    self.request_next_body(peer).await;
                    return;
                }
                // the sender may have more beyond this block
                self.send_getheaders(peer).await;
                if tip_advanced {
                    self.network
                        .broadcast_inv(InvKind::Block, hash.to_hex(), Some(&peer.addr));
                }
            }
        }
    }

    async fn handle_tx(&self, peer: &Arc<Peer>, payload: TxPayload) {
        let tx = match payload.tx.to_tx() {
            Ok(tx) => tx,
            Err(e) => {
                log::warn!("undecodable tx from {}: {}", peer.addr, e);
                return;
            }
        };
        let txid = tx.id.clone();

        match self.node.add_transaction(tx).await {
            Ok(()) => {
                if self.node.is_synced().await {
                    self.network
                        .broadcast_inv(InvKind::Tx, txid, Some(&peer.addr));
                }
            }
            Err(e) => log::debug!("tx {} from {} rejected: {}", txid, peer.addr, e),
        }
    }

    // ------------------------------------------------------------------
    // headers-first sync
    // ------------------------------------------------------------------

    /// Serve up to 2000 successor headers, walking the main-chain array
    /// strictly linearly from the highest locator hash on our main chain.
    async fn handle_getheaders(&self, peer: &Arc<Peer>, req: GetHeadersPayload) {
        let headers = {
            let state = self.node.lock().await;

            let mut start: i64 = -1;
            for hash_hex in &req.locators {
                if let Ok(hash) = Hash256::from_hex(hash_hex) {
                    if let Some(index) = state.tree.lookup(&hash) {
                        let entry = state.tree.get(index);
                        if state.is_on_main_chain(entry) {
                            start = entry.height as i64;
                            break;
                        }
                    }
                }
            }

            let mut headers = Vec::new();
            let mut height = (start + 1) as u64;
            while headers.len() < MAX_HEADERS_PER_MSG {
                let block = match state.block_at(height) {
                    Some(block) => block,
                    None => break,
                };
                if let Some(index) = state.tree.lookup(&block.hash) {
                    headers.push(HeaderDto::from_block(block, state.tree.get(index)));
                }
                height += 1;
            }
            headers
        };

        log::debug!("serving {} headers to {}", headers.len(), peer.addr);
        let _ = peer.send(&Message::Headers(HeadersPayload { headers })).await;
    }

    /// Admit a batch of headers: verify hash integrity, proof of work and
    /// the difficulty schedule, derive cumulative work locally, and track
    /// the best-work candidate. Re-request while we keep learning; switch
    /// to body backfill once the batch brings nothing new.
    async fn handle_headers(&self, peer: &Arc<Peer>, payload: HeadersPayload) {
        let total = payload.headers.len();
        let mut responses: Vec<Message> = Vec::new();

        {
            let mut state = self.node.lock().await;
            let mut added = 0usize;

            for hdr in &payload.headers {
                let hash = match Hash256::from_hex(&hdr.hash) {
                    Ok(h) => h,
                    Err(_) => continue,
                };
                if state.tree.lookup(&hash).is_some() {
                    continue;
                }
                match hdr.computed_hash() {
                    Ok(computed) if computed == hash => {}
                    _ => {
                        log::warn!("header {} from {} fails hash check", hdr.hash, peer.addr);
                        continue;
                    }
                }
                if !hash_meets_target(&hash, &compact_to_big(hdr.bits)) {
                    log::warn!("header {} from {} fails proof of work", hdr.hash, peer.addr);
                    continue;
                }

                let prev = match Hash256::from_hex(&hdr.prev_hash) {
                    Ok(h) => h,
                    Err(_) => continue,
                };
                let parent = match state.tree.lookup(&prev) {
                    Some(p) => p,
                    None => {
                        log::debug!("header {} skipped: unknown parent", hdr.hash);
                        continue;
                    }
                };
                if hdr.height != state.tree.get(parent).height + 1 {
                    continue;
                }
                if hdr.bits != state.tree.expected_bits(parent) {
                    log::warn!("header {} from {} violates difficulty schedule", hdr.hash, peer.addr);
                    continue;
                }

                let index = state.tree.insert(hash, parent, hdr.bits, hdr.timestamp, None);
                if state.tree.get(index).cum_work > state.tree.best().cum_work {
                    state.tree.set_best(index);
                }
                if let Err(e) = self.node.persist_header_entry(state.tree.get(index)) {
                    log::error!("failed to persist header {}: {}", hdr.hash, e);
                }
                added += 1;
            }

            log::debug!("{}: {} headers, {} new", peer.addr, total, added);

            if added > 0 {
                // still learning: keep the headers phase going
                state.sync_state = SyncState::Headers;
                state.headers_synced = false;
                let locators = state.tree.locator().iter().map(|h| h.to_hex()).collect();
                responses.push(Message::Getheaders(GetHeadersPayload { locators }));
            } else {
                state.headers_synced = true;
                if state.tree.has_missing_bodies() {
                    state.sync_state = SyncState::Bodies;
                    if let Some(hash) = state.tree.oldest_missing_body() {
                        responses.push(Message::Getdata(GetDataPayload {
                            kind: InvKind::Block,
                            hash: hash.to_hex(),
                        }));
                    }
                } else if !state.sync_state.is_synced() {
                    self.node.finish_sync(&mut state);
                }
            }
        }

        for msg in responses {
            let _ = peer.send(&msg).await;
        }
    }

    /// Request the oldest header-only ancestor of the best-work tip, one
    /// per response cycle. Completes the sync when nothing is missing.
    async fn request_next_body(&self, peer: &Arc<Peer>) {
        let request = {
            let mut state = self.node.lock().await;
            match state.tree.oldest_missing_body() {
                Some(hash) => Some(hash),
                None => {
                    if !state.sync_state.is_synced() {
                        self.node.finish_sync(&mut state);
                    }
                    None
                }
            }
        };

        if let Some(hash) = request {
            let _ = peer
                .send(&Message::Getdata(GetDataPayload {
                    kind: InvKind::Block,
                    hash: hash.to_hex(),
                }))
                .await;
        }
    }
}
