// Local RPC: length-delimited JSON requests over TCP

use crate::core::Hash256;
use crate::network::dto::{BlockDto, TxDto};
use crate::network::Network;
use crate::node::Node;
use crate::wallet::{Keystore, TransactionBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

const MAX_REQUEST_BYTES: u32 = 4 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default)]
    pub id: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub id: Value,
}

impl RpcResponse {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
            id,
        }
    }

    fn err(id: Value, msg: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(msg.into()),
            id,
        }
    }
}

pub async fn write_json<W, T>(writer: &mut W, value: &T) -> Result<(), String>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(value).map_err(|e| format!("encode failed: {}", e))?;
    writer
        .write_all(&(payload.len() as u32).to_le_bytes())
        .await
        .map_err(|e| format!("write failed: {}", e))?;
    writer
        .write_all(&payload)
        .await
        .map_err(|e| format!("write failed: {}", e))?;
    writer.flush().await.map_err(|e| format!("flush failed: {}", e))
}

pub async fn read_json<R, T>(reader: &mut R) -> Result<T, String>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .await
        .map_err(|e| format!("read failed: {}", e))?;
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_REQUEST_BYTES {
        return Err(format!("oversized request ({} bytes)", len));
    }
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| format!("read failed: {}", e))?;
    serde_json::from_slice(&payload).map_err(|e| format!("decode failed: {}", e))
}

pub struct RpcServer {
    node: Arc<Node>,
    network: Option<Arc<Network>>,
    wallet: Arc<Mutex<Keystore>>,
}

impl RpcServer {
    pub fn new(node: Arc<Node>, network: Option<Arc<Network>>, wallet: Arc<Mutex<Keystore>>) -> Arc<Self> {
        Arc::new(Self {
            node,
            network,
            wallet,
        })
    }

    /// Bind and serve; returns the bound address.
    pub async fn start(self: &Arc<Self>, addr: &str) -> Result<String, String> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| format!("rpc bind {} failed: {}", addr, e))?;
        let local = listener
            .local_addr()
            .map_err(|e| format!("no local addr: {}", e))?
            .to_string();
        log::info!("rpc listening on {}", local);

        let server = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((mut stream, remote)) => {
                        let server = Arc::clone(&server);
                        tokio::spawn(async move {
                            loop {
                                let request: RpcRequest = match read_json(&mut stream).await {
                                    Ok(r) => r,
                                    Err(_) => break,
                                };
                                let response = server.dispatch(request).await;
                                if write_json(&mut stream, &response).await.is_err() {
                                    break;
                                }
                            }
                            log::debug!("rpc client {} disconnected", remote);
                        });
                    }
                    Err(e) => log::warn!("rpc accept failed: {}", e),
                }
            }
        });
        Ok(local)
    }

    async fn dispatch(&self, req: RpcRequest) -> RpcResponse {
        let id = req.id.clone();
        match self.handle(&req).await {
            Ok(result) => RpcResponse::ok(id, result),
            Err(e) => RpcResponse::err(id, e),
        }
    }

    async fn handle(&self, req: &RpcRequest) -> Result<Value, String> {
        match req.method.as_str() {
            "ping" => Ok(json!("pong")),

            "getblockcount" => Ok(json!(self.node.height().await)),

            "getbestblockhash" => Ok(json!(self.node.tip_hash().await.to_hex())),

            "getblockhash" => {
                let height = param_u64(req, 0)?;
                let block = self
                    .node
                    .get_block_by_height(height)
                    .await
                    .ok_or("height out of range")?;
                Ok(json!(block.hash.to_hex()))
            }

            "getblock" => {
                let hash = Hash256::from_hex(&param_str(req, 0)?)?;
                let block = self.node.get_block(&hash).await.ok_or("block not found")?;
                let cum_work = {
                    let state = self.node.lock().await;
                    state
                        .tree
                        .lookup(&hash)
                        .map(|i| state.tree.get(i).cum_work.to_str_radix(16))
                };
                let mut value = serde_json::to_value(BlockDto::from_block(&block))
                    .map_err(|e| e.to_string())?;
                if let (Some(obj), Some(work)) = (value.as_object_mut(), cum_work) {
                    obj.insert("cum_work".to_string(), json!(work));
                }
                Ok(value)
            }

            "getrawtransaction" => {
                let txid = param_str(req, 0)?;
                // mempool first, then the confirmed index
                let pooled = self.node.lock().await.mempool.get_decoded(&txid);
                let tx = match pooled {
                    Some(tx) => tx,
                    None => self.node.get_transaction(&txid).await?.0,
                };
                serde_json::to_value(TxDto::from_tx(&tx)).map_err(|e| e.to_string())
            }

            "sendrawtransaction" => {
                let dto: TxDto = serde_json::from_value(
                    req.params.first().cloned().ok_or("rawtx required")?,
                )
                .map_err(|e| format!("invalid tx format: {}", e))?;
                let tx = dto.to_tx()?;
                let txid = tx.id.clone();
                self.node.add_transaction(tx).await?;
                if let Some(network) = &self.network {
                    network.broadcast_inv(crate::network::InvKind::Tx, txid.clone(), None);
                }
                Ok(json!(txid))
            }

            "gettransaction" => {
                let txid = param_str(req, 0)?;
                let (tx, entry) = self.node.get_transaction(&txid).await?;
                Ok(json!({
                    "txid": txid,
                    "block": entry.block_hash,
                    "height": entry.height,
                    "tx": TxDto::from_tx(&tx),
                }))
            }

            "getbalance" => {
                let addr = param_str(req, 0)?;
                Ok(json!(self.node.balance(&addr).await))
            }

            "listutxos" => {
                let addr = param_str(req, 0)?;
                let entries = self.node.lock().await.utxo.utxos_for(&addr);
                serde_json::to_value(entries).map_err(|e| e.to_string())
            }

            "sendtoaddress" => {
                let to = param_str(req, 0)?;
                let amount = param_u64(req, 1)?;
                let fee = param_u64(req, 2).unwrap_or(1);

                let tx = {
                    let wallet = self.wallet.lock().await;
                    let from = wallet
                        .default_address()
                        .cloned()
                        .ok_or("wallet has no addresses")?;
                    let keypair = wallet.get(&from).ok_or("default key missing")?;
                    let state = self.node.lock().await;
                    TransactionBuilder::build(&state.utxo, keypair, &to, amount, fee)?
                };
                let txid = tx.id.clone();
                self.node.add_transaction(tx).await?;
                if let Some(network) = &self.network {
                    network.broadcast_inv(crate::network::InvKind::Tx, txid.clone(), None);
                }
                Ok(json!(txid))
            }

            other => Err(format!("unknown method: {}", other)),
        }
    }
}

fn param_str(req: &RpcRequest, index: usize) -> Result<String, String> {
    req.params
        .get(index)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| format!("string parameter {} required", index))
}

fn param_u64(req: &RpcRequest, index: usize) -> Result<u64, String> {
    req.params
        .get(index)
        .and_then(|v| v.as_u64())
        .ok_or_else(|| format!("integer parameter {} required", index))
}
