// Peer connection: framed codec, state machine fields, locked send side

use crate::network::message::Message;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

/// Frames larger than this are treated as protocol violations.
const MAX_FRAME_BYTES: u32 = 8 * 1024 * 1024;

/// Write one length-delimited JSON message.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), String>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(msg).map_err(|e| format!("encode failed: {}", e))?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_BYTES {
        return Err(format!("refusing to send oversized frame ({} bytes)", len));
    }
    writer
        .write_all(&len.to_le_bytes())
        .await
        .map_err(|e| format!("write failed: {}", e))?;
    writer
        .write_all(&payload)
        .await
        .map_err(|e| format!("write failed: {}", e))?;
    writer
        .flush()
        .await
        .map_err(|e| format!("flush failed: {}", e))?;
    Ok(())
}

/// Read one length-delimited JSON message.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, String>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .await
        .map_err(|e| format!("read failed: {}", e))?;
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_BYTES {
        return Err(format!("oversized frame ({} bytes)", len));
    }

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| format!("read failed: {}", e))?;
    serde_json::from_slice(&payload).map_err(|e| format!("decode failed: {}", e))
}

/// Handshake progression, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerState {
    Init,
    VersionSent,
    VersionRecv,
    Active,
}

#[derive(Debug, Clone, Default)]
pub struct PeerMeta {
    pub height: u64,
    pub cum_work: String,
    pub node_id: String,
}

/// One connected peer. The write half is guarded by its own lock so any
/// task can send; the read half lives in the peer's read loop alone.
pub struct Peer {
    pub addr: String,
    pub outbound: bool,
    writer: Mutex<OwnedWriteHalf>,
    state: StdMutex<PeerState>,
    meta: StdMutex<PeerMeta>,
    last_seen: AtomicI64,
    closed: AtomicBool,
}

impl Peer {
    pub fn new(writer: OwnedWriteHalf, addr: String, outbound: bool) -> Self {
        Self {
            addr,
            outbound,
            writer: Mutex::new(writer),
            state: StdMutex::new(PeerState::Init),
            meta: StdMutex::new(PeerMeta::default()),
            last_seen: AtomicI64::new(crate::node::now_secs()),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn send(&self, msg: &Message) -> Result<(), String> {
        if self.is_closed() {
            return Err("peer is closed".to_string());
        }
        let mut writer = self.writer.lock().await;
        let result = write_message(&mut *writer, msg).await;
        if result.is_err() {
            self.mark_closed();
        }
        result
    }

    /// Close the connection; the read loop notices and unregisters.
    pub async fn close(&self) {
        self.mark_closed();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock().expect("peer state lock")
    }

    pub fn set_state(&self, state: PeerState) {
        *self.state.lock().expect("peer state lock") = state;
    }

    pub fn is_active(&self) -> bool {
        self.state() == PeerState::Active
    }

    pub fn meta(&self) -> PeerMeta {
        self.meta.lock().expect("peer meta lock").clone()
    }

    pub fn set_meta(&self, height: u64, cum_work: String, node_id: String) {
        *self.meta.lock().expect("peer meta lock") = PeerMeta {
            height,
            cum_work,
            node_id,
        };
    }

    pub fn node_id(&self) -> String {
        self.meta.lock().expect("peer meta lock").node_id.clone()
    }

    pub fn touch(&self) {
        self.last_seen
            .store(crate::node::now_secs(), Ordering::Relaxed);
    }

    pub fn last_seen(&self) -> i64 {
        self.last_seen.load(Ordering::Relaxed)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::{Message, PingPayload};

    #[tokio::test]
    async fn test_codec_round_trip() {
        let mut buf = Vec::new();
        let msg = Message::Ping(PingPayload { nonce: 7 });
        write_message(&mut buf, &msg).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let back = read_message(&mut cursor).await.unwrap();
        assert!(matches!(back, Message::Ping(PingPayload { nonce: 7 })));
    }

    #[tokio::test]
    async fn test_codec_streams_multiple_messages() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Message::Verack).await.unwrap();
        write_message(&mut buf, &Message::Ping(PingPayload { nonce: 1 }))
            .await
            .unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(read_message(&mut cursor).await.unwrap(), Message::Verack));
        assert!(matches!(read_message(&mut cursor).await.unwrap(), Message::Ping(_)));
        assert!(read_message(&mut cursor).await.is_err()); // clean EOF is an error for the read loop
    }

    #[tokio::test]
    async fn test_codec_rejects_oversized_frame() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_BYTES + 1).to_le_bytes());
        buf.extend_from_slice(&[0u8; 16]);
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_message(&mut cursor).await.is_err());
    }

    #[test]
    fn test_peer_state_ordering() {
        assert!(PeerState::Init < PeerState::VersionSent);
        assert!(PeerState::VersionSent < PeerState::VersionRecv);
        assert!(PeerState::VersionRecv < PeerState::Active);
    }
}
