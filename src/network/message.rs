// Wire protocol messages: {"type": ..., "data": ...} JSON objects

use crate::network::dto::{BlockDto, HeaderDto, TxDto};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Message {
    Version(VersionPayload),
    Verack,
    Getaddr,
    Addr(AddrPayload),
    Getheaders(GetHeadersPayload),
    Headers(HeadersPayload),
    Inv(InvPayload),
    Getdata(GetDataPayload),
    Block(BlockDto),
    Tx(TxPayload),
    Ping(PingPayload),
    Pong(PingPayload),
}

impl Message {
    /// Message name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Getaddr => "getaddr",
            Message::Addr(_) => "addr",
            Message::Getheaders(_) => "getheaders",
            Message::Headers(_) => "headers",
            Message::Inv(_) => "inv",
            Message::Getdata(_) => "getdata",
            Message::Block(_) => "block",
            Message::Tx(_) => "tx",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionPayload {
    pub version: u32,
    pub height: u64,
    /// Cumulative work of the sender's best chain, lowercase hex.
    pub cum_work: String,
    /// Advertised address identifying the node instance.
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddrPayload {
    pub addrs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetHeadersPayload {
    /// Block locator, tip-first.
    pub locators: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadersPayload {
    pub headers: Vec<HeaderDto>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvKind {
    Block,
    Tx,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvPayload {
    #[serde(rename = "type")]
    pub kind: InvKind,
    pub hashes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetDataPayload {
    #[serde(rename = "type")]
    pub kind: InvKind,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxPayload {
    pub tx: TxDto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingPayload {
    pub nonce: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape_is_type_and_data() {
        let msg = Message::Version(VersionPayload {
            version: 1,
            height: 42,
            cum_work: "ff".to_string(),
            node_id: "10.0.0.1:9001".to_string(),
        });
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "version");
        assert_eq!(value["data"]["height"], 42);
        assert_eq!(value["data"]["cum_work"], "ff");
    }

    #[test]
    fn test_verack_has_no_data() {
        let value: serde_json::Value = serde_json::to_value(Message::Verack).unwrap();
        assert_eq!(value["type"], "verack");
        assert!(value.get("data").is_none());

        let back: Message = serde_json::from_value(value).unwrap();
        assert!(matches!(back, Message::Verack));
    }

    #[test]
    fn test_inv_kind_lowercase() {
        let msg = Message::Inv(InvPayload {
            kind: InvKind::Block,
            hashes: vec!["ab".to_string()],
        });
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["data"]["type"], "block");

        let back: Message = serde_json::from_value(value).unwrap();
        match back {
            Message::Inv(inv) => assert_eq!(inv.kind, InvKind::Block),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_round_trip_getheaders() {
        let msg = Message::Getheaders(GetHeadersPayload {
            locators: vec!["aa".to_string(), "bb".to_string()],
        });
        let json = serde_json::to_vec(&msg).unwrap();
        let back: Message = serde_json::from_slice(&json).unwrap();
        match back {
            Message::Getheaders(p) => assert_eq!(p.locators.len(), 2),
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
