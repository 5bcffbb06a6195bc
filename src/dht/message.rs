//! KRPC messages (BEP-5) and their bencoded wire form.

use super::error::DhtError;
use super::node::{
    compact_peer, encode_compact_nodes, parse_compact_nodes, parse_compact_peer, Node, NodeId,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_bencode::value::Value;
use serde_bytes::ByteBuf;
use std::net::SocketAddr;

pub type TransactionId = Bytes;

/// KRPC error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Generic = 201,
    Server = 202,
    Protocol = 203,
    MethodUnknown = 204,
}

impl ErrorCode {
    pub fn code(self) -> i64 {
        self as i64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KrpcError {
    pub code: i64,
    pub message: String,
}

/// The four DHT queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Ping,
    FindNode {
        target: NodeId,
    },
    GetPeers {
        info_hash: NodeId,
    },
    AnnouncePeer {
        info_hash: NodeId,
        port: u16,
        implied_port: bool,
        token: Bytes,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
}

impl Query {
    pub fn kind(&self) -> QueryKind {
        match self {
            Query::Ping => QueryKind::Ping,
            Query::FindNode { .. } => QueryKind::FindNode,
            Query::GetPeers { .. } => QueryKind::GetPeers,
            Query::AnnouncePeer { .. } => QueryKind::AnnouncePeer,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            Query::Ping => "ping",
            Query::FindNode { .. } => "find_node",
            Query::GetPeers { .. } => "get_peers",
            Query::AnnouncePeer { .. } => "announce_peer",
        }
    }
}

/// The `r` dictionary of a response.
///
/// KRPC responses do not say which query they answer, so every optional field
/// is kept and [`ResponseBody::validate_for`] checks them against the query we
/// sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseBody {
    pub id: NodeId,
    pub nodes: Option<Vec<NodeEntry>>,
    pub values: Option<Vec<SocketAddr>>,
    pub token: Option<Bytes>,
}

/// A node from a compact `nodes` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl From<&Node> for NodeEntry {
    fn from(node: &Node) -> Self {
        Self {
            id: node.id,
            addr: node.addr,
        }
    }
}

impl NodeEntry {
    pub fn into_node(self) -> Node {
        Node::new(self.id, self.addr)
    }
}

impl ResponseBody {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            nodes: None,
            values: None,
            token: None,
        }
    }

    pub fn with_nodes(mut self, nodes: &[Node]) -> Self {
        self.nodes = Some(nodes.iter().map(NodeEntry::from).collect());
        self
    }

    pub fn with_values(mut self, values: Vec<SocketAddr>) -> Self {
        self.values = Some(values);
        self
    }

    pub fn with_token(mut self, token: Bytes) -> Self {
        self.token = Some(token);
        self
    }

    /// Checks that the mandatory keys for a reply to `kind` are present.
    pub fn validate_for(&self, kind: QueryKind) -> Result<(), DhtError> {
        match kind {
            QueryKind::Ping | QueryKind::AnnouncePeer => Ok(()),
            QueryKind::FindNode if self.nodes.is_none() => Err(DhtError::InvalidResponse(
                "find_node reply without nodes".into(),
            )),
            QueryKind::FindNode => Ok(()),
            QueryKind::GetPeers if self.token.is_none() => Err(DhtError::InvalidResponse(
                "get_peers reply without token".into(),
            )),
            QueryKind::GetPeers if self.nodes.is_none() && self.values.is_none() => Err(
                DhtError::InvalidResponse("get_peers reply without nodes or values".into()),
            ),
            QueryKind::GetPeers => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum KrpcMessage {
    Query {
        transaction_id: TransactionId,
        sender: NodeId,
        query: Query,
    },
    Response {
        transaction_id: TransactionId,
        body: ResponseBody,
    },
    Error {
        transaction_id: TransactionId,
        error: KrpcError,
    },
}

/// A datagram that could not be turned into a [`KrpcMessage`].
#[derive(Debug)]
pub struct DecodeFailure {
    /// Transaction id, when the envelope was readable.
    pub transaction_id: Option<TransactionId>,
    /// Whether the datagram claimed to be a query.
    pub is_query: bool,
    /// Error code to reply with, for queries.
    pub code: ErrorCode,
    pub error: DhtError,
}

impl DecodeFailure {
    fn query(transaction_id: &TransactionId, code: ErrorCode, reason: &str) -> Self {
        Self {
            transaction_id: Some(transaction_id.clone()),
            is_query: true,
            code,
            error: DhtError::InvalidMessage(reason.to_string()),
        }
    }

    fn response(transaction_id: &TransactionId, reason: &str) -> Self {
        Self {
            transaction_id: Some(transaction_id.clone()),
            is_query: false,
            code: ErrorCode::Protocol,
            error: DhtError::InvalidResponse(reason.to_string()),
        }
    }
}

// Wire structs. Field order matches bencode's sorted key order.

#[derive(Debug, Deserialize)]
struct Header {
    t: ByteBuf,
    y: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    a: Option<Arguments>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    e: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    q: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    r: Option<Arguments>,
    t: ByteBuf,
    y: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Arguments {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    implied_port: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    info_hash: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nodes: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    port: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    values: Option<Vec<ByteBuf>>,
}

fn id_bytes(id: &NodeId) -> Option<ByteBuf> {
    Some(ByteBuf::from(id.0.to_vec()))
}

fn required_id(field: &Option<ByteBuf>) -> Option<NodeId> {
    field
        .as_ref()
        .and_then(|bytes| NodeId::from_bytes(bytes).ok())
}

impl KrpcMessage {
    pub fn query(transaction_id: TransactionId, sender: NodeId, query: Query) -> Self {
        KrpcMessage::Query {
            transaction_id,
            sender,
            query,
        }
    }

    pub fn response(transaction_id: TransactionId, body: ResponseBody) -> Self {
        KrpcMessage::Response {
            transaction_id,
            body,
        }
    }

    pub fn error(transaction_id: TransactionId, code: ErrorCode, message: &str) -> Self {
        KrpcMessage::Error {
            transaction_id,
            error: KrpcError {
                code: code.code(),
                message: message.to_string(),
            },
        }
    }

    pub fn transaction_id(&self) -> &TransactionId {
        match self {
            KrpcMessage::Query { transaction_id, .. }
            | KrpcMessage::Response { transaction_id, .. }
            | KrpcMessage::Error { transaction_id, .. } => transaction_id,
        }
    }

    pub fn encode(&self) -> Result<Bytes, DhtError> {
        let envelope = match self {
            KrpcMessage::Query {
                transaction_id,
                sender,
                query,
            } => {
                let mut args = Arguments {
                    id: id_bytes(sender),
                    ..Default::default()
                };
                match query {
                    Query::Ping => {}
                    Query::FindNode { target } => args.target = id_bytes(target),
                    Query::GetPeers { info_hash } => args.info_hash = id_bytes(info_hash),
                    Query::AnnouncePeer {
                        info_hash,
                        port,
                        implied_port,
                        token,
                    } => {
                        args.info_hash = id_bytes(info_hash);
                        args.port = Some(i64::from(*port));
                        args.implied_port = implied_port.then_some(1);
                        args.token = Some(ByteBuf::from(token.to_vec()));
                    }
                }
                Envelope {
                    a: Some(args),
                    q: Some(query.method().to_string()),
                    t: ByteBuf::from(transaction_id.to_vec()),
                    y: "q".to_string(),
                    ..Default::default()
                }
            }
            KrpcMessage::Response {
                transaction_id,
                body,
            } => {
                let nodes = body.nodes.as_ref().map(|entries| {
                    let nodes: Vec<Node> =
                        entries.iter().cloned().map(NodeEntry::into_node).collect();
                    ByteBuf::from(encode_compact_nodes(&nodes))
                });
                let values = body.values.as_ref().map(|peers| {
                    peers
                        .iter()
                        .filter_map(compact_peer)
                        .map(|p| ByteBuf::from(p.to_vec()))
                        .collect()
                });
                Envelope {
                    r: Some(Arguments {
                        id: id_bytes(&body.id),
                        nodes,
                        token: body.token.as_ref().map(|t| ByteBuf::from(t.to_vec())),
                        values,
                        ..Default::default()
                    }),
                    t: ByteBuf::from(transaction_id.to_vec()),
                    y: "r".to_string(),
                    ..Default::default()
                }
            }
            KrpcMessage::Error {
                transaction_id,
                error,
            } => Envelope {
                e: Some(vec![
                    Value::Int(error.code),
                    Value::Bytes(error.message.as_bytes().to_vec()),
                ]),
                t: ByteBuf::from(transaction_id.to_vec()),
                y: "e".to_string(),
                ..Default::default()
            },
        };

        Ok(Bytes::from(serde_bencode::to_bytes(&envelope)?))
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeFailure> {
        let header: Header = serde_bencode::from_bytes(data).map_err(|e| DecodeFailure {
            transaction_id: None,
            is_query: false,
            code: ErrorCode::Protocol,
            error: e.into(),
        })?;

        let transaction_id = Bytes::from(header.t.into_vec());
        let is_query = header.y == "q";

        let envelope: Envelope = serde_bencode::from_bytes(data).map_err(|e| DecodeFailure {
            transaction_id: Some(transaction_id.clone()),
            is_query,
            code: ErrorCode::Protocol,
            error: e.into(),
        })?;

        match envelope.y.as_str() {
            "q" => Self::decode_query(transaction_id, envelope),
            "r" => Self::decode_response(transaction_id, envelope),
            "e" => Self::decode_error(transaction_id, envelope),
            other => Err(DecodeFailure {
                transaction_id: Some(transaction_id),
                is_query: false,
                code: ErrorCode::Protocol,
                error: DhtError::InvalidMessage(format!("unknown message type: {}", other)),
            }),
        }
    }

    fn decode_query(
        transaction_id: TransactionId,
        envelope: Envelope,
    ) -> Result<Self, DecodeFailure> {
        let tid = &transaction_id;
        let method = envelope
            .q
            .ok_or_else(|| DecodeFailure::query(tid, ErrorCode::Protocol, "missing query name"))?;
        let args = envelope
            .a
            .ok_or_else(|| DecodeFailure::query(tid, ErrorCode::Protocol, "missing query args"))?;
        let sender = required_id(&args.id).ok_or_else(|| {
            DecodeFailure::query(tid, ErrorCode::Protocol, "missing or invalid id")
        })?;

        let query = match method.as_str() {
            "ping" => Query::Ping,
            "find_node" => Query::FindNode {
                target: required_id(&args.target).ok_or_else(|| {
                    DecodeFailure::query(tid, ErrorCode::Protocol, "missing target")
                })?,
            },
            "get_peers" => Query::GetPeers {
                info_hash: required_id(&args.info_hash).ok_or_else(|| {
                    DecodeFailure::query(tid, ErrorCode::Protocol, "missing info_hash")
                })?,
            },
            "announce_peer" => {
                let info_hash = required_id(&args.info_hash).ok_or_else(|| {
                    DecodeFailure::query(tid, ErrorCode::Protocol, "missing info_hash")
                })?;
                let implied_port = args.implied_port.unwrap_or(0) != 0;
                let port = match args.port.map(u16::try_from) {
                    Some(Ok(port)) => port,
                    Some(Err(_)) => {
                        return Err(DecodeFailure::query(tid, ErrorCode::Protocol, "invalid port"))
                    }
                    None if implied_port => 0,
                    None => {
                        return Err(DecodeFailure::query(tid, ErrorCode::Protocol, "missing port"))
                    }
                };
                let token = args
                    .token
                    .map(|t| Bytes::from(t.into_vec()))
                    .ok_or_else(|| {
                        DecodeFailure::query(tid, ErrorCode::Protocol, "missing token")
                    })?;
                Query::AnnouncePeer {
                    info_hash,
                    port,
                    implied_port,
                    token,
                }
            }
            _ => {
                return Err(DecodeFailure::query(
                    tid,
                    ErrorCode::MethodUnknown,
                    "method unknown",
                ))
            }
        };

        Ok(KrpcMessage::Query {
            transaction_id,
            sender,
            query,
        })
    }

    fn decode_response(
        transaction_id: TransactionId,
        envelope: Envelope,
    ) -> Result<Self, DecodeFailure> {
        let tid = &transaction_id;
        let args = envelope
            .r
            .ok_or_else(|| DecodeFailure::response(tid, "missing response dictionary"))?;
        let id = required_id(&args.id)
            .ok_or_else(|| DecodeFailure::response(tid, "missing or invalid id"))?;

        let nodes = match args.nodes {
            Some(data) => Some(
                parse_compact_nodes(&data)
                    .ok_or_else(|| DecodeFailure::response(tid, "malformed nodes"))?
                    .iter()
                    .map(NodeEntry::from)
                    .collect(),
            ),
            None => None,
        };

        // Entries that are not 6 byte IPv4 peers are skipped rather than
        // failing the whole reply.
        let values = args.values.map(|values| {
            values
                .iter()
                .filter_map(|v| parse_compact_peer(v))
                .collect()
        });

        Ok(KrpcMessage::Response {
            transaction_id,
            body: ResponseBody {
                id,
                nodes,
                values,
                token: args.token.map(|t| Bytes::from(t.into_vec())),
            },
        })
    }

    fn decode_error(
        transaction_id: TransactionId,
        envelope: Envelope,
    ) -> Result<Self, DecodeFailure> {
        let fields = envelope.e.unwrap_or_default();
        let (code, message) = match fields.as_slice() {
            [Value::Int(code), Value::Bytes(message), ..] => {
                (*code, String::from_utf8_lossy(message).into_owned())
            }
            [Value::Int(code)] => (*code, String::new()),
            _ => (ErrorCode::Generic.code(), String::new()),
        };

        Ok(KrpcMessage::Error {
            transaction_id,
            error: KrpcError { code, message },
        })
    }
}
