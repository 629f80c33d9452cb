use std::net::SocketAddr;
use serde_bytes::ByteBuf;
use serde_derive::{Deserialize, Serialize};
use super::{
    node::{self, NodeId, NodeInfo},
    DhtError,
};

// One KRPC datagram. Bencoded as a dictionary with the transaction id
// under "t" and the body discriminated by "y".
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {

    #[serde(rename = "t", with = "serde_bytes")]
    pub transaction_id: Vec<u8>,

    #[serde(flatten)]
    pub body: Body,

}

impl Envelope {

    pub fn query(transaction_id: Vec<u8>, query: Query) -> Envelope {
        Envelope { transaction_id, body: Body::Query { query } }
    }

    pub fn response(transaction_id: Vec<u8>, response: ResponseArgs) -> Envelope {
        Envelope { transaction_id, body: Body::Response { response } }
    }

    pub fn encode(&self) -> Result<Vec<u8>, DhtError> {
        serde_bencode::to_bytes(self).map_err(Into::into)
    }

    pub fn decode(raw: &[u8]) -> Result<Envelope, DhtError> {
        serde_bencode::from_bytes(raw).map_err(Into::into)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "y")]
pub enum Body {

    #[serde(rename = "q")]
    Query {
        #[serde(flatten)]
        query: Query,
    },

    #[serde(rename = "r")]
    Response {
        #[serde(rename = "r")]
        response: ResponseArgs,
    },

    #[serde(rename = "e")]
    Error {
        #[serde(rename = "e")]
        error: ErrorArgs,
    },

}

// The query name travels under "q", its arguments under "a".
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "q", content = "a")]
pub enum Query {

    #[serde(rename = "ping")]
    Ping { id: NodeId },

    #[serde(rename = "find_node")]
    FindNode { id: NodeId, target: NodeId },

    #[serde(rename = "get_peers")]
    GetPeers { id: NodeId, info_hash: NodeId },

}

impl Query {
    // The id of whoever sent the query.
    pub fn querier(&self) -> NodeId {
        match self {
            Query::Ping { id } | Query::FindNode { id, .. } | Query::GetPeers { id, .. } => *id,
        }
    }
}

// The raw "r" dictionary. Which response this is can only be told from
// which optional fields are present.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseArgs {

    pub id: NodeId,

    // Compact node list, 26 bytes per entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<ByteBuf>,

    // Compact peers, 6 bytes each.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<ByteBuf>>,

}

// KRPC errors are a two element list of code and message.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorArgs(pub i64, pub String);

// A decoded, classified response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {

    Pong { id: NodeId },

    Nodes { id: NodeId, nodes: Vec<NodeInfo> },

    Peers { id: NodeId, peers: Vec<SocketAddr> },

}

impl Response {
    pub fn id(&self) -> NodeId {
        match self {
            Response::Pong { id }
            | Response::Nodes { id, .. }
            | Response::Peers { id, .. } => *id,
        }
    }
}

impl ResponseArgs {

    pub fn pong(id: NodeId) -> ResponseArgs {
        ResponseArgs { id, nodes: None, values: None }
    }

    pub fn nodes(id: NodeId, nodes: &[NodeInfo]) -> ResponseArgs {
        ResponseArgs {
            id,
            nodes: Some(ByteBuf::from(node::encode_nodes(nodes))),
            values: None,
        }
    }

    // Peers win over nodes when a remote sends both.
    pub fn classify(self) -> Result<Response, DhtError> {
        if let Some(values) = self.values {
            let peers = values
                .iter()
                .map(|raw| node::decode_peer(raw))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Response::Peers { id: self.id, peers });
        }
        if let Some(nodes) = self.nodes {
            return Ok(Response::Nodes { id: self.id, nodes: node::decode_nodes(&nodes)? });
        }
        Ok(Response::Pong { id: self.id })
    }
}
