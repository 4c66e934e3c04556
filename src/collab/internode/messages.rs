use crate::collab::leader::LeaderChangeEvent;
use crate::registry::RegistryEvent;
use anyhow::{Context, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Notifications delivered to a node through its internal endpoint.
#[derive(Debug, Serialize, Deserialize, ToSchema, Clone)]
pub enum InterNodeMessage {
    Registry { event: RegistryEvent },
    LeaderChanged { event: LeaderChangeEvent },
    /// Marks ids as checked by this node, outside the dispatcher's share.
    AddToCheck { ids: Vec<String> },
    RemoveFromCheck { ids: Vec<String> },
    Suspend,
}

/// Body of a call to the internal endpoint.
pub type BroadcastBody = Vec<InterNodeMessage>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEntry {
    pub key: String,
    pub value: String,
}

/// One key of a `Get` answer. `value` is absent when the peer has no record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedRecord {
    pub key: String,
    pub value: Option<String>,
}

/// Frames a node sends to the peer owning the keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerRequest {
    Put {
        request_id: u64,
        records: Vec<RecordEntry>,
    },
    Del {
        request_id: u64,
        keys: Vec<String>,
    },
    Get {
        request_id: u64,
        keys: Vec<String>,
    },
    Snapshot {
        request_id: u64,
    },
    Ping {
        request_id: u64,
    },
}

impl PeerRequest {
    pub fn request_id(&self) -> u64 {
        match self {
            Self::Put { request_id, .. }
            | Self::Del { request_id, .. }
            | Self::Get { request_id, .. }
            | Self::Snapshot { request_id }
            | Self::Ping { request_id } => *request_id,
        }
    }
}

/// Frames a peer answers with, carrying the id of the request they answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerResponse {
    Ack {
        request_id: u64,
        count: usize,
    },
    Records {
        request_id: u64,
        records: Vec<FetchedRecord>,
    },
    Pong {
        request_id: u64,
    },
}

impl PeerResponse {
    pub fn request_id(&self) -> u64 {
        match self {
            Self::Ack { request_id, .. }
            | Self::Records { request_id, .. }
            | Self::Pong { request_id } => *request_id,
        }
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<Bytes> {
    let payload = serde_json::to_vec(message).context("failed to encode peer frame")?;

    Ok(Bytes::from(payload))
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    serde_json::from_slice(frame).context("failed to decode peer frame")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_are_tagged_json() -> Result<()> {
        let request = PeerRequest::Get {
            request_id: 7,
            keys: vec!["svc-1".to_string()],
        };

        let frame = encode(&request)?;
        let json: serde_json::Value = serde_json::from_slice(&frame)?;
        assert_eq!(json["type"], "get");
        assert_eq!(json["request_id"], 7);

        let response: PeerResponse = decode(br#"{"type":"ack","request_id":3,"count":2}"#)?;
        assert_eq!(response.request_id(), 3);

        assert!(decode::<PeerResponse>(b"not json").is_err());

        Ok(())
    }
}
