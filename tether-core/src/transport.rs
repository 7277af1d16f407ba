//! Collaborator traits consumed by the synchronization core.
//!
//! The transport, the wire format and the endpoint factory are supplied by
//! the surrounding application. The core only relies on these contracts.

use crate::{Document, Request, Response, TetherResult, TransportError};
use async_trait::async_trait;
use serde_json::Value;

/// Executes requests against the remote service.
///
/// Implementations report every response the service produced, successful or
/// not, as `Ok(Response)` so the retry policy can inspect the status. `Err`
/// is reserved for failures that produced no response at all and is never
/// retried.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: &Request) -> TetherResult<Response>;

    /// Execute several read requests as one coalesced call.
    ///
    /// The returned vector is index-aligned with `requests`. The default
    /// implementation issues the requests one by one; transports with a
    /// native multi-id endpoint should override it.
    async fn execute_batch(&self, requests: &[Request]) -> TetherResult<Vec<Response>> {
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            responses.push(self.execute(request).await?);
        }
        Ok(responses)
    }
}

/// Converts documents into wire payloads.
pub trait Serializer: Send + Sync {
    fn serialize(&self, document: &Document) -> TetherResult<Vec<u8>>;
}

/// Converts wire payloads back into JSON values.
pub trait Deserializer: Send + Sync {
    fn deserialize(&self, bytes: &[u8]) -> TetherResult<Value>;
}

/// Default wire format backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, document: &Document) -> TetherResult<Vec<u8>> {
        serde_json::to_vec(document).map_err(|e| {
            TransportError::Serialization {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

impl Deserializer for JsonSerializer {
    fn deserialize(&self, bytes: &[u8]) -> TetherResult<Value> {
        serde_json::from_slice(bytes).map_err(|e| {
            TransportError::Serialization {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TetherError;
    use serde_json::json;

    #[test]
    fn test_json_serializer_round_trip() {
        let doc = Document::from_value(json!({"name": "Backlog", "pos": 1024})).unwrap();
        let bytes = JsonSerializer.serialize(&doc).unwrap();
        let value = JsonSerializer.deserialize(&bytes).unwrap();
        assert_eq!(value, json!({"name": "Backlog", "pos": 1024}));
    }

    #[test]
    fn test_json_deserializer_reports_garbage() {
        let err = JsonSerializer.deserialize(b"{not json").unwrap_err();
        assert!(matches!(
            err,
            TetherError::Transport(TransportError::Serialization { .. })
        ));
    }
}
