//! Wire types for the chunked-upload backend protocol.

use serde::{Deserialize, Serialize};

/// Request body for `POST /api/upload/initiate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub file_hash: String,
}

/// Response body for `initiate`.
///
/// A non-empty `file_id` together with `total_chunks == 0` means the server
/// already stores an identical file and no chunks need to be sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResponse {
    pub upload_id: String,
    pub chunk_size: u64,
    pub total_chunks: usize,
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl InitiateResponse {
    /// Whether this response signals a server-side dedup hit.
    pub fn is_dedup_hit(&self) -> bool {
        self.total_chunks == 0 && self.file_id.as_deref().is_some_and(|id| !id.is_empty())
    }
}

/// Request body for `POST /api/upload/chunk`. `chunk_data` is base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRequest {
    pub upload_id: String,
    pub chunk_index: usize,
    pub chunk_data: String,
}

/// Response body for `chunk`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResponse {
    pub success: bool,
    pub upload_id: String,
    pub chunk_index: usize,
}

/// Request body for `POST /api/upload/finalize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub upload_id: String,
}

/// Response body for `finalize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResponse {
    pub success: bool,
    pub upload_id: String,
    pub file_id: String,
}

/// Server-side view of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteUploadStatus {
    InProgress,
    Completed,
    Error,
}

/// Response body for `GET /api/upload/status/{uploadId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub upload_id: String,
    pub status: RemoteUploadStatus,
    pub uploaded_chunks: usize,
    pub total_chunks: usize,
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Body shape of any non-2xx response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiate_request_serializes_camel_case() {
        let request = InitiateRequest {
            file_name: "clip.mp4".to_string(),
            file_size: 2_621_440,
            mime_type: "video/mp4".to_string(),
            file_hash: "abc".to_string(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["fileName"], "clip.mp4");
        assert_eq!(json["fileSize"], 2_621_440);
        assert_eq!(json["mimeType"], "video/mp4");
        assert_eq!(json["fileHash"], "abc");
    }

    #[test]
    fn initiate_response_parses_dedup_hit() {
        let response: InitiateResponse = serde_json::from_str(
            r#"{"uploadId":"u2","chunkSize":1048576,"totalChunks":0,"fileId":"existing"}"#,
        )
        .unwrap();
        assert!(response.is_dedup_hit());
        assert_eq!(response.file_id.as_deref(), Some("existing"));
    }

    #[test]
    fn initiate_response_without_file_id_is_not_dedup() {
        let response: InitiateResponse = serde_json::from_str(
            r#"{"uploadId":"u1","chunkSize":1048576,"totalChunks":3}"#,
        )
        .unwrap();
        assert!(!response.is_dedup_hit());
        assert_eq!(response.total_chunks, 3);
    }

    #[test]
    fn status_response_parses_null_fields() {
        let response: StatusResponse = serde_json::from_str(
            r#"{"uploadId":"u1","status":"in_progress","uploadedChunks":2,"totalChunks":3,"fileId":null,"error":null}"#,
        )
        .unwrap();
        assert_eq!(response.status, RemoteUploadStatus::InProgress);
        assert_eq!(response.uploaded_chunks, 2);
        assert!(response.file_id.is_none());
    }

    #[test]
    fn error_envelope_tolerates_missing_field() {
        let envelope: ErrorEnvelope = serde_json::from_str("{}").unwrap();
        assert!(envelope.error.is_none());

        let envelope: ErrorEnvelope =
            serde_json::from_str(r#"{"error":"quota exceeded"}"#).unwrap();
        assert_eq!(envelope.error.as_deref(), Some("quota exceeded"));
    }
}
