use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Asks which chunks of a session are already durable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResumeRequest {
    pub session_id: String,
}

/// Declares a session before any chunk is sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenSessionRequest {
    pub session_id: String,
    pub total_chunks: u32,
    pub file_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_type: String,
}

/// Asks the server to assemble a complete session into its artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_type: String,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Chunks already held for a session (empty for an unknown session).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeStateResponse {
    pub session_id: String,
    pub uploaded_chunks: Vec<u32>,
}

/// Reply to [`OpenSessionRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenSessionResponse {
    pub session_id: String,
    /// `false` when the session already existed with the same metadata.
    pub created: bool,
    pub uploaded_chunks: Vec<u32>,
}

/// Acknowledges one chunk write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAckResponse {
    pub session_id: String,
    pub chunk_index: u32,
    /// State of the session after this write.
    pub uploaded_chunks: Vec<u32>,
}

/// Reply to a successful [`MergeRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResponse {
    pub session_id: String,
    pub artifact_url: String,
    #[serde(default)]
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_session_uses_camel_case() {
        let req = OpenSessionRequest {
            session_id: "abc".into(),
            total_chunks: 4,
            file_name: "movie.mp4".into(),
            file_type: "video/mp4".into(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["sessionId"], "abc");
        assert_eq!(json["totalChunks"], 4);
        assert_eq!(json["fileName"], "movie.mp4");
        assert_eq!(json["fileType"], "video/mp4");
    }

    #[test]
    fn merge_request_optional_metadata() {
        let req: MergeRequest = serde_json::from_str(r#"{"sessionId":"s1"}"#).unwrap();
        assert_eq!(req.session_id, "s1");
        assert!(req.file_name.is_empty());
        assert!(req.file_type.is_empty());

        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("fileName"));
    }

    #[test]
    fn resume_state_wire_shape() {
        let resp = ResumeStateResponse {
            session_id: "s1".into(),
            uploaded_chunks: vec![],
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["uploadedChunks"], serde_json::json!([]));
    }

    #[test]
    fn query_resume_requires_session_id() {
        let result: Result<QueryResumeRequest, _> = serde_json::from_str("{}");
        assert!(result.is_err());
    }
}
