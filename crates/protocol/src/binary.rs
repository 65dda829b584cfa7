//! Binary chunk frames: 4-byte big-endian header length + JSON header + raw payload.

use serde::{Deserialize, Serialize};

/// Header for a binary chunk write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryChunkHeader {
    /// Request id, echoed in the `chunk_ack` (or error) reply.
    pub id: String,
    pub session_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub file_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_type: String,
    /// SHA-256 hex of the payload (empty means no verification).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
}

/// Parses a raw binary WebSocket frame into its header and payload.
///
/// Wire format: `[4 bytes: header_len (big-endian)][header_len bytes: JSON][rest: payload]`
pub fn parse_chunk_frame(data: &[u8]) -> Result<(BinaryChunkHeader, Vec<u8>), ParseError> {
    let (header_bytes, payload) = split_frame(data)?;
    let header: BinaryChunkHeader = serde_json::from_slice(header_bytes)
        .map_err(|e| ParseError::InvalidJson(e.to_string()))?;
    Ok((header, payload.to_vec()))
}

/// Best-effort extraction of the request id from a frame whose header
/// failed full validation, so the error can still be correlated.
pub fn peek_frame_id(data: &[u8]) -> Option<String> {
    let (header_bytes, _) = split_frame(data).ok()?;
    let peek: HeaderPeek = serde_json::from_slice(header_bytes).ok()?;
    peek.id
}

/// Encodes a chunk frame for sending over WebSocket.
pub fn encode_chunk_frame(
    header: &BinaryChunkHeader,
    payload: &[u8],
) -> Result<Vec<u8>, serde_json::Error> {
    let header_json = serde_json::to_vec(header)?;
    let header_len = header_json.len() as u32;

    let mut buf = Vec::with_capacity(4 + header_json.len() + payload.len());
    buf.extend_from_slice(&header_len.to_be_bytes());
    buf.extend_from_slice(&header_json);
    buf.extend_from_slice(payload);
    Ok(buf)
}

fn split_frame(data: &[u8]) -> Result<(&[u8], &[u8]), ParseError> {
    if data.len() < 4 {
        return Err(ParseError::TooShort);
    }

    let header_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if data.len() - 4 < header_len {
        return Err(ParseError::HeaderTruncated {
            expected: header_len,
            got: data.len() - 4,
        });
    }

    Ok((&data[4..4 + header_len], &data[4 + header_len..]))
}

#[derive(Deserialize)]
struct HeaderPeek {
    id: Option<String>,
}

/// Errors from binary frame parsing.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("message too short (need at least 4 bytes)")]
    TooShort,

    #[error("header truncated: expected {expected} bytes, got {got}")]
    HeaderTruncated { expected: usize, got: usize },

    #[error("invalid header JSON: {0}")]
    InvalidJson(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_binary_frame(header: &[u8], payload: &[u8]) -> Vec<u8> {
        let len = header.len() as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(header);
        buf.extend_from_slice(payload);
        buf
    }

    fn sample_header() -> BinaryChunkHeader {
        BinaryChunkHeader {
            id: "msg-1".into(),
            session_id: "s-1".into(),
            chunk_index: 3,
            total_chunks: 8,
            file_name: "video.mp4".into(),
            file_type: String::new(),
            checksum: String::new(),
        }
    }

    #[test]
    fn parse_chunk_frame_from_raw_json() {
        let header = serde_json::to_vec(&serde_json::json!({
            "id": "msg-1",
            "sessionId": "s-1",
            "chunkIndex": 3,
            "totalChunks": 8,
            "fileName": "video.mp4",
            "checksum": "abc123"
        }))
        .unwrap();
        let frame = make_binary_frame(&header, b"binary data here");

        let (header, data) = parse_chunk_frame(&frame).unwrap();
        assert_eq!(header.session_id, "s-1");
        assert_eq!(header.chunk_index, 3);
        assert_eq!(header.total_chunks, 8);
        assert_eq!(header.checksum, "abc123");
        assert!(header.file_type.is_empty());
        assert_eq!(data, b"binary data here");
    }

    #[test]
    fn encode_then_parse() {
        let frame = encode_chunk_frame(&sample_header(), b"payload").unwrap();
        let (header, data) = parse_chunk_frame(&frame).unwrap();
        assert_eq!(header, sample_header());
        assert_eq!(data, b"payload");
    }

    #[test]
    fn empty_payload_allowed() {
        let frame = encode_chunk_frame(&sample_header(), b"").unwrap();
        let (_, data) = parse_chunk_frame(&frame).unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn too_short() {
        assert!(matches!(
            parse_chunk_frame(&[0, 0]),
            Err(ParseError::TooShort)
        ));
    }

    #[test]
    fn header_truncated() {
        let mut frame = vec![0, 0, 0, 100];
        frame.extend_from_slice(b"{}");
        assert!(matches!(
            parse_chunk_frame(&frame),
            Err(ParseError::HeaderTruncated {
                expected: 100,
                got: 2
            })
        ));
    }

    #[test]
    fn missing_field_is_invalid_json() {
        let header = serde_json::to_vec(&serde_json::json!({
            "id": "msg-7",
            "sessionId": "s-1",
            "totalChunks": 8,
            "fileName": "a.bin"
        }))
        .unwrap();
        let frame = make_binary_frame(&header, b"x");
        assert!(matches!(
            parse_chunk_frame(&frame),
            Err(ParseError::InvalidJson(_))
        ));
        assert_eq!(peek_frame_id(&frame).as_deref(), Some("msg-7"));
    }

    #[test]
    fn peek_on_garbage_returns_none() {
        let frame = make_binary_frame(b"not json", b"");
        assert!(peek_frame_id(&frame).is_none());
    }
}
