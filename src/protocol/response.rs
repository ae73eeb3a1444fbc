//! Frame encoding for outgoing management messages.

use crate::constants::{FRAME_KIND_REQUEST, FRAME_KIND_RESPONSE};
use crate::encode::{ToByte, encode_nullable_string};
use crate::error::{MgmtErrorCode, Result};
use crate::types::CorrelationId;

use super::Op;

/// An outbound response, paired to a received request by correlation id.
pub struct WireResponse {
    pub correlation_id: CorrelationId,
    pub status: MgmtErrorCode,
    body: Vec<u8>,
}

impl WireResponse {
    /// Successful response with a payload body.
    pub fn ok(correlation_id: CorrelationId, body: Vec<u8>) -> Self {
        WireResponse {
            correlation_id,
            status: MgmtErrorCode::None,
            body,
        }
    }

    /// Successful response with no payload.
    pub fn ok_empty(correlation_id: CorrelationId) -> Self {
        Self::ok(correlation_id, Vec::new())
    }

    /// Error response; the body carries the message as a nullable string.
    pub fn error(correlation_id: CorrelationId, status: MgmtErrorCode, message: &str) -> Self {
        let mut body = Vec::new();
        // Infallible into a Vec
        let _ = encode_nullable_string(Some(message), &mut body);
        WireResponse {
            correlation_id,
            status,
            body,
        }
    }

    /// Encode the response to a buffer with the size prefix.
    pub fn encode_with_size(&self) -> Result<Vec<u8>> {
        let mut payload = Vec::with_capacity(1 + 4 + 2 + self.body.len());
        FRAME_KIND_RESPONSE.encode(&mut payload)?;
        self.correlation_id.encode(&mut payload)?;
        (self.status as i16).encode(&mut payload)?;
        payload.extend_from_slice(&self.body);

        prefix_with_size(payload)
    }
}

/// Encode an outbound request frame with the size prefix.
pub fn encode_request_frame(op: Op, correlation_id: CorrelationId, body: &[u8]) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(1 + 2 + 4 + body.len());
    FRAME_KIND_REQUEST.encode(&mut payload)?;
    i16::from(op).encode(&mut payload)?;
    correlation_id.encode(&mut payload)?;
    payload.extend_from_slice(body);

    prefix_with_size(payload)
}

fn prefix_with_size(payload: Vec<u8>) -> Result<Vec<u8>> {
    let mut framed = Vec::with_capacity(4 + payload.len());
    (payload.len() as i32).encode(&mut framed)?;
    framed.extend_from_slice(&payload);
    Ok(framed)
}
