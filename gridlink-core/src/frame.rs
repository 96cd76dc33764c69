//! Wire frame codec
//!
//! GridLink frames are tagged JSON arrays over WebSocket, OCPP-style:
//! - CALL:            [2, messageId, action, payload]
//! - CALLRESULT:      [3, messageId, payload]
//! - CALLERROR:       [4, messageId, errorCode, errorDescription, errorDetails]
//! - CALLRESULTERROR: [5, messageId, errorCode, errorDescription, errorDetails]
//! - SEND:            [6, messageId, action, payload]
//!
//! The discriminant values are fixed wire contract and must never be
//! renumbered. Signatures and multi-hop routing travel in an optional
//! trailing object element, omitted when empty so single-hop unsigned
//! traffic keeps the plain array shapes above.
//!
//! A binary variant of the codec carries the payload as a length-prefixed
//! byte block instead of embedded JSON, for large transfers.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::signing::SignatureRecord;
use crate::types::SourceRouting;

/// Frame type discriminants (fixed wire values)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
    CallResultError = 5,
    Send = 6,
}

/// RPC-level error codes carried by CALLERROR / CALLRESULTERROR frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    FormatViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Decode failures. Decode is total over arbitrary input: every failure is
/// reported as a typed error, never a panic.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unknown message type: {0}")]
    UnknownType(i64),
}

fn malformed(reason: impl Into<String>) -> DecodeError {
    DecodeError::MalformedFrame(reason.into())
}

/// Encode failures. The binary codec length-prefixes ids and actions with
/// u16, so oversized string fields are refused rather than truncated.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("JSON encode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("string field of {len} bytes exceeds the 65535-byte binary frame limit")]
    StringTooLong { len: usize },
}

/// Business payload, opaque to the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Structured JSON document
    Json(Value),
    /// Raw byte blob (file chunks and other large transfers)
    Binary(Vec<u8>),
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Json(Value::Object(serde_json::Map::new()))
    }
}

impl Payload {
    /// Build a JSON payload from any serializable value
    pub fn json(value: impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Payload::Json(serde_json::to_value(value)?))
    }

    /// Parse the payload as a typed document
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match self {
            Payload::Json(v) => serde_json::from_value(v.clone()),
            Payload::Binary(b) => serde_json::from_slice(b),
        }
    }

    /// Canonical byte representation used for signing and verification.
    ///
    /// JSON payloads serialize with sorted object keys (the serde_json
    /// default map ordering), so signer and verifier agree byte-for-byte.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        match self {
            // Serializing an in-memory Value cannot fail
            Payload::Json(v) => serde_json::to_vec(v).unwrap_or_default(),
            Payload::Binary(b) => b.clone(),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(v) => Some(v),
            Payload::Binary(_) => None,
        }
    }

    /// JSON wire form. Binary blobs are wrapped as `{"$binary": "<hex>"}`
    /// so they survive the text framing. A JSON payload that happens to
    /// look like a wrapper is escaped as `{"$json": …}` so the decoder can
    /// tell them apart and round-trip equality holds for every payload.
    fn to_json_value(&self) -> Value {
        match self {
            Payload::Json(v) if is_wrapper_shape(v) => serde_json::json!({ "$json": v.clone() }),
            Payload::Json(v) => v.clone(),
            Payload::Binary(b) => serde_json::json!({ "$binary": hex::encode(b) }),
        }
    }

    fn from_json_value(value: Value) -> Self {
        if let Some(obj) = value.as_object() {
            if obj.len() == 1 {
                if let Some(Value::String(s)) = obj.get("$binary") {
                    if let Ok(bytes) = hex::decode(s) {
                        return Payload::Binary(bytes);
                    }
                }
                if let Some(inner) = obj.get("$json") {
                    return Payload::Json(inner.clone());
                }
            }
        }
        Payload::Json(value)
    }
}

/// Single-key objects that would be mistaken for a codec wrapper on decode
fn is_wrapper_shape(value: &Value) -> bool {
    match value.as_object() {
        Some(obj) if obj.len() == 1 => obj.contains_key("$binary") || obj.contains_key("$json"),
        _ => false,
    }
}

/// Error triple carried by the two error frame shapes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: ErrorCode,
    pub description: String,
    pub details: Value,
}

impl ErrorDetail {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: Value::Object(serde_json::Map::new()),
        }
    }
}

/// Optional frame annotations: signatures and multi-hop routing
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameExtras {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<SignatureRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<SourceRouting>,
}

impl FrameExtras {
    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty() && self.routing.is_none()
    }
}

/// A decoded wire frame (any of the five shapes)
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Call {
        message_id: String,
        action: String,
        payload: Payload,
        extras: FrameExtras,
    },
    CallResult {
        message_id: String,
        payload: Payload,
        extras: FrameExtras,
    },
    CallError {
        message_id: String,
        error: ErrorDetail,
        extras: FrameExtras,
    },
    CallResultError {
        message_id: String,
        error: ErrorDetail,
        extras: FrameExtras,
    },
    /// Fire-and-forget message: never correlated, never answered
    Send {
        message_id: String,
        action: String,
        payload: Payload,
        extras: FrameExtras,
    },
}

impl Frame {
    pub fn call(message_id: impl Into<String>, action: impl Into<String>, payload: Payload) -> Self {
        Frame::Call {
            message_id: message_id.into(),
            action: action.into(),
            payload,
            extras: FrameExtras::default(),
        }
    }

    pub fn call_result(message_id: impl Into<String>, payload: Payload) -> Self {
        Frame::CallResult {
            message_id: message_id.into(),
            payload,
            extras: FrameExtras::default(),
        }
    }

    pub fn call_error(
        message_id: impl Into<String>,
        code: ErrorCode,
        description: impl Into<String>,
    ) -> Self {
        Frame::CallError {
            message_id: message_id.into(),
            error: ErrorDetail::new(code, description),
            extras: FrameExtras::default(),
        }
    }

    pub fn call_result_error(
        message_id: impl Into<String>,
        code: ErrorCode,
        description: impl Into<String>,
    ) -> Self {
        Frame::CallResultError {
            message_id: message_id.into(),
            error: ErrorDetail::new(code, description),
            extras: FrameExtras::default(),
        }
    }

    pub fn send(message_id: impl Into<String>, action: impl Into<String>, payload: Payload) -> Self {
        Frame::Send {
            message_id: message_id.into(),
            action: action.into(),
            payload,
            extras: FrameExtras::default(),
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Call { .. } => MessageType::Call,
            Frame::CallResult { .. } => MessageType::CallResult,
            Frame::CallError { .. } => MessageType::CallError,
            Frame::CallResultError { .. } => MessageType::CallResultError,
            Frame::Send { .. } => MessageType::Send,
        }
    }

    pub fn message_id(&self) -> &str {
        match self {
            Frame::Call { message_id, .. }
            | Frame::CallResult { message_id, .. }
            | Frame::CallError { message_id, .. }
            | Frame::CallResultError { message_id, .. }
            | Frame::Send { message_id, .. } => message_id,
        }
    }

    pub fn action(&self) -> Option<&str> {
        match self {
            Frame::Call { action, .. } | Frame::Send { action, .. } => Some(action),
            _ => None,
        }
    }

    pub fn extras(&self) -> &FrameExtras {
        match self {
            Frame::Call { extras, .. }
            | Frame::CallResult { extras, .. }
            | Frame::CallError { extras, .. }
            | Frame::CallResultError { extras, .. }
            | Frame::Send { extras, .. } => extras,
        }
    }

    pub fn extras_mut(&mut self) -> &mut FrameExtras {
        match self {
            Frame::Call { extras, .. }
            | Frame::CallResult { extras, .. }
            | Frame::CallError { extras, .. }
            | Frame::CallResultError { extras, .. }
            | Frame::Send { extras, .. } => extras,
        }
    }

    /// Attach signatures, consuming and returning the frame
    pub fn with_signatures(mut self, signatures: Vec<SignatureRecord>) -> Self {
        self.extras_mut().signatures = signatures;
        self
    }

    /// Attach a routing path, consuming and returning the frame
    pub fn with_routing(mut self, routing: SourceRouting) -> Self {
        self.extras_mut().routing = Some(routing);
        self
    }

    // ------------------------------------------------------------------
    // JSON codec
    // ------------------------------------------------------------------

    /// Encode to the JSON array wire form
    pub fn to_json_string(&self) -> Result<String, EncodeError> {
        let mut array = match self {
            Frame::Call {
                message_id,
                action,
                payload,
                ..
            } => vec![
                Value::from(MessageType::Call as i64),
                Value::from(message_id.as_str()),
                Value::from(action.as_str()),
                payload.to_json_value(),
            ],
            Frame::CallResult {
                message_id, payload, ..
            } => vec![
                Value::from(MessageType::CallResult as i64),
                Value::from(message_id.as_str()),
                payload.to_json_value(),
            ],
            Frame::CallError {
                message_id, error, ..
            } => error_elements(MessageType::CallError, message_id, error),
            Frame::CallResultError {
                message_id, error, ..
            } => error_elements(MessageType::CallResultError, message_id, error),
            Frame::Send {
                message_id,
                action,
                payload,
                ..
            } => vec![
                Value::from(MessageType::Send as i64),
                Value::from(message_id.as_str()),
                Value::from(action.as_str()),
                payload.to_json_value(),
            ],
        };

        let extras = self.extras();
        if !extras.is_empty() {
            array.push(serde_json::to_value(extras)?);
        }

        Ok(serde_json::to_string(&Value::Array(array))?)
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        self.to_json_string().map(String::into_bytes)
    }

    /// Decode from JSON bytes. Total: every malformed input maps to a
    /// [`DecodeError`] rather than a panic.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| malformed(format!("invalid JSON: {}", e)))?;

        let array = match value {
            Value::Array(a) => a,
            _ => return Err(malformed("frame is not a JSON array")),
        };

        let discriminant = array
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| malformed("missing integer discriminant"))?;

        match discriminant {
            2 | 6 => {
                // [type, id, action, payload, extras?]
                check_arity(&array, 4)?;
                let message_id = element_str(&array, 1, "messageId")?;
                let action = element_str(&array, 2, "action")?;
                let payload = Payload::from_json_value(array[3].clone());
                let extras = trailing_extras(&array, 4)?;
                Ok(if discriminant == 2 {
                    Frame::Call {
                        message_id,
                        action,
                        payload,
                        extras,
                    }
                } else {
                    Frame::Send {
                        message_id,
                        action,
                        payload,
                        extras,
                    }
                })
            }
            3 => {
                // [3, id, payload, extras?]
                check_arity(&array, 3)?;
                let message_id = element_str(&array, 1, "messageId")?;
                let payload = Payload::from_json_value(array[2].clone());
                let extras = trailing_extras(&array, 3)?;
                Ok(Frame::CallResult {
                    message_id,
                    payload,
                    extras,
                })
            }
            4 | 5 => {
                // [type, id, code, description, details, extras?]
                check_arity(&array, 5)?;
                let message_id = element_str(&array, 1, "messageId")?;
                let code_str = element_str(&array, 2, "errorCode")?;
                // Unrecognized codes fold into GenericError; the frame is
                // still delivered
                let code: ErrorCode = serde_json::from_value(Value::String(code_str))
                    .unwrap_or(ErrorCode::GenericError);
                let description = array[3].as_str().unwrap_or("").to_string();
                let details = array[4].clone();
                let extras = trailing_extras(&array, 5)?;
                let error = ErrorDetail {
                    code,
                    description,
                    details,
                };
                Ok(if discriminant == 4 {
                    Frame::CallError {
                        message_id,
                        error,
                        extras,
                    }
                } else {
                    Frame::CallResultError {
                        message_id,
                        error,
                        extras,
                    }
                })
            }
            other => Err(DecodeError::UnknownType(other)),
        }
    }

    // ------------------------------------------------------------------
    // Binary codec
    // ------------------------------------------------------------------

    /// Encode to the binary wire form: tag byte, length-prefixed strings,
    /// and the payload as a length-prefixed byte block.
    pub fn to_binary_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::with_capacity(64);
        out.push(self.message_type() as u8);
        put_str16(&mut out, self.message_id())?;

        match self {
            Frame::Call {
                action, payload, ..
            }
            | Frame::Send {
                action, payload, ..
            } => {
                put_str16(&mut out, action)?;
                put_payload(&mut out, payload);
            }
            Frame::CallResult { payload, .. } => {
                put_payload(&mut out, payload);
            }
            Frame::CallError { error, .. } | Frame::CallResultError { error, .. } => {
                put_str16(&mut out, &error.code.to_string())?;
                put_block32(&mut out, error.description.as_bytes());
                put_block32(&mut out, &serde_json::to_vec(&error.details)?);
            }
        }

        let extras = self.extras();
        if extras.is_empty() {
            put_block32(&mut out, &[]);
        } else {
            put_block32(&mut out, &serde_json::to_vec(extras)?);
        }

        Ok(out)
    }

    /// Decode from binary bytes; total over arbitrary input
    pub fn from_binary_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = Cursor::new(bytes);
        let tag = cursor.u8()?;

        let frame = match tag as i64 {
            2 | 6 => {
                let message_id = cursor.str16()?;
                let action = cursor.str16()?;
                let payload = cursor.payload()?;
                let extras = cursor.extras()?;
                if tag == 2 {
                    Frame::Call {
                        message_id,
                        action,
                        payload,
                        extras,
                    }
                } else {
                    Frame::Send {
                        message_id,
                        action,
                        payload,
                        extras,
                    }
                }
            }
            3 => {
                let message_id = cursor.str16()?;
                let payload = cursor.payload()?;
                let extras = cursor.extras()?;
                Frame::CallResult {
                    message_id,
                    payload,
                    extras,
                }
            }
            4 | 5 => {
                let message_id = cursor.str16()?;
                let code_str = cursor.str16()?;
                let code: ErrorCode = serde_json::from_value(Value::String(code_str))
                    .unwrap_or(ErrorCode::GenericError);
                let description = String::from_utf8(cursor.block32()?.to_vec())
                    .map_err(|_| malformed("error description is not UTF-8"))?;
                let details: Value = serde_json::from_slice(cursor.block32()?)
                    .map_err(|e| malformed(format!("invalid error details: {}", e)))?;
                let extras = cursor.extras()?;
                let error = ErrorDetail {
                    code,
                    description,
                    details,
                };
                if tag == 4 {
                    Frame::CallError {
                        message_id,
                        error,
                        extras,
                    }
                } else {
                    Frame::CallResultError {
                        message_id,
                        error,
                        extras,
                    }
                }
            }
            other => return Err(DecodeError::UnknownType(other)),
        };

        if !cursor.is_empty() {
            return Err(malformed("trailing bytes after frame"));
        }
        Ok(frame)
    }
}

fn error_elements(msg_type: MessageType, message_id: &str, error: &ErrorDetail) -> Vec<Value> {
    vec![
        Value::from(msg_type as i64),
        Value::from(message_id),
        Value::from(error.code.to_string()),
        Value::from(error.description.as_str()),
        error.details.clone(),
    ]
}

fn check_arity(array: &[Value], base: usize) -> Result<(), DecodeError> {
    // One optional trailing extras element beyond the base shape
    if array.len() == base || array.len() == base + 1 {
        Ok(())
    } else {
        Err(malformed(format!(
            "expected {} or {} elements, got {}",
            base,
            base + 1,
            array.len()
        )))
    }
}

fn element_str(array: &[Value], idx: usize, name: &str) -> Result<String, DecodeError> {
    array
        .get(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| malformed(format!("{} is not a string", name)))
}

fn trailing_extras(array: &[Value], base: usize) -> Result<FrameExtras, DecodeError> {
    match array.get(base) {
        None => Ok(FrameExtras::default()),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| malformed(format!("invalid frame extras: {}", e))),
    }
}

// Binary framing primitives

const PAYLOAD_KIND_JSON: u8 = 0;
const PAYLOAD_KIND_BINARY: u8 = 1;

fn put_str16(out: &mut Vec<u8>, s: &str) -> Result<(), EncodeError> {
    let bytes = s.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(EncodeError::StringTooLong { len: bytes.len() });
    }
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn put_block32(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn put_payload(out: &mut Vec<u8>, payload: &Payload) {
    match payload {
        Payload::Json(v) => {
            // Serializing an in-memory Value cannot fail
            let bytes = serde_json::to_vec(v).unwrap_or_default();
            out.extend_from_slice(&((bytes.len() + 1) as u32).to_be_bytes());
            out.push(PAYLOAD_KIND_JSON);
            out.extend_from_slice(&bytes);
        }
        Payload::Binary(b) => {
            out.extend_from_slice(&((b.len() + 1) as u32).to_be_bytes());
            out.push(PAYLOAD_KIND_BINARY);
            out.extend_from_slice(b);
        }
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| malformed("truncated frame"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn str16(&mut self) -> Result<String, DecodeError> {
        let len = self.u16()? as usize;
        String::from_utf8(self.take(len)?.to_vec()).map_err(|_| malformed("string is not UTF-8"))
    }

    fn block32(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn payload(&mut self) -> Result<Payload, DecodeError> {
        let block = self.block32()?;
        let (kind, data) = block
            .split_first()
            .ok_or_else(|| malformed("empty payload block"))?;
        match *kind {
            PAYLOAD_KIND_JSON => {
                let value: Value = serde_json::from_slice(data)
                    .map_err(|e| malformed(format!("invalid payload JSON: {}", e)))?;
                Ok(Payload::Json(value))
            }
            PAYLOAD_KIND_BINARY => Ok(Payload::Binary(data.to_vec())),
            other => Err(malformed(format!("unknown payload kind: {}", other))),
        }
    }

    fn extras(&mut self) -> Result<FrameExtras, DecodeError> {
        let block = self.block32()?;
        if block.is_empty() {
            return Ok(FrameExtras::default());
        }
        serde_json::from_slice(block).map_err(|e| malformed(format!("invalid frame extras: {}", e)))
    }
}
