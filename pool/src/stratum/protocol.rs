/// Stratum wire types: the request envelope, responses with the
/// `[code, message, false]` error triple, server-push builders, and the
/// typed `mining.submit` payload.
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::error::ShareError;

/// Longest method name accepted in a request envelope.
pub const MAX_METHOD_LEN: usize = 50;
/// Secondary-nonce width in bytes; miners send twice as many hex digits.
pub const NONCE2_SIZE: usize = 4;
/// Timestamp field width in hex digits.
pub const TIME_HEX_LEN: usize = 8;

pub const METHOD_SUBSCRIBE: &str = "mining.subscribe";
pub const METHOD_AUTHORIZE: &str = "mining.authorize";
pub const METHOD_SUBMIT: &str = "mining.submit";

/// Request envelopes that fail here carry a parse-error penalty, distinct
/// from field-level submission validation.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("missing method")]
    MissingMethod,
    #[error("method exceeds {MAX_METHOD_LEN} chars")]
    MethodTooLong,
}

/// Generic inbound request: `{id, method, params}`.
#[derive(Debug, Clone)]
pub struct Request {
    /// String or number, anything else collapses to null.
    pub id: Value,
    pub method: String,
    pub params: Vec<Value>,
}

impl Request {
    pub fn parse(line: &str) -> Result<Request, ParseError> {
        let value: Value = serde_json::from_str(line)?;
        let id = match value.get("id") {
            Some(Value::String(s)) => Value::String(s.clone()),
            Some(Value::Number(n)) => Value::Number(n.clone()),
            _ => Value::Null,
        };
        let method = value
            .get("method")
            .and_then(|m| m.as_str())
            .ok_or(ParseError::MissingMethod)?;
        if method.is_empty() {
            return Err(ParseError::MissingMethod);
        }
        if method.len() > MAX_METHOD_LEN {
            return Err(ParseError::MethodTooLong);
        }
        let params = value
            .get("params")
            .and_then(|p| p.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(Request {
            id,
            method: method.to_string(),
            params,
        })
    }
}

/// Outbound response: `{id, result, error}` with `error` either null or the
/// `[code, message, false]` triple.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub id: Value,
    pub result: Value,
    pub error: Value,
}

impl Response {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result,
            error: Value::Null,
        }
    }

    pub fn err(id: Value, code: i32, message: &str) -> Self {
        Self {
            id,
            result: Value::Null,
            error: json!([code, message, false]),
        }
    }
}

/// JSON-RPC error code for an unparseable line.
pub const CODE_PARSE: i32 = -32700;
/// JSON-RPC error code for an unknown method.
pub const CODE_METHOD_NOT_FOUND: i32 = -3;

pub fn notify_message(params: Value) -> Value {
    json!({
        "id": null,
        "method": "mining.notify",
        "params": params,
    })
}

pub fn set_difficulty_message(difficulty: u64) -> Value {
    json!({
        "id": null,
        "method": "mining.set_difficulty",
        "params": [difficulty],
    })
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Parsed `mining.submit` params: `[username, job_id, nonce2, time, nonce]`.
///
/// Every field passes format validation before any semantic check runs; hex
/// fields are normalized to lowercase so downstream fingerprints are
/// case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub username: String,
    pub job_id: String,
    pub nonce2: String,
    pub time: String,
    pub nonce: String,
}

impl Submission {
    pub fn from_params(params: &[Value], max_nonce_hex: usize) -> Result<Submission, ShareError> {
        if params.len() != 5 {
            return Err(ShareError::Malformed("expected 5 params"));
        }
        let field = |i: usize, name: &'static str| -> Result<&str, ShareError> {
            params[i].as_str().ok_or(ShareError::Malformed(name))
        };

        let username = field(0, "username must be a string")?;
        if username.is_empty() {
            return Err(ShareError::Malformed("empty username"));
        }

        let job_id = field(1, "job id must be a string")?;
        if job_id.is_empty() || job_id.len() > 21 {
            return Err(ShareError::Malformed("bad job id length"));
        }

        let nonce2 = field(2, "nonce2 must be a string")?;
        if nonce2.len() != NONCE2_SIZE * 2 || !is_hex(nonce2) {
            return Err(ShareError::Malformed("bad nonce2 width"));
        }

        let time = field(3, "time must be a string")?;
        if time.len() != TIME_HEX_LEN || !is_hex(time) {
            return Err(ShareError::Malformed("bad time width"));
        }

        let nonce = field(4, "nonce must be a string")?;
        if !is_hex(nonce) || nonce.len() % 2 != 0 || nonce.len() > max_nonce_hex {
            return Err(ShareError::Malformed("bad nonce"));
        }

        Ok(Submission {
            username: username.to_string(),
            job_id: job_id.to_string(),
            nonce2: nonce2.to_lowercase(),
            time: time.to_lowercase(),
            nonce: nonce.to_lowercase(),
        })
    }

    /// Per-job duplicate-detection key over the nonce tuple.
    pub fn fingerprint(&self) -> String {
        format!("{}:{}:{}", self.nonce2, self.time, self.nonce)
    }
}
