use serde_json::{json, Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("datagram is not valid utf-8")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datagram is not a json object")]
    NotAnObject,
    #[error("reply has no string `src` field")]
    MissingSource,
}

/// A reply datagram after strict parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyFrame {
    pub src: String,
    pub id: Option<u64>,
    pub body: ReplyBody,
}

/// The three reply shapes a device can produce.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyBody {
    Result(Value),
    Error { code: Option<i64>, message: String },
    Empty,
}

pub fn encode_request(id: u64, method: &str, params: &Value) -> Result<Vec<u8>, ProtocolError> {
    let frame = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    Ok(serde_json::to_vec(&frame)?)
}

pub fn parse_reply(datagram: &[u8]) -> Result<ReplyFrame, ProtocolError> {
    let text = std::str::from_utf8(datagram)?;
    let value: Value = serde_json::from_str(text.trim())?;
    let Value::Object(mut object) = value else {
        return Err(ProtocolError::NotAnObject);
    };

    let src = match object.remove("src") {
        Some(Value::String(src)) if !src.is_empty() => src,
        _ => return Err(ProtocolError::MissingSource),
    };
    let id = object.get("id").and_then(parse_id);
    let body = parse_body(&mut object);

    Ok(ReplyFrame { src, id, body })
}

fn parse_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn parse_body(object: &mut Map<String, Value>) -> ReplyBody {
    match object.remove("error") {
        None | Some(Value::Null) => {}
        Some(Value::String(message)) => return ReplyBody::Error { code: None, message },
        Some(Value::Object(error)) => {
            let code = error.get("code").and_then(Value::as_i64);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unspecified device error")
                .to_string();
            return ReplyBody::Error { code, message };
        }
        Some(other) => {
            return ReplyBody::Error {
                code: None,
                message: other.to_string(),
            }
        }
    }

    match object.remove("result") {
        None | Some(Value::Null) => ReplyBody::Empty,
        Some(result) => ReplyBody::Result(result),
    }
}
