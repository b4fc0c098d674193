use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use crate::CloudError;

/// Envelope `code` values that mean success.
const SUCCESS_CODES: [i64; 3] = [0, 1, 200];

#[derive(Debug, Clone)]
pub struct CloudToken {
    pub token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<Instant>,
}

impl CloudToken {
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }
}

/// One device as reported by the status endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudDevice {
    pub devid: String,
    pub fields: Map<String, Value>,
}

impl CloudDevice {
    pub fn number(&self, field: &str) -> Option<f64> {
        match self.fields.get(field)? {
            Value::Number(number) => number.as_f64(),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub fetched_at: Instant,
    pub devices: Vec<CloudDevice>,
}

impl StatusSnapshot {
    pub fn device(&self, devid: &str) -> Option<&CloudDevice> {
        self.devices.iter().find(|device| device.devid == devid)
    }

    pub fn is_fresh(&self, freshness: Duration) -> bool {
        self.fetched_at.elapsed() < freshness
    }
}

#[derive(Debug)]
pub(crate) struct Envelope {
    pub code: Option<Value>,
    pub msg: Option<String>,
    pub data: Option<Value>,
}

impl Envelope {
    pub fn parse(body: &str) -> Result<Self, CloudError> {
        let value: Value = serde_json::from_str(body)
            .map_err(|err| CloudError::Malformed(format!("response body: {err}")))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, CloudError> {
        let Value::Object(mut fields) = value else {
            return Err(CloudError::Malformed(
                "response body is not a json object".to_string(),
            ));
        };
        let msg = match fields.remove("msg") {
            Some(Value::String(msg)) => Some(msg),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };
        Ok(Self {
            code: fields.remove("code").filter(|code| !code.is_null()),
            msg,
            data: fields.remove("data"),
        })
    }

    pub fn code(&self) -> Option<i64> {
        match self.code.as_ref()? {
            Value::Number(number) => number.as_i64(),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        match self.code {
            None => true,
            Some(_) => self.code().is_some_and(|code| SUCCESS_CODES.contains(&code)),
        }
    }

    pub fn message(&self) -> String {
        self.msg.clone().unwrap_or_default()
    }

    /// A failed envelope whose message blames the token.
    pub fn is_token_rejection(&self) -> bool {
        !self.is_success()
            && self
                .msg
                .as_deref()
                .is_some_and(|msg| msg.to_ascii_lowercase().contains("token"))
    }
}

pub(crate) enum StatusOutcome {
    Fetched(Vec<CloudDevice>),
    TokenRejected(String),
}

/// `data` is either a list of device records or a single record.
pub(crate) fn parse_devices(data: Option<Value>) -> Result<Vec<CloudDevice>, CloudError> {
    let records = match data {
        Some(Value::Array(records)) => records,
        Some(record @ Value::Object(_)) => vec![record],
        Some(Value::Null) | None => Vec::new(),
        Some(other) => {
            return Err(CloudError::Malformed(format!(
                "status data is neither a list nor a record: {other}"
            )))
        }
    };

    Ok(records
        .into_iter()
        .filter_map(|record| match record {
            Value::Object(fields) => {
                let devid = match fields.get("devid")? {
                    Value::String(id) => id.clone(),
                    Value::Number(id) => id.to_string(),
                    _ => return None,
                };
                Some(CloudDevice { devid, fields })
            }
            _ => None,
        })
        .collect())
}

pub(crate) fn parse_token(body: &str) -> Result<CloudToken, CloudError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|err| CloudError::Malformed(format!("login response: {err}")))?;

    // Some deployments wrap the credentials in the status envelope.
    let source = match value.get("data") {
        Some(data @ Value::Object(_)) if value.get("token").is_none() => data,
        _ => &value,
    };

    let Some(token) = source
        .get("token")
        .and_then(Value::as_str)
        .filter(|token| !token.is_empty())
    else {
        let message = value
            .get("msg")
            .and_then(Value::as_str)
            .unwrap_or("login response carried no token");
        return Err(CloudError::Auth(message.to_string()));
    };

    let expires_in = source.get("expires_in").and_then(|value| match value {
        Value::Number(secs) => secs.as_u64(),
        Value::String(secs) => secs.trim().parse().ok(),
        _ => None,
    });

    Ok(CloudToken {
        token: token.to_string(),
        refresh_token: source
            .get("refresh_token")
            .and_then(Value::as_str)
            .map(str::to_string),
        expires_at: expires_in.and_then(|secs| Instant::now().checked_add(Duration::from_secs(secs))),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn single_record_and_list_are_both_accepted() {
        let one = parse_devices(Some(json!({ "devid": "abc", "soc": 50 }))).unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].number("soc"), Some(50.0));

        let many = parse_devices(Some(json!([
            { "devid": "a" },
            { "name": "no id" },
            { "devid": 42, "soc": "61.5" },
        ])))
        .unwrap();
        let ids: Vec<&str> = many.iter().map(|d| d.devid.as_str()).collect();
        assert_eq!(ids, vec!["a", "42"]);
        assert_eq!(many[1].number("soc"), Some(61.5));

        assert!(parse_devices(Some(json!("oops"))).is_err());
        assert!(parse_devices(None).unwrap().is_empty());
    }

    #[test]
    fn envelope_token_rejection() {
        let envelope = Envelope::from_value(json!({ "code": "8", "msg": "Token expired" })).unwrap();
        assert!(!envelope.is_success());
        assert!(envelope.is_token_rejection());

        let envelope = Envelope::from_value(json!({ "code": 1, "msg": "token ok" })).unwrap();

        assert!(Envelope::from_value(json!([1, 2])).is_err());
        assert!(Envelope::from_value(json!({ "code": null })).unwrap().is_success());
        assert!(envelope.is_success());
        assert!(!envelope.is_token_rejection());
    }

    #[test]
    fn token_may_be_nested_in_data() {
        let token = parse_token(r#"{"code":1,"data":{"token":"t-1","expires_in":"60"}}"#).unwrap();
        assert_eq!(token.token, "t-1");
        assert!(token.expires_at.is_some());
        assert!(!token.is_expired());

        let err = parse_token(r#"{"code":0,"msg":"bad password"}"#).unwrap_err();
        assert!(matches!(err, CloudError::Auth(ref msg) if msg == "bad password"));
    }
}
