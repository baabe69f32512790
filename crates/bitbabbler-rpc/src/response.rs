//! Control-socket responses.
//!
//! Every response is a JSON array `[name, token, payload]`, serialized and
//! terminated with a single NUL byte, per the wire framing in §6.

use serde::Serialize;

use crate::error::ErrorKind;
use crate::value::Value;

#[derive(Debug, Clone, Serialize)]
#[serde(into = "(String, i64, Value)")]
pub struct Response {
    pub name: String,
    pub token: i64,
    pub payload: Value,
}

impl From<Response> for (String, i64, Value) {
    fn from(r: Response) -> Self {
        (r.name, r.token, r.payload)
    }
}

impl Response {
    pub fn new(name: impl Into<String>, token: i64, payload: Value) -> Self {
        Self { name: name.into(), token, payload }
    }

    pub fn get_ids(token: i64, ids: Vec<String>) -> Self {
        Self::new("GetIDs", token, Value::from(ids))
    }

    pub fn report_stats(token: i64, stats: Value) -> Self {
        Self::new("ReportStats", token, stats)
    }

    pub fn raw_data(token: i64, data: Value) -> Self {
        Self::new("GetRawData", token, data)
    }

    pub fn set_log_verbosity(token: i64, level: i64) -> Self {
        Self::new("SetLogVerbosity", token, Value::from(level))
    }

    pub fn unknown(token: i64, original_request: &str) -> Self {
        Self::new(ErrorKind::UnknownRequest.name(), token, Value::from(original_request))
    }

    pub fn bad_request(message: &str, request: &str) -> Self {
        let mut payload = Value::object();
        payload.insert("Error", message);
        payload.insert("Request", request);
        Self::new(ErrorKind::BadRequest.name(), 0, payload)
    }

    /// Serialize to JSON and append the single trailing NUL byte that
    /// terminates every response on the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = serde_json::to_vec(self).expect("Response always serializes");
        bytes.push(0);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_ids_encodes_as_array() {
        let resp = Response::get_ids(0, vec!["S-1".into(), "S-2".into()]);
        let bytes = resp.encode();
        assert_eq!(bytes.last(), Some(&0u8));
        let text = std::str::from_utf8(&bytes[..bytes.len() - 1]).unwrap();
        assert_eq!(text, r#"["GetIDs",0,["S-1","S-2"]]"#);
    }

    #[test]
    fn bad_request_echoes_original_text() {
        let resp = Response::bad_request("parse error", "{not-json");
        let bytes = resp.encode();
        let text = std::str::from_utf8(&bytes[..bytes.len() - 1]).unwrap();
        assert!(text.starts_with(r#"["BadRequest",0,{"#));
        assert!(text.contains(r#""Request":"{not-json""#));
    }
}
