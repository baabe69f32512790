//! Control-socket request parsing.
//!
//! A request is a null-terminated JSON text in one of two shapes: a bare
//! command string with no token and no argument, or an array of
//! `[command, token, ...args]`.

use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::error::ProtocolError;

/// The commands the control socket understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    GetIds,
    ReportStats,
    GetRawData,
    SetLogVerbosity,
}

impl Command {
    pub fn name(self) -> &'static str {
        match self {
            Command::GetIds => "GetIDs",
            Command::ReportStats => "ReportStats",
            Command::GetRawData => "GetRawData",
            Command::SetLogVerbosity => "SetLogVerbosity",
        }
    }

    pub fn parse(name: &str) -> Option<Command> {
        match name {
            "GetIDs" => Some(Command::GetIds),
            "ReportStats" => Some(Command::ReportStats),
            "GetRawData" => Some(Command::GetRawData),
            "SetLogVerbosity" => Some(Command::SetLogVerbosity),
            _ => None,
        }
    }
}

/// A parsed request, prior to being matched against a known [`Command`].
///
/// `command_name` is kept as the raw string so an unrecognized command can
/// still be echoed back verbatim in an `UnknownRequest` response.
#[derive(Debug, Clone)]
pub struct Request {
    pub command_name: String,
    pub token: i64,
    pub args: Vec<JsonValue>,
    /// The original request text, retained for error reporting.
    pub raw: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Shape {
    Bare(String),
    Call(Vec<JsonValue>),
}

impl Request {
    /// Parse one null-terminated request body (the trailing NUL must
    /// already have been stripped by the caller).
    pub fn parse(raw: &str) -> Result<Request, ProtocolError> {
        let shape: Shape = serde_json::from_str(raw)
            .map_err(|e| ProtocolError::new(e.to_string(), raw))?;

        match shape {
            Shape::Bare(command_name) => {
                Ok(Request { command_name, token: 0, args: Vec::new(), raw: raw.to_owned() })
            }
            Shape::Call(mut items) => {
                if items.is_empty() {
                    return Err(ProtocolError::new("empty request array", raw));
                }
                let command_name = match items.remove(0) {
                    JsonValue::String(s) => s,
                    other => {
                        return Err(ProtocolError::new(
                            format!("expected command name string, got {other}"),
                            raw,
                        ))
                    }
                };
                let token = match items.first() {
                    Some(JsonValue::Number(n)) => {
                        let t = n.as_i64().unwrap_or(0);
                        items.remove(0);
                        t
                    }
                    _ => 0,
                };
                Ok(Request { command_name, token, args: items, raw: raw.to_owned() })
            }
        }
    }

    pub fn command(&self) -> Option<Command> {
        Command::parse(&self.command_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_string() {
        let req = Request::parse(r#""GetIDs""#).unwrap();
        assert_eq!(req.command_name, "GetIDs");
        assert_eq!(req.token, 0);
        assert!(req.args.is_empty());
        assert_eq!(req.command(), Some(Command::GetIds));
    }

    #[test]
    fn parses_call_with_token_and_args() {
        let req = Request::parse(r#"["ReportStats", 7, "S-1"]"#).unwrap();
        assert_eq!(req.command_name, "ReportStats");
        assert_eq!(req.token, 7);
        assert_eq!(req.args, vec![JsonValue::String("S-1".into())]);
    }

    #[test]
    fn rejects_malformed_json() {
        let err = Request::parse("{not-json").unwrap_err();
        assert_eq!(err.request, "{not-json");
    }

    #[test]
    fn unknown_command_name_still_parses() {
        let req = Request::parse(r#"["Frobnicate", 3]"#).unwrap();
        assert_eq!(req.command(), None);
        assert_eq!(req.command_name, "Frobnicate");
    }
}
