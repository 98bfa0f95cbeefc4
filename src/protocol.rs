//! Electrum wire protocol primitives.
//!
//! Electrum speaks a JSON-RPC 2.0 dialect with some non-standard
//! conventions: frames are newline-delimited, notifications carry a method
//! but a null or absent id, and well-behaved clients omit the `"jsonrpc"`
//! version field entirely (several server implementations drop clients that
//! advertise it). This module holds the pure helpers: request frame
//! building, statement parsing, and the protocol constants.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Separator between statements on the wire.
pub const STATEMENT_DELIMITER: char = '\n';

/// Sentinel id for the version negotiation request sent during handshake.
pub const VERSION_NEGOTIATION_ID: &str = "versionNegotiation";

/// Sentinel id for keep-alive pings. Responses bearing it are discarded
/// without touching the pending-request table.
pub const KEEP_ALIVE_ID: &str = "keepAlive";

/// Accepted protocol version strings: digits separated by dots, at least
/// one dot ("1.4", "1.4.2").
pub static VERSION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+(\.\d+)+$").expect("version pattern is valid"));

/// Request id as it appears on the wire.
///
/// Application requests use monotonically increasing numbers; the handshake
/// and keep-alive machinery use the string sentinels above.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id allocated by the client
    Number(u64),
    /// String sentinel (`"versionNegotiation"`, `"keepAlive"`)
    Name(String),
}

impl RequestId {
    /// Sentinel id constructor.
    pub fn name(name: &str) -> Self {
        RequestId::Name(name.to_string())
    }
}

/// Error object reported by a server inside a response statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    /// Numeric error code, when the server supplies one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    /// Human-readable error message
    #[serde(default)]
    pub message: String,
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "server error {}: {}", code, self.message),
            None => write!(f, "server error: {}", self.message),
        }
    }
}

/// One parsed statement from the wire.
///
/// A statement is either a response (id present) or a notification (method
/// present, id null or absent). All fields are optional so a single type
/// covers both shapes; the router decides which one it is looking at.
#[derive(Debug, Clone, Deserialize)]
pub struct Statement {
    /// Id matching a request, absent/null for notifications
    #[serde(default)]
    pub id: Option<RequestId>,
    /// Method name, present on notifications
    #[serde(default)]
    pub method: Option<String>,
    /// Notification payload
    #[serde(default)]
    pub params: Option<Value>,
    /// Response result on success
    #[serde(default)]
    pub result: Option<Value>,
    /// Response error on failure
    #[serde(default)]
    pub error: Option<RpcError>,
}

/// A statement line decoded from the wire: a single statement, or a batch
/// response whose elements are routed as independent statements.
#[derive(Debug)]
pub enum Inbound {
    /// One response or notification
    Single(Statement),
    /// JSON-RPC batch response, already split into elements
    Batch(Vec<Statement>),
}

/// Build a request frame: `{"method": …, "params": …, "id": …}`.
///
/// The returned string carries no trailing delimiter; the connection
/// appends it on send.
pub fn build_request(method: &str, params: &[Value], id: RequestId) -> Result<String> {
    #[derive(Serialize)]
    struct Frame<'a> {
        method: &'a str,
        params: &'a [Value],
        id: RequestId,
    }

    Ok(serde_json::to_string(&Frame { method, params, id })?)
}

/// Parse one statement line.
///
/// A top-level array is a batch response; its elements are decoded in place
/// rather than re-serialized and re-parsed.
pub fn parse_statement(text: &str) -> Result<Inbound> {
    let value: Value = serde_json::from_str(text)?;
    match value {
        Value::Array(elements) => {
            let mut batch = Vec::with_capacity(elements.len());
            for element in elements {
                batch.push(serde_json::from_value(element)?);
            }
            Ok(Inbound::Batch(batch))
        }
        single => Ok(Inbound::Single(serde_json::from_value(single)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn build_request_omits_jsonrpc_field() {
        let frame = build_request(
            "server.version",
            &[json!("App"), json!("1.4.1")],
            RequestId::name(VERSION_NEGOTIATION_ID),
        )
        .unwrap();

        assert!(!frame.contains("jsonrpc"));
        assert!(!frame.contains('\n'));

        let parsed: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["method"], "server.version");
        assert_eq!(parsed["params"], json!(["App", "1.4.1"]));
        assert_eq!(parsed["id"], "versionNegotiation");
    }

    #[test]
    fn build_request_numeric_id() {
        let frame = build_request("server.ping", &[], RequestId::Number(7)).unwrap();
        let parsed: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["id"], 7);
        assert_eq!(parsed["params"], json!([]));
    }

    #[test]
    fn version_regex_accepts_dotted_versions() {
        for ok in ["1.4", "1.4.2", "0.10", "2.0.0.1"] {
            assert!(VERSION_REGEX.is_match(ok), "{ok} should match");
        }
        for bad in ["1", "1.", ".4", "1.4a", "v1.4", "", "1..4"] {
            assert!(!VERSION_REGEX.is_match(bad), "{bad} should not match");
        }
    }

    #[test]
    fn parse_response_statement() {
        let inbound = parse_statement(r#"{"id":3,"result":"abc"}"#).unwrap();
        let Inbound::Single(statement) = inbound else {
            panic!("expected single statement");
        };
        assert_eq!(statement.id, Some(RequestId::Number(3)));
        assert_eq!(statement.result, Some(json!("abc")));
        assert!(statement.error.is_none());
        assert!(statement.method.is_none());
    }

    #[test]
    fn parse_notification_with_null_id() {
        let inbound = parse_statement(
            r#"{"id":null,"method":"blockchain.headers.subscribe","params":[{"height":1}]}"#,
        )
        .unwrap();
        let Inbound::Single(statement) = inbound else {
            panic!("expected single statement");
        };
        assert_eq!(statement.id, None);
        assert_eq!(
            statement.method.as_deref(),
            Some("blockchain.headers.subscribe")
        );
        assert_eq!(statement.params, Some(json!([{"height": 1}])));
    }

    #[test]
    fn parse_error_statement() {
        let inbound =
            parse_statement(r#"{"id":5,"error":{"code":-32601,"message":"unknown method"}}"#)
                .unwrap();
        let Inbound::Single(statement) = inbound else {
            panic!("expected single statement");
        };
        let error = statement.error.unwrap();
        assert_eq!(error.code, Some(-32601));
        assert_eq!(error.message, "unknown method");
    }

    #[test]
    fn parse_batch_splits_elements() {
        let inbound =
            parse_statement(r#"[{"id":1,"result":"a"},{"id":2,"result":"b"}]"#).unwrap();
        let Inbound::Batch(statements) = inbound else {
            panic!("expected batch");
        };
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0].id, Some(RequestId::Number(1)));
        assert_eq!(statements[1].result, Some(json!("b")));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_statement("not json").is_err());
    }

    #[test]
    fn sentinel_ids_roundtrip() {
        let keep_alive: RequestId = serde_json::from_str(r#""keepAlive""#).unwrap();
        assert_eq!(keep_alive, RequestId::name(KEEP_ALIVE_ID));

        let numeric: RequestId = serde_json::from_str("42").unwrap();
        assert_eq!(numeric, RequestId::Number(42));
    }
}
