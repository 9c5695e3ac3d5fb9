//! Request and Response message types.
//!
//! The server speaks UTF-8 JSON without correlation ids. Data commands nest
//! their arguments, stream commands carry them flat next to the session
//! token.

// ============================================================================
// Imports
// ============================================================================

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

// ============================================================================
// Types
// ============================================================================

/// Command arguments, an ordered JSON object.
pub type Arguments = Map<String, Value>;

static CAMEL_BOUNDARY: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new("([A-Z])").ok());

/// Splits a camel-case command for logs: `ChartLastRequest` becomes
/// `Chart Last Request`.
#[must_use]
pub fn readable_command(command: &str) -> String {
    match CAMEL_BOUNDARY.as_ref() {
        Some(re) => re.replace_all(command, " $1").trim().to_string(),
        None => command.to_string(),
    }
}

// ============================================================================
// Request
// ============================================================================

/// A message from client to server.
///
/// # Format
///
/// Data request:
/// ```json
/// { "command": "getSymbol", "arguments": { "symbol": "EURUSD" }, "customTag": "t1" }
/// ```
///
/// Stream request:
/// ```json
/// { "command": "getTickPrices", "streamSessionId": "8469308861804289383", "symbol": "EURUSD" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    /// Command name.
    pub command: String,

    /// Nested arguments (data requests).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Arguments>,

    /// Session token (stream requests and stream-scoped pings).
    #[serde(rename = "streamSessionId", skip_serializing_if = "Option::is_none")]
    pub stream_session_id: Option<String>,

    /// Caller tag echoed by the server.
    #[serde(rename = "customTag", skip_serializing_if = "Option::is_none")]
    pub custom_tag: Option<String>,

    /// Flat arguments (stream requests).
    #[serde(flatten)]
    pub fields: Arguments,
}

impl Request {
    /// Creates a request without arguments.
    #[inline]
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            arguments: None,
            stream_session_id: None,
            custom_tag: None,
            fields: Arguments::new(),
        }
    }

    /// Nests `arguments` under `"arguments"`.
    #[inline]
    #[must_use]
    pub fn with_arguments(mut self, arguments: Arguments) -> Self {
        self.arguments = Some(arguments);
        self
    }

    /// Adds the session token.
    #[inline]
    #[must_use]
    pub fn with_stream_session(mut self, token: impl Into<String>) -> Self {
        self.stream_session_id = Some(token.into());
        self
    }

    /// Adds a custom tag.
    #[inline]
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.custom_tag = Some(tag.into());
        self
    }

    /// Places `fields` at the top level of the message.
    #[inline]
    #[must_use]
    pub fn with_fields(mut self, fields: Arguments) -> Self {
        self.fields.extend(fields);
        self
    }

    /// Login request.
    #[must_use]
    pub fn login(user_id: &str, password: &str) -> Self {
        let mut arguments = Arguments::new();
        arguments.insert("userId".to_string(), Value::from(user_id));
        arguments.insert("password".to_string(), Value::from(password));
        Self::new("login").with_arguments(arguments)
    }

    /// Serializes to the wire text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if serialization fails.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Response
// ============================================================================

/// A message from server to client.
///
/// Every field is optional on the wire; accessors enforce what a given
/// exchange requires.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Response {
    /// Success flag.
    #[serde(default)]
    pub status: Option<bool>,

    /// Server error code.
    #[serde(rename = "errorCode", default)]
    pub error_code: Option<String>,

    /// Server error description.
    #[serde(rename = "errorDescr", default)]
    pub error_descr: Option<String>,

    /// Payload of a data command.
    #[serde(rename = "returnData", default)]
    pub return_data: Option<Value>,

    /// Payload of a pushed stream packet.
    #[serde(default)]
    pub data: Option<Value>,

    /// Session token issued at login.
    #[serde(rename = "streamSessionId", default)]
    pub stream_session_id: Option<String>,

    /// Command of a pushed stream packet.
    #[serde(default)]
    pub command: Option<String>,

    /// Echoed custom tag.
    #[serde(rename = "customTag", default)]
    pub custom_tag: Option<String>,
}

impl Response {
    /// Decodes the first JSON value in `text`, ignoring what follows.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedResponse`] if no JSON object leads the text.
    pub fn decode(text: &str) -> Result<Self> {
        let first = serde_json::Deserializer::from_str(text)
            .into_iter::<Value>()
            .next()
            .ok_or_else(|| Error::malformed("empty message"))?
            .map_err(|e| Error::malformed(e.to_string()))?;

        Self::from_value(first)
    }

    /// Decodes every JSON value in `text`.
    ///
    /// A stream read may carry several pushed packets back to back.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedResponse`] if any value is not an object or
    /// the text holds no value.
    pub fn decode_all(text: &str) -> Result<Vec<Self>> {
        let mut responses = Vec::new();
        for value in serde_json::Deserializer::from_str(text).into_iter::<Value>() {
            let value = value.map_err(|e| Error::malformed(e.to_string()))?;
            responses.push(Self::from_value(value)?);
        }

        if responses.is_empty() {
            return Err(Error::malformed("empty message"));
        }
        Ok(responses)
    }

    fn from_value(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(Error::malformed("message is not a JSON object"));
        }
        serde_json::from_value(value).map_err(|e| Error::malformed(e.to_string()))
    }

    /// Checks the status flag.
    ///
    /// # Errors
    ///
    /// - [`Error::MissingField`] if `status` is absent and `expect_status` is set
    /// - [`Error::Server`] if `status` is `false`
    pub fn validate(self, expect_status: bool) -> Result<Self> {
        match self.status {
            Some(true) => Ok(self),
            Some(false) => Err(Error::server(
                self.error_code.unwrap_or_default(),
                self.error_descr.unwrap_or_default(),
            )),
            None if expect_status => Err(Error::MissingField { field: "status" }),
            None => Ok(self),
        }
    }

    /// Takes the `returnData` payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingField`] if the field is absent.
    pub fn into_return_data(self) -> Result<Value> {
        self.return_data
            .ok_or(Error::MissingField { field: "returnData" })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn args(value: Value) -> Arguments {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_data_request_nests_arguments() {
        let request = Request::new("getSymbol")
            .with_arguments(args(json!({"symbol": "EURUSD"})))
            .with_tag("t1");

        let value: Value = serde_json::from_str(&request.encode().expect("encode")).expect("json");
        assert_eq!(
            value,
            json!({"command": "getSymbol", "arguments": {"symbol": "EURUSD"}, "customTag": "t1"})
        );
    }

    #[test]
    fn test_stream_request_is_flat() {
        let request = Request::new("getTickPrices")
            .with_stream_session("abc")
            .with_fields(args(json!({"symbol": "EURUSD", "minArrivalTime": 1})));

        let value: Value = serde_json::from_str(&request.encode().expect("encode")).expect("json");
        assert_eq!(
            value,
            json!({
                "command": "getTickPrices",
                "streamSessionId": "abc",
                "symbol": "EURUSD",
                "minArrivalTime": 1
            })
        );
    }

    #[test]
    fn test_login_request() {
        let value = serde_json::to_value(Request::login("1000", "pw")).expect("json");
        assert_eq!(value["command"], "login");
        assert_eq!(value["arguments"]["userId"], "1000");
        assert_eq!(value["arguments"]["password"], "pw");
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let response = Response::decode("{\"status\":true,\"returnData\":5}\n\n").expect("decode");
        assert_eq!(response.status, Some(true));
        assert_eq!(response.into_return_data().expect("data"), json!(5));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Response::decode("{\"status\":tr"),
            Err(Error::MalformedResponse { .. })
        ));
        assert!(matches!(
            Response::decode("[1,2]"),
            Err(Error::MalformedResponse { .. })
        ));
        assert!(Response::decode("").is_err());
    }

    #[test]
    fn test_decode_all_splits_packets() {
        let packets = Response::decode_all(
            "{\"command\":\"tickPrices\",\"data\":{\"ask\":1.1}}\n\n{\"command\":\"keepAlive\",\"data\":{}}",
        )
        .expect("decode");

        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].command.as_deref(), Some("tickPrices"));
        assert_eq!(packets[1].command.as_deref(), Some("keepAlive"));
    }

    #[test]
    fn test_validate_status_false_is_server_error() {
        let response =
            Response::decode(r#"{"status":false,"errorCode":"E1","errorDescr":"bad"}"#).expect("decode");

        match response.validate(true) {
            Err(Error::Server { code, description }) => {
                assert_eq!(code, "E1");
                assert_eq!(description, "bad");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_validate_missing_status() {
        let response = Response::decode(r#"{"returnData":1}"#).expect("decode");
        assert!(matches!(
            response.clone().validate(true),
            Err(Error::MissingField { field: "status" })
        ));
        assert!(response.validate(false).is_ok());
    }

    #[test]
    fn test_missing_return_data() {
        let response = Response::decode(r#"{"status":true}"#).expect("decode");
        assert!(matches!(
            response.into_return_data(),
            Err(Error::MissingField { field: "returnData" })
        ));
    }

    #[test]
    fn test_readable_command() {
        assert_eq!(readable_command("ChartLastRequest"), "Chart Last Request");
        assert_eq!(readable_command("getTickPrices"), "get Tick Prices");
        assert_eq!(readable_command("ping"), "ping");
    }
}
