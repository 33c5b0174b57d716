use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

/// An inbound or outbound JSON-RPC request. A request without `id` is a
/// notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            id: Some(Value::from(id)),
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }

    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            id: None,
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        !is_answerable_id(self.id.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: Value,
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Result(Value),
    Error(ErrorBody),
}

impl Response {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            outcome: Outcome::Result(result),
        }
    }

    pub fn error(id: Value, error: ErrorBody) -> Self {
        Self {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            outcome: Outcome::Error(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, Outcome::Result(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Error(_))
    }

    pub fn into_result(self) -> Result<Value, ErrorBody> {
        match self.outcome {
            Outcome::Result(value) => Ok(value),
            Outcome::Error(error) => Err(error),
        }
    }
}

/// Ids follow loose truthiness: a missing, `null`, `false`, `0` or empty
/// string id never receives a response.
pub fn is_answerable_id(id: Option<&Value>) -> bool {
    match id {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64() != Some(0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorBody {}

impl ErrorBody {
    pub fn new(code: impl Into<ErrorCode>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error() -> Self {
        Self::new(StandardErrorCode::ParseError, "Parse error")
    }

    pub fn invalid_request() -> Self {
        Self::new(StandardErrorCode::InvalidRequest, "Invalid Request")
    }

    pub fn method_not_found() -> Self {
        Self::new(StandardErrorCode::MethodNotFound, "Method not found")
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(StandardErrorCode::InvalidParams, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(StandardErrorCode::InternalError, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(StandardErrorCode::ServerError, message)
    }
}

impl From<anyhow::Error> for ErrorBody {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ErrorBody>() {
            Ok(body) => body,
            Err(err) => Self::server_error(err.to_string()),
        }
    }
}

/// Wire error code: one of the reserved JSON-RPC codes or anything an
/// application handler chooses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum ErrorCode {
    Standard(StandardErrorCode),
    Custom(i32),
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self.into()
    }
}

impl From<i32> for ErrorCode {
    fn from(code: i32) -> Self {
        match StandardErrorCode::from_code(code) {
            Some(standard) => ErrorCode::Standard(standard),
            None => ErrorCode::Custom(code),
        }
    }
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Standard(standard) => standard as i32,
            ErrorCode::Custom(code) => code,
        }
    }
}

impl From<StandardErrorCode> for ErrorCode {
    fn from(code: StandardErrorCode) -> Self {
        ErrorCode::Standard(code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Standard(code) => write!(f, "{:?}({})", code, *code as i32),
            ErrorCode::Custom(code) => write!(f, "{}", code),
        }
    }
}

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandardErrorCode {
    ParseError = -32700,
    InvalidRequest = -32600,
    MethodNotFound = -32601,
    InvalidParams = -32602,
    InternalError = -32603,
    ServerError = -32000,
}

impl StandardErrorCode {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -32700 => Some(Self::ParseError),
            -32600 => Some(Self::InvalidRequest),
            -32601 => Some(Self::MethodNotFound),
            -32602 => Some(Self::InvalidParams),
            -32603 => Some(Self::InternalError),
            -32000 => Some(Self::ServerError),
            _ => None,
        }
    }
}

/// A decoded frame: a request (anything carrying `method`) or a response.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    /// Classifies one JSON object. Objects that are neither a request nor a
    /// response come back as the raw value for error reporting.
    pub fn classify(value: Value) -> Result<Message, Value> {
        let is_request = value.get("method").is_some();
        if is_request {
            serde_json::from_value::<Request>(value.clone())
                .map(Message::Request)
                .map_err(|_| value)
        } else {
            serde_json::from_value::<Response>(value.clone())
                .map(Message::Response)
                .map_err(|_| value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_field_layout() {
        let req = Request::new(1, "ping", None);
        assert_eq!(
            serde_json::to_string(&req).unwrap(),
            r#"{"id":1,"jsonrpc":"2.0","method":"ping"}"#
        );

        let notify = Request::notification("event", Some(json!([1, 2])));
        assert_eq!(
            serde_json::to_string(&notify).unwrap(),
            r#"{"jsonrpc":"2.0","method":"event","params":[1,2]}"#
        );
        assert!(notify.is_notification());
    }

    #[test]
    fn method_not_found_wire_shape() {
        let res = Response::error(json!(5), ErrorBody::method_not_found());
        assert_eq!(
            serde_json::to_value(&res).unwrap(),
            json!({"id": 5, "jsonrpc": "2.0", "error": {"code": -32601, "message": "Method not found"}})
        );
    }

    #[test]
    fn null_result_is_kept_on_the_wire() {
        let res = Response::ok(json!(3), Value::Null);
        let text = serde_json::to_string(&res).unwrap();
        assert_eq!(text, r#"{"id":3,"jsonrpc":"2.0","result":null}"#);

        let back: Response = serde_json::from_str(&text).unwrap();
        assert_eq!(back.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn custom_error_codes_survive() {
        let body: ErrorBody =
            serde_json::from_value(json!({"code": 42, "message": "nope"})).unwrap();
        assert_eq!(body.code, ErrorCode::Custom(42));

        let body: ErrorBody =
            serde_json::from_value(json!({"code": -32603, "message": "boom"})).unwrap();
        assert_eq!(body.code, ErrorCode::Standard(StandardErrorCode::InternalError));
    }

    #[test]
    fn classify_splits_requests_from_responses() {
        assert!(matches!(
            Message::classify(json!({"id": 1, "jsonrpc": "2.0", "method": "a"})),
            Ok(Message::Request(_))
        ));
        assert!(matches!(
            Message::classify(json!({"id": 1, "jsonrpc": "2.0", "result": true})),
            Ok(Message::Response(_))
        ));
        assert!(Message::classify(json!({"id": 1, "jsonrpc": "2.0"})).is_err());
        assert!(Message::classify(json!({"jsonrpc": "2.0", "method": 7})).is_err());
    }

    #[test]
    fn falsy_ids_are_not_answered() {
        assert!(!is_answerable_id(None));
        assert!(!is_answerable_id(Some(&json!(null))));
        assert!(!is_answerable_id(Some(&json!(0))));
        assert!(!is_answerable_id(Some(&json!(""))));
        assert!(is_answerable_id(Some(&json!(9))));
        assert!(is_answerable_id(Some(&json!("abc"))));
    }
}
