//! Wire message definitions for ptyhub.
//!
//! Session creation and listing use JSON over HTTP. The attach stream is a
//! WebSocket on which the client sends raw input bytes or JSON control
//! messages, and the daemon sends raw terminal output with no envelope.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Window height used when a creation request does not specify one.
pub const DEFAULT_ROWS: u16 = 24;

/// Window width used when a creation request does not specify one.
pub const DEFAULT_COLS: u16 = 80;

// ============================================================================
// Session creation
// ============================================================================

/// Request to create a new shell session.
///
/// Every field is optional; an empty request body is equivalent to
/// `CreateSessionRequest::default()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// Shell program to run instead of the host default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    /// Initial window height.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
    /// Initial window width.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
}

impl CreateSessionRequest {
    /// Decodes a request body, treating an empty or whitespace-only body as
    /// the default request.
    pub fn from_json_bytes(body: &[u8]) -> Result<Self> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        let request: Self = serde_json::from_slice(body)?;
        if request.rows == Some(0) || request.cols == Some(0) {
            return Err(ProtocolError::InvalidWindowSize {
                rows: request.rows.unwrap_or(DEFAULT_ROWS),
                cols: request.cols.unwrap_or(DEFAULT_COLS),
            });
        }
        Ok(request)
    }
}

/// Response confirming session creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    /// Identifier to attach with.
    pub session_id: String,
    /// Human-readable status line.
    pub message: String,
}

/// Response confirming a session was closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseSessionResponse {
    /// Identifier of the closed session.
    pub session_id: String,
    /// Human-readable status line.
    pub message: String,
}

/// Listing entry describing a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Session identifier.
    pub session_id: String,
    /// Shell program the session runs.
    pub shell: String,
    /// Process ID of the shell, when the platform reports one.
    pub pid: Option<u32>,
    /// Current window height.
    pub rows: u16,
    /// Current window width.
    pub cols: u16,
    /// Number of attached clients.
    pub clients: usize,
    /// Creation time as Unix milliseconds.
    pub created_at: u64,
}

// ============================================================================
// Errors
// ============================================================================

/// Distinguished error codes surfaced to HTTP and WebSocket callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// No live session has the requested identifier.
    SessionNotFound,
    /// An attach or close request did not carry a session identifier.
    MissingSessionId,
    /// The request is not valid for this endpoint.
    InvalidOperation,
    /// The connection or session could not be established.
    ConnectionFailed,
    /// The session closed while the request was being served.
    TerminalClosed,
}

impl ErrorCode {
    /// Returns the wire spelling of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::MissingSessionId => "MISSING_SESSION_ID",
            ErrorCode::InvalidOperation => "INVALID_OPERATION",
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::TerminalClosed => "TERMINAL_CLOSED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable code.
    pub error: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl ErrorResponse {
    /// Creates an error body.
    pub fn new(error: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error,
            message: message.into(),
        }
    }
}

// ============================================================================
// Attach stream
// ============================================================================

/// Structured control message a client may send as a text frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Text to write to the shell's input.
    Input {
        /// The text to write.
        data: String,
    },
    /// New window geometry.
    Resize {
        /// New height.
        rows: u16,
        /// New width.
        cols: u16,
    },
}

const CONTROL_TYPES: &[&str] = &["input", "resize"];

impl ControlMessage {
    /// Parses a control message.
    ///
    /// Fails with [`ProtocolError::UnknownMessageType`] when the text is a
    /// JSON object whose `type` is not a control type, and with
    /// [`ProtocolError::Deserialization`] for anything else that is not a
    /// well-formed control message.
    pub fn parse(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ProtocolError::Deserialization("missing `type` field".to_string()))?;

        if !CONTROL_TYPES.contains(&kind) {
            return Err(ProtocolError::UnknownMessageType(kind.to_string()));
        }

        let message: ControlMessage = serde_json::from_value(value)?;
        if let ControlMessage::Resize { rows, cols } = message {
            if rows == 0 || cols == 0 {
                return Err(ProtocolError::InvalidWindowSize { rows, cols });
            }
        }
        Ok(message)
    }

    /// Encodes the message as JSON text.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A decoded frame from an attached client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientInput {
    /// Bytes to write to the PTY.
    Input(Vec<u8>),
    /// New window geometry.
    Resize {
        /// New height.
        rows: u16,
        /// New width.
        cols: u16,
    },
}

impl ClientInput {
    /// Decodes a text frame.
    ///
    /// Text that is a control message is decoded as one. Text that is not
    /// JSON, or is JSON without a control `type`, is raw input. A frame that
    /// names a control type but is malformed is an error rather than input,
    /// so broken control traffic never reaches the shell.
    pub fn from_text(text: &str) -> Result<Self> {
        match ControlMessage::parse(text) {
            Ok(message) => Ok(message.into()),
            Err(err) if names_control_type(text) => Err(err),
            Err(_) => Ok(ClientInput::Input(text.as_bytes().to_vec())),
        }
    }

    /// Decodes a binary frame, which is always raw input.
    pub fn from_binary(data: &[u8]) -> Self {
        ClientInput::Input(data.to_vec())
    }
}

impl From<ControlMessage> for ClientInput {
    fn from(message: ControlMessage) -> Self {
        match message {
            ControlMessage::Input { data } => ClientInput::Input(data.into_bytes()),
            ControlMessage::Resize { rows, cols } => ClientInput::Resize { rows, cols },
        }
    }
}

fn names_control_type(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_owned))
        .is_some_and(|kind| CONTROL_TYPES.contains(&kind.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_request_empty_body_is_default() {
        let request = CreateSessionRequest::from_json_bytes(b"").unwrap();
        assert_eq!(request, CreateSessionRequest::default());

        let request = CreateSessionRequest::from_json_bytes(b"  \n").unwrap();
        assert_eq!(request, CreateSessionRequest::default());
    }

    #[test]
    fn test_create_request_partial_fields() {
        let request = CreateSessionRequest::from_json_bytes(br#"{"rows": 40}"#).unwrap();
        assert_eq!(request.rows, Some(40));
        assert_eq!(request.cols, None);
        assert_eq!(request.shell, None);
    }

    #[test]
    fn test_create_request_rejects_zero_size() {
        let result = CreateSessionRequest::from_json_bytes(br#"{"rows": 0, "cols": 100}"#);
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidWindowSize { rows: 0, cols: 100 })
        ));
    }

    #[test]
    fn test_create_request_rejects_garbage() {
        let result = CreateSessionRequest::from_json_bytes(b"{not json");
        assert!(matches!(result, Err(ProtocolError::Deserialization(_))));
    }

    #[test]
    fn test_create_response_uses_camel_case() {
        let response = CreateSessionResponse {
            session_id: "abc".to_string(),
            message: "Session created successfully".to_string(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""sessionId":"abc""#));
    }

    #[test]
    fn test_error_code_wire_spelling() {
        for code in [
            ErrorCode::SessionNotFound,
            ErrorCode::MissingSessionId,
            ErrorCode::InvalidOperation,
            ErrorCode::ConnectionFailed,
            ErrorCode::TerminalClosed,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn test_error_response_body() {
        let body = ErrorResponse::new(ErrorCode::SessionNotFound, "Session not found");
        let json = serde_json::to_string(&body).unwrap();
        assert_eq!(
            json,
            r#"{"error":"SESSION_NOT_FOUND","message":"Session not found"}"#
        );
    }

    #[test]
    fn test_parse_input_message() {
        let message = ControlMessage::parse(r#"{"type":"input","data":"ls\n"}"#).unwrap();
        assert_eq!(
            message,
            ControlMessage::Input {
                data: "ls\n".to_string()
            }
        );
    }

    #[test]
    fn test_parse_resize_message() {
        let message = ControlMessage::parse(r#"{"type":"resize","rows":40,"cols":120}"#).unwrap();
        assert_eq!(message, ControlMessage::Resize { rows: 40, cols: 120 });
    }

    #[test]
    fn test_parse_unknown_type() {
        let result = ControlMessage::parse(r#"{"type":"paste","data":"x"}"#);
        assert!(matches!(result, Err(ProtocolError::UnknownMessageType(t)) if t == "paste"));
    }

    #[test]
    fn test_client_input_plain_text_is_raw() {
        let input = ClientInput::from_text("echo hi\n").unwrap();
        assert_eq!(input, ClientInput::Input(b"echo hi\n".to_vec()));
    }

    #[test]
    fn test_client_input_non_control_json_is_raw() {
        let text = r#"{"hello":"world"}"#;
        let input = ClientInput::from_text(text).unwrap();
        assert_eq!(input, ClientInput::Input(text.as_bytes().to_vec()));

        let text = r#"{"type":"paste"}"#;
        let input = ClientInput::from_text(text).unwrap();
        assert_eq!(input, ClientInput::Input(text.as_bytes().to_vec()));
    }

    #[test]
    fn test_client_input_control_messages() {
        let input = ClientInput::from_text(r#"{"type":"input","data":"pwd\n"}"#).unwrap();
        assert_eq!(input, ClientInput::Input(b"pwd\n".to_vec()));

        let input = ClientInput::from_text(r#"{"type":"resize","rows":30,"cols":100}"#).unwrap();
        assert_eq!(input, ClientInput::Resize { rows: 30, cols: 100 });
    }

    #[test]
    fn test_client_input_malformed_control_is_error() {
        assert!(ClientInput::from_text(r#"{"type":"resize","rows":30}"#).is_err());
        assert!(ClientInput::from_text(r#"{"type":"resize","rows":0,"cols":80}"#).is_err());
        assert!(ClientInput::from_text(r#"{"type":"input"}"#).is_err());
    }

    #[test]
    fn test_client_input_binary_is_raw() {
        let input = ClientInput::from_binary(&[0x1b, b'[', b'A']);
        assert_eq!(input, ClientInput::Input(vec![0x1b, b'[', b'A']));
    }

    #[test]
    fn test_control_message_to_json() {
        let json = ControlMessage::Resize { rows: 40, cols: 120 }.to_json().unwrap();
        assert_eq!(json, r#"{"type":"resize","rows":40,"cols":120}"#);
    }
}
