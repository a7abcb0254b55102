//! # ptyhub Protocol Library
//!
//! Wire types shared by the ptyhub daemon and its clients.
//!
//! ## Overview
//!
//! - **Session creation**: [`CreateSessionRequest`] / [`CreateSessionResponse`]
//!   exchanged as JSON over HTTP.
//! - **Attach stream**: clients send raw bytes or [`ControlMessage`] text
//!   frames, decoded into [`ClientInput`]; the daemon answers with raw
//!   terminal output.
//! - **Errors**: [`ErrorCode`] values carried in an [`ErrorResponse`] body,
//!   and [`ProtocolError`] for decode failures.
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ClientInput, ControlMessage};
//!
//! let frame = ControlMessage::Resize { rows: 40, cols: 120 }.to_json().unwrap();
//! let decoded = ClientInput::from_text(&frame).unwrap();
//! assert_eq!(decoded, ClientInput::Resize { rows: 40, cols: 120 });
//!
//! // Anything that is not a control message is forwarded as typed.
//! let raw = ClientInput::from_text("ls -la\n").unwrap();
//! assert_eq!(raw, ClientInput::Input(b"ls -la\n".to_vec()));
//! ```

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{
    ClientInput, CloseSessionResponse, ControlMessage, CreateSessionRequest,
    CreateSessionResponse, ErrorCode, ErrorResponse, SessionSummary, DEFAULT_COLS, DEFAULT_ROWS,
};
