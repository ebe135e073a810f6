//! The message type exchanged with `Endpoint::receive`/`send`.
//
// A plain `u16` close code (rather than an enum of named codes) plus the
// `Closing`/`Closed`/`Error` sentinel variants a receive/close rendezvous
// needs beyond a bare wire-level message.

use bytes::Bytes;

use crate::error::Error;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// A close frame payload: a status code and an optional UTF-8 reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
	pub code: u16,
	pub reason: String,
}

/// A message delivered to or accepted from the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
	/// A text message.
	Text(String),
	/// A binary message.
	Binary(Vec<u8>),
	/// A ping control frame (payload must be at most 125 bytes).
	Ping(Bytes),
	/// A pong control frame (payload must be at most 125 bytes).
	Pong(Bytes),
	/// A close frame, sent or received.
	Close(Option<CloseFrame>),
	/// Synthetic sentinel returned by `receive()` once the close orchestrator
	/// has observed (or initiated) the peer's close handshake but the
	/// endpoint has not fully closed yet. Never sent on the wire.
	Closing,
	/// Synthetic sentinel returned once the endpoint is fully closed.
	/// Never sent on the wire.
	Closed,
	/// A captured, non-fatal error observed while receiving. The caller sees
	/// a value, not a raised exception.
	Error(std::sync::Arc<Error>),
}

impl Message {
	/// `true` for the sentinels that end the iteration contract.
	pub fn is_terminal(&self) -> bool {
		matches!(self, Message::Close(_) | Message::Closing | Message::Closed)
	}

	/// Consumes a `Text` message, rejecting anything else with `WrongMessageType`.
	pub fn into_text(self) -> Result<String, Error> {
		match self {
			Message::Text(text) => Ok(text),
			_ => Err(Error::WrongMessageType),
		}
	}

	/// Consumes a `Binary` message, rejecting anything else with `WrongMessageType`.
	pub fn into_binary(self) -> Result<Vec<u8>, Error> {
		match self {
			Message::Binary(data) => Ok(data),
			_ => Err(Error::WrongMessageType),
		}
	}
}

// --------------------------------------------------------------------------------
// close_code

/// Constants for well-known WebSocket close codes (RFC 6455 §7.4).
pub mod close_code {
	/// Normal closure.
	pub const NORMAL: u16 = 1000;
	/// Endpoint going away.
	pub const AWAY: u16 = 1001;
	/// Protocol error.
	pub const PROTOCOL: u16 = 1002;
	/// Unsupported data.
	pub const UNSUPPORTED: u16 = 1003;
	/// No status code was present in the close frame.
	pub const NO_STATUS: u16 = 1005;
	/// Abnormal closure: timeout, cancellation, or transport loss.
	pub const ABNORMAL: u16 = 1006;
	/// Invalid frame payload data.
	pub const INVALID_PAYLOAD: u16 = 1007;
	/// Policy violation.
	pub const POLICY: u16 = 1008;
	/// Message too big.
	pub const TOO_BIG: u16 = 1009;
	/// Mandatory extension missing.
	pub const MANDATORY_EXTENSION: u16 = 1010;
	/// Internal server error.
	pub const INTERNAL_ERROR: u16 = 1011;
}

// --------------------------------------------------------------------------------
