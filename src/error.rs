//! The unified error taxonomy for the endpoint.

// ----------

use bytes::Bytes;
use http::{Response, StatusCode};
use http_body_util::{BodyExt, Empty, Full};

pub(crate) use thiserror::Error as ImplError;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// The box body used for handshake rejection responses.
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, std::convert::Infallible>;

fn boxed(body: impl Into<Bytes>) -> BoxBody {
	Full::new(body.into()).map_err(|never| match never {}).boxed()
}

pub(crate) fn empty_boxed() -> BoxBody {
	Empty::new().map_err(|never| match never {}).boxed()
}

// --------------------------------------------------------------------------------
// HandshakeRejection

/// Why the opening handshake failed.
#[derive(Debug, ImplError)]
pub enum HandshakeRejection {
	/// The request method was not `GET`.
	#[error("request method must be GET")]
	MethodNotGet,
	/// `Connection` header did not contain the `upgrade` token.
	#[error("`Connection` header did not include 'upgrade'")]
	InvalidConnectionHeader,
	/// `Upgrade` header was not `websocket`.
	#[error("`Upgrade` header did not include 'websocket'")]
	InvalidUpgradeHeader,
	/// `Sec-WebSocket-Version` was not one of 13, 8, 7.
	#[error("unsupported Sec-WebSocket-Version")]
	UnsupportedVersion,
	/// `Sec-WebSocket-Key` was missing or did not decode to 16 bytes.
	#[error("invalid Sec-WebSocket-Key")]
	InvalidKey,
	/// The connection could not be upgraded (e.g. no `OnUpgrade` extension present).
	#[error("connection is not upgradable")]
	ConnectionNotUpgradable,
}

impl HandshakeRejection {
	/// The HTTP status this rejection should be reported with.
	pub fn status(&self) -> StatusCode {
		match self {
			Self::MethodNotGet => StatusCode::METHOD_NOT_ALLOWED,
			Self::InvalidConnectionHeader
			| Self::InvalidUpgradeHeader
			| Self::UnsupportedVersion
			| Self::InvalidKey => StatusCode::BAD_REQUEST,
			Self::ConnectionNotUpgradable => StatusCode::UPGRADE_REQUIRED,
		}
	}

	/// Turns the rejection into the HTTP response the caller should send back.
	///
	/// This never transitions an endpoint into the Open state.
	pub fn into_response(self) -> Response<BoxBody> {
		let status = self.status();
		let mut builder = Response::builder().status(status);

		if matches!(self, Self::MethodNotGet) {
			builder = builder.header(http::header::ALLOW, "GET");
		}

		builder
			.body(boxed(self.to_string()))
			.expect("status and header values are always valid")
	}
}

// --------------------------------------------------------------------------------
// Error

/// Errors observable once the endpoint has moved past the handshake.
///
/// Covers the handshake validator, heartbeat scheduler, write surface,
/// receive coordinator, and close orchestrator.
#[derive(Debug, ImplError)]
pub enum Error {
	/// An operation was invoked before the handshake completed.
	#[error("endpoint is not prepared: call the handshake first")]
	NotPrepared,
	/// A second `receive()` was attempted while one was already in flight.
	#[error("a receive is already in flight on this endpoint")]
	ConcurrentReceive,
	/// `receive()` was called repeatedly on an endpoint that is already closed.
	#[error("websocket connection is closed")]
	AlreadyClosed,
	/// A `receive_text`/`receive_bytes`/`receive_json` call observed the wrong message kind.
	#[error("received message of an unexpected type")]
	WrongMessageType,
	/// A heartbeat or operation deadline was exceeded.
	#[error("operation timed out")]
	Timeout,
	/// The caller's future was cancelled (dropped) while suspended.
	#[error("operation was cancelled")]
	Cancelled,
	/// The peer violated the framing protocol; carries the close code to report.
	#[error("protocol violation (close code {0})")]
	Protocol(u16),
	/// The underlying transport failed.
	#[error("transport error: {0}")]
	Transport(#[from] std::io::Error),
	/// A `fastwebsockets` framing error that doesn't map to one of the above.
	#[error("websocket framing error: {0}")]
	Framing(#[from] fastwebsockets::WebSocketError),
	/// Raw byte writes are not a thing this endpoint supports; use
	/// `send_text`/`send_binary`.
	#[error("direct write() is not supported on a WebSocket endpoint")]
	Unsupported,
	/// A `send_json`/`receive_json` call failed to encode or decode.
	#[cfg(feature = "json")]
	#[error("JSON codec error: {0}")]
	Json(#[from] serde_json::Error),
}

impl Error {
	/// The close code this error should latch onto `Endpoint::close_code`, if any.
	pub(crate) fn close_code(&self) -> Option<u16> {
		match self {
			Self::Protocol(code) => Some(*code),
			Self::Timeout | Self::Cancelled | Self::Transport(_) | Self::Framing(_) => Some(1006),
			_ => None,
		}
	}
}

// --------------------------------------------------------------------------------

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn method_not_get_responds_405_with_allow_get() {
		let response = HandshakeRejection::MethodNotGet.into_response();
		assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
		assert_eq!(response.headers().get(http::header::ALLOW).unwrap(), "GET");
	}

	#[test]
	fn invalid_key_responds_400_without_allow_header() {
		let response = HandshakeRejection::InvalidKey.into_response();
		assert_eq!(response.status(), StatusCode::BAD_REQUEST);
		assert!(response.headers().get(http::header::ALLOW).is_none());
	}

	#[test]
	fn protocol_error_latches_its_own_close_code() {
		assert_eq!(Error::Protocol(1002).close_code(), Some(1002));
	}

	#[test]
	fn timeout_and_cancelled_latch_abnormal_closure() {
		assert_eq!(Error::Timeout.close_code(), Some(1006));
		assert_eq!(Error::Cancelled.close_code(), Some(1006));
	}

	#[test]
	fn not_prepared_has_no_close_code() {
		assert_eq!(Error::NotPrepared.close_code(), None);
	}
}
