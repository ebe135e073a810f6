//! The handshake validator: a pure function from request
//! parts to either a rejection or the accepted pieces a
//! [`crate::upgrade::WebSocketUpgrade`] needs to finish the upgrade.
//!
//! Returns a rejection value instead of panicking on a non-`GET` method
//! (a `405` response, not a panic) and negotiates subprotocols/extensions
//! instead of leaving them to the caller.

use base64::prelude::*;
use http::header::{
	CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_KEY,
	SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::{HeaderMap, HeaderValue, Method};
use sha1::{Digest, Sha1};
use tracing::warn;

use crate::compression::{negotiate, Negotiated};
use crate::error::HandshakeRejection;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The result of a handshake that passed validation: everything needed to
/// build the `101 Switching Protocols` response and to configure the
/// `Endpoint` that follows it.
pub struct Accepted {
	pub accept_value: HeaderValue,
	pub selected_protocol: Option<String>,
	pub extensions_response: Option<String>,
	pub compression: Negotiated,
}

/// Runs the handshake validation rules in order, short-circuiting on the
/// first failure.
///
/// `server_protocols` lists the protocols the endpoint is willing to speak,
/// in preference order; the first one also present in the client's
/// `Sec-WebSocket-Protocol` header is selected. `compress_allowed` mirrors
/// the `WebSocketUpgrade` builder's compression toggle.
pub fn validate(
	method: &Method,
	headers: &HeaderMap,
	server_protocols: &[&str],
	compress_allowed: bool,
) -> Result<Accepted, HandshakeRejection> {
	if method != Method::GET {
		return Err(HandshakeRejection::MethodNotGet);
	}

	if !headers
		.get(UPGRADE)
		.is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"websocket"))
	{
		return Err(HandshakeRejection::InvalidUpgradeHeader);
	}

	if !headers
		.get(CONNECTION)
		.is_some_and(|value| contains_token(value.as_bytes(), b"upgrade"))
	{
		return Err(HandshakeRejection::InvalidConnectionHeader);
	}

	if !headers
		.get(SEC_WEBSOCKET_VERSION)
		.is_some_and(|value| matches!(value.as_bytes(), b"13" | b"8" | b"7"))
	{
		return Err(HandshakeRejection::UnsupportedVersion);
	}

	let key = headers
		.get(SEC_WEBSOCKET_KEY)
		.ok_or(HandshakeRejection::InvalidKey)?;
	let decoded = BASE64_STANDARD
		.decode(key.as_bytes())
		.map_err(|_| HandshakeRejection::InvalidKey)?;
	if decoded.len() != 16 {
		return Err(HandshakeRejection::InvalidKey);
	}

	let accept_value = accept_value_from(key.as_bytes());

	let selected_protocol = select_protocol(headers, server_protocols);

	let (compression, extensions_response) = negotiate(
		headers
			.get(SEC_WEBSOCKET_EXTENSIONS)
			.and_then(|value| value.to_str().ok()),
		compress_allowed,
	);

	Ok(Accepted {
		accept_value,
		selected_protocol,
		extensions_response,
		compression,
	})
}

/// Runs the handshake validator without any side effects, for callers that
/// want to know whether an upgrade would succeed (and which subprotocol it
/// would pick) before committing to one.
///
/// Returns `(false, None)` on any validation failure; the specific rejection
/// reason is discarded, matching the dry-run contract.
pub fn can_prepare(method: &Method, headers: &HeaderMap, server_protocols: &[&str]) -> (bool, Option<String>) {
	match validate(method, headers, server_protocols, false) {
		Ok(accepted) => (true, accepted.selected_protocol),
		Err(_) => (false, None),
	}
}

fn contains_token(header_value: &[u8], token: &[u8]) -> bool {
	std::str::from_utf8(header_value)
		.map(|value| {
			value
				.split(',')
				.any(|part| part.trim().as_bytes().eq_ignore_ascii_case(token))
		})
		.unwrap_or(false)
}

fn select_protocol(headers: &HeaderMap, server_protocols: &[&str]) -> Option<String> {
	if server_protocols.is_empty() {
		return None;
	}

	let offered = headers.get(SEC_WEBSOCKET_PROTOCOL)?.to_str().ok()?;
	let offered: Vec<&str> = offered.split(',').map(str::trim).collect();

	// Client order wins: the first value the client offered that the server
	// also lists, not the server's own preference order.
	let selected = offered
		.iter()
		.find(|o| server_protocols.iter().any(|candidate| candidate.eq_ignore_ascii_case(o)))
		.map(|o| o.to_string());

	if selected.is_none() {
		warn!(offered = ?offered, server = ?server_protocols, "no overlapping WebSocket subprotocol");
	}

	selected
}

fn accept_value_from(key: &[u8]) -> HeaderValue {
	let mut sha1 = Sha1::new();
	sha1.update(key);
	sha1.update(GUID.as_bytes());

	let encoded = BASE64_STANDARD.encode(sha1.finalize());
	HeaderValue::try_from(encoded).expect("base64 output is always a valid header value")
}
