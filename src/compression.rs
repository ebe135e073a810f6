//! permessage-deflate negotiation (RFC 7692) and the per-message transform.
//!
//! Built on `flate2`'s streaming `Compress`/`Decompress` API.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// The negotiated permessage-deflate parameters, or `None` if compression was
/// not requested, not offered, or the extension header failed to parse.
#[derive(Debug, Clone, Copy, Default)]
pub struct Negotiated {
	pub enabled: bool,
	pub no_context_takeover: bool,
}

/// Parses `Sec-WebSocket-Extensions` looking for `permessage-deflate`.
///
/// Parse errors silently disable compression rather than failing the
/// handshake.
pub fn negotiate(extensions_header: Option<&str>, compress_allowed: bool) -> (Negotiated, Option<String>) {
	if !compress_allowed {
		return (Negotiated::default(), None);
	}

	let Some(header) = extensions_header else {
		return (Negotiated::default(), None);
	};

	for offer in header.split(',') {
		let mut params = offer.split(';').map(str::trim);
		let Some(name) = params.next() else { continue };
		if name != "permessage-deflate" {
			continue;
		}

		let mut no_context_takeover = false;
		for param in params {
			match param {
				"server_no_context_takeover" | "client_no_context_takeover" => {
					no_context_takeover = true;
				}
				// Window-bit parameters are accepted but not separately honored; we
				// always use the default deflate window.
				_ => {}
			}
		}

		let response_value = if no_context_takeover {
			"permessage-deflate; server_no_context_takeover".to_string()
		} else {
			"permessage-deflate".to_string()
		};

		return (
			Negotiated {
				enabled: true,
				no_context_takeover,
			},
			Some(response_value),
		);
	}

	(Negotiated::default(), None)
}

// --------------------------------------------------------------------------------
// PerMessageDeflate

/// Holds the (optionally context-preserving) compress/decompress streams for
/// one direction of one connection.
pub struct PerMessageDeflate {
	no_context_takeover: bool,
	compress: Compress,
	decompress: Decompress,
}

// The four octets stripped from (and re-appended to, on decode) a deflated
// WebSocket message per RFC 7692 §7.2.1.
const TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

impl PerMessageDeflate {
	pub fn new(no_context_takeover: bool) -> Self {
		Self {
			no_context_takeover,
			compress: Compress::new(Compression::default(), false),
			decompress: Decompress::new(false),
		}
	}

	/// Compresses one message payload, stripping the trailing sync-flush
	/// marker as RFC 7692 requires.
	pub fn deflate(&mut self, data: &[u8]) -> Vec<u8> {
		let mut out = Vec::with_capacity(data.len());
		let _ = self
			.compress
			.compress_vec(data, &mut out, FlushCompress::Sync)
			.expect("in-memory deflate cannot fail");

		if out.ends_with(&TAIL) {
			out.truncate(out.len() - TAIL.len());
		}

		if self.no_context_takeover {
			self.compress.reset();
		}

		out
	}

	/// Decompresses one message payload, re-appending the sync-flush marker
	/// the sender stripped.
	pub fn inflate(&mut self, data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
		let mut input = Vec::with_capacity(data.len() + TAIL.len());
		input.extend_from_slice(data);
		input.extend_from_slice(&TAIL);

		let total_in_start = self.decompress.total_in();
		let mut out = Vec::with_capacity(data.len() * 2);
		loop {
			let consumed_before = self.decompress.total_in() - total_in_start;
			let produced_before = out.len();

			let status = self
				.decompress
				.decompress_vec(&input[consumed_before as usize..], &mut out, FlushDecompress::Sync)
				.map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

			let consumed_now = self.decompress.total_in() - total_in_start - consumed_before;
			let produced_now = out.len() - produced_before;

			if status == Status::StreamEnd || (consumed_now == 0 && produced_now == 0) {
				break;
			}
		}

		if self.no_context_takeover {
			self.decompress.reset(false);
		}

		Ok(out)
	}
}

// --------------------------------------------------------------------------------

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn negotiates_plain_permessage_deflate() {
		let (negotiated, response) = negotiate(Some("permessage-deflate"), true);

		assert!(negotiated.enabled);
		assert!(!negotiated.no_context_takeover);
		assert_eq!(response.as_deref(), Some("permessage-deflate"));
	}

	#[test]
	fn negotiates_no_context_takeover_parameter() {
		let (negotiated, response) = negotiate(Some("permessage-deflate; client_no_context_takeover"), true);

		assert!(negotiated.enabled);
		assert!(negotiated.no_context_takeover);
		assert_eq!(response.as_deref(), Some("permessage-deflate; server_no_context_takeover"));
	}

	#[test]
	fn picks_permessage_deflate_among_other_offers() {
		let (negotiated, _) = negotiate(Some("foo-ext, permessage-deflate; server_no_context_takeover, bar-ext"), true);

		assert!(negotiated.enabled);
		assert!(negotiated.no_context_takeover);
	}

	#[test]
	fn disabled_when_not_offered() {
		let (negotiated, response) = negotiate(Some("foo-ext"), true);

		assert!(!negotiated.enabled);
		assert!(response.is_none());
	}

	#[test]
	fn disabled_when_no_header_present() {
		let (negotiated, response) = negotiate(None, true);

		assert!(!negotiated.enabled);
		assert!(response.is_none());
	}

	#[test]
	fn disabled_when_compression_not_allowed_even_if_offered() {
		let (negotiated, response) = negotiate(Some("permessage-deflate"), false);

		assert!(!negotiated.enabled);
		assert!(response.is_none());
	}

	#[test]
	fn deflate_then_inflate_round_trips() {
		let mut sender = PerMessageDeflate::new(false);
		let mut receiver = PerMessageDeflate::new(false);

		let payload = b"the quick brown fox jumps over the lazy dog, repeatedly, for good measure";
		let compressed = sender.deflate(payload);
		let decompressed = receiver.inflate(&compressed).unwrap();

		assert_eq!(decompressed, payload);
	}

	#[test]
	fn round_trips_several_messages_with_context_takeover() {
		let mut sender = PerMessageDeflate::new(false);
		let mut receiver = PerMessageDeflate::new(false);

		for message in ["first message", "second, slightly longer message", "third"] {
			let compressed = sender.deflate(message.as_bytes());
			let decompressed = receiver.inflate(&compressed).unwrap();
			assert_eq!(decompressed, message.as_bytes());
		}
	}

	#[test]
	fn round_trips_with_no_context_takeover_resetting_each_message() {
		let mut sender = PerMessageDeflate::new(true);
		let mut receiver = PerMessageDeflate::new(true);

		for message in ["alpha", "beta", "gamma"] {
			let compressed = sender.deflate(message.as_bytes());
			let decompressed = receiver.inflate(&compressed).unwrap();
			assert_eq!(decompressed, message.as_bytes());
		}
	}

	#[test]
	fn deflate_strips_and_inflate_restores_the_sync_flush_tail() {
		let mut codec = PerMessageDeflate::new(false);
		let compressed = codec.deflate(b"");

		assert!(!compressed.ends_with(&TAIL));
	}
}
