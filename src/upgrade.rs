//! The hyper-request-to-`Endpoint` upgrade entry point: a builder that runs
//! the handshake validator up front, then a `.upgrade(callback)` call that
//! finishes the connection upgrade and hands the caller a live `Endpoint`.
//! Carries the endpoint's full configuration surface (autoclose, autoping,
//! timeouts, heartbeat) in addition to the framing-layer toggles.

use std::future::Future;
use std::time::Duration;

use fastwebsockets::FragmentCollector;
use http::header::{CONNECTION, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_PROTOCOL, UPGRADE};
use http::{HeaderValue, Request, Response, StatusCode};
use hyper::upgrade::OnUpgrade;
use tracing::warn;

use crate::compression::Negotiated;
use crate::endpoint::{Config, Endpoint};
use crate::error::{BoxBody, HandshakeRejection};
use crate::handshake;
use crate::heartbeat::Heartbeat;
use crate::transport::{self, FastWebSocketSource, FastWebSocketWriter};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

const DEFAULT_MESSAGE_SIZE_LIMIT: usize = 4 * 1024 * 1024;
const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// A pending WebSocket upgrade: the result of a successful handshake,
/// configurable before the upgrade actually runs.
pub struct WebSocketUpgrade {
	response: Response<BoxBody>,
	on_upgrade: OnUpgrade,
	selected_protocol: Option<String>,
	compression: Negotiated,
	message_size_limit: usize,
	auto_unmasking: bool,
	autoclose: bool,
	autoping: bool,
	close_timeout: Duration,
	receive_timeout: Option<Duration>,
	heartbeat_interval: Duration,
	heartbeat_pong_timeout: Duration,
}

impl WebSocketUpgrade {
	/// Runs the handshake validator against `req` without building a response
	/// or removing its `OnUpgrade` extension — useful for routing decisions
	/// that need to know whether an upgrade would succeed before committing
	/// to one. Returns `(false, None)` on any validation failure.
	pub fn can_prepare<B>(req: &Request<B>, protocols: &[&str]) -> (bool, Option<String>) {
		handshake::can_prepare(req.method(), req.headers(), protocols)
	}

	/// Runs the handshake validator against `req` and, on
	/// success, removes the request's `OnUpgrade` extension so the caller's
	/// HTTP server can hand the connection over once the response is sent.
	///
	/// `protocols` lists the subprotocols this endpoint is willing to speak,
	/// in preference order. `compress_allowed` toggles whether
	/// permessage-deflate may be negotiated at all.
	pub fn from_request<B>(
		req: &mut Request<B>,
		protocols: &[&str],
		compress_allowed: bool,
	) -> Result<Self, HandshakeRejection> {
		let accepted = handshake::validate(req.method(), req.headers(), protocols, compress_allowed)?;

		let on_upgrade = req
			.extensions_mut()
			.remove::<OnUpgrade>()
			.ok_or(HandshakeRejection::ConnectionNotUpgradable)?;

		let mut builder = Response::builder()
			.status(StatusCode::SWITCHING_PROTOCOLS)
			.header(CONNECTION, HeaderValue::from_static("upgrade"))
			.header(UPGRADE, HeaderValue::from_static("websocket"))
			.header(http::header::SEC_WEBSOCKET_ACCEPT, accepted.accept_value.clone());

		if let Some(protocol) = &accepted.selected_protocol {
			builder = builder.header(
				SEC_WEBSOCKET_PROTOCOL,
				HeaderValue::from_str(protocol).expect("selected protocol came from a valid header value"),
			);
		}

		if let Some(extensions) = &accepted.extensions_response {
			builder = builder.header(
				SEC_WEBSOCKET_EXTENSIONS,
				HeaderValue::from_str(extensions).expect("extension response is always ASCII"),
			);
		}

		let response = builder
			.body(crate::error::empty_boxed())
			.expect("status and header values are always valid");

		Ok(Self {
			response,
			on_upgrade,
			selected_protocol: accepted.selected_protocol,
			compression: accepted.compression,
			message_size_limit: DEFAULT_MESSAGE_SIZE_LIMIT,
			auto_unmasking: true,
			autoclose: true,
			autoping: true,
			close_timeout: DEFAULT_CLOSE_TIMEOUT,
			receive_timeout: None,
			heartbeat_interval: Duration::ZERO,
			heartbeat_pong_timeout: DEFAULT_PONG_TIMEOUT,
		})
	}

	/// Sets the maximum size limit for a single message, forwarded directly
	/// to `fastwebsockets`, unchanged: `0` is not reinterpreted as "unlimited"
	/// by this crate.
	pub fn set_message_size_limit(mut self, limit: usize) -> Self {
		self.message_size_limit = limit;
		self
	}

	/// Turns off automatic unmasking of client frames. Only useful for
	/// testing against non-conformant peers; masking is otherwise mandatory
	/// for client-to-server frames (RFC 6455 §5.3).
	pub fn turn_off_auto_unmasking(mut self) -> Self {
		self.auto_unmasking = false;
		self
	}

	/// Disables automatically answering a peer `Close` frame with our own.
	pub fn turn_off_autoclose(mut self) -> Self {
		self.autoclose = false;
		self
	}

	/// Disables automatically answering `Ping`/swallowing `Pong` frames.
	pub fn turn_off_autoping(mut self) -> Self {
		self.autoping = false;
		self
	}

	/// How long `close()` waits for the peer's own close frame before giving
	/// up and latching an abnormal-closure code.
	pub fn set_close_timeout(mut self, timeout: Duration) -> Self {
		self.close_timeout = timeout;
		self
	}

	/// The default timeout applied to every `receive()` call, unless
	/// overridden per call. `None` (the default) means no timeout.
	pub fn set_receive_timeout(mut self, timeout: Option<Duration>) -> Self {
		self.receive_timeout = timeout;
		self
	}

	/// Enables the heartbeat scheduler: ping every `interval`, and treat a
	/// missing pong within half of `interval` as a dead connection.
	pub fn set_heartbeat(mut self, interval: Duration) -> Self {
		self.heartbeat_interval = interval;
		self.heartbeat_pong_timeout = interval / 2;
		self
	}

	/// The `101 Switching Protocols` response that must be sent back to the
	/// client; building it does not yet transition the endpoint into the
	/// Open state.
	pub fn response(&self) -> &Response<BoxBody> {
		&self.response
	}

	/// Performs the upgrade: spawns a task that waits for the underlying
	/// connection to actually upgrade, builds the `Endpoint`, starts its
	/// heartbeat driver, and calls `handle` with the result. Returns the
	/// `101` response immediately so the caller can send it without waiting.
	pub fn upgrade<Func, Fut>(self, handle: Func) -> Response<BoxBody>
	where
		Func: FnOnce(Endpoint) -> Fut + Send + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		let Self {
			response,
			on_upgrade,
			selected_protocol,
			compression,
			message_size_limit,
			auto_unmasking,
			autoclose,
			autoping,
			close_timeout,
			receive_timeout,
			heartbeat_interval,
			heartbeat_pong_timeout,
		} = self;

		tokio::spawn(async move {
			let upgraded = match on_upgrade.await {
				Ok(upgraded) => upgraded,
				Err(err) => {
					warn!(%err, "hyper connection upgrade failed");
					return;
				}
			};

			let (mut write_ws, mut read_ws) = transport::split(upgraded);

			write_ws.set_max_message_size(message_size_limit);
			write_ws.set_auto_apply_mask(auto_unmasking);
			write_ws.set_auto_pong(false);
			write_ws.set_auto_close(false);

			read_ws.set_max_message_size(message_size_limit);
			read_ws.set_auto_apply_mask(auto_unmasking);
			read_ws.set_auto_pong(false);
			read_ws.set_auto_close(false);

			let writer = FastWebSocketWriter::new(FragmentCollector::new(write_ws), compression);
			let source = FastWebSocketSource::new(FragmentCollector::new(read_ws), compression);

			let mut heartbeat = Heartbeat::new(heartbeat_interval, heartbeat_pong_timeout);
			let ping_event = heartbeat.ping_event_handle();
			let pong_event = heartbeat.pong_event_handle();
			heartbeat.reset();

			let config = Config {
				selected_protocol,
				autoclose,
				autoping,
				close_timeout,
				receive_timeout,
				compress: compression.enabled,
			};

			let endpoint = Endpoint::new(writer, source, config, heartbeat);

			tokio::spawn(drive_heartbeat(endpoint.clone(), ping_event, pong_event));

			handle(endpoint).await;
		});

		response
	}
}

/// Fire-and-forget ping dispatch plus the pong-deadline watchdog.
///
/// The ping write runs as a detached task: a slow or failing write must
/// never stall this driver loop, since the loop is also what arms the next
/// pong deadline and watches for the heartbeat timeout. The deadline is
/// armed unconditionally and synchronously on the `ping_event` branch,
/// before the write is even dispatched, so a ping that never completes
/// still gets a deadline watching it the same as one that succeeds
/// instantly. A missed pong closes the connection with an abnormal-closure
/// code.
async fn drive_heartbeat<W, R>(
	endpoint: Endpoint<W, R>,
	ping_event: std::sync::Arc<tokio::sync::Notify>,
	pong_event: std::sync::Arc<tokio::sync::Notify>,
) where
	W: crate::transport::FramedWriter + 'static,
	R: crate::transport::FramedMessageSource + 'static,
{
	loop {
		tokio::select! {
			_ = ping_event.notified() => {
				if endpoint.closed() {
					return;
				}
				endpoint.arm_pong_deadline();
				let ping_endpoint = endpoint.clone();
				tokio::spawn(async move {
					if let Err(err) = ping_endpoint.ping(&b""[..]).await {
						warn!(%err, "heartbeat ping write failed");
					}
				});
			}
			_ = pong_event.notified() => {
				if endpoint.closed() {
					return;
				}
				warn!("no pong within heartbeat deadline, closing");
				endpoint.close(crate::message::close_code::ABNORMAL, b"heartbeat timeout").await;
				return;
			}
		}
	}
}

#[cfg(test)]
mod test {
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;

	use bytes::Bytes;
	use tokio::sync::Notify;

	use super::drive_heartbeat;
	use crate::endpoint::{Config, Endpoint};
	use crate::error::Error;
	use crate::heartbeat::Heartbeat;
	use crate::transport::{ClosingInjector, FramedMessageSource, FramedWriter, SourceItem};

	fn write_failed() -> Error {
		Error::Transport(std::io::Error::new(std::io::ErrorKind::Other, "write failed"))
	}

	/// A writer whose every `send`/`ping` fails, so the driver's fire-and-forget
	/// ping task always observes an error.
	struct FailingPingWriter {
		pings: Arc<AtomicUsize>,
	}

	impl FramedWriter for FailingPingWriter {
		async fn ping(&mut self, _payload: Bytes) -> Result<(), Error> {
			self.pings.fetch_add(1, Ordering::SeqCst);
			Err(write_failed())
		}

		async fn pong(&mut self, _payload: Bytes) -> Result<(), Error> {
			Ok(())
		}

		async fn send(&mut self, _payload: Bytes, _binary: bool, _compress: bool) -> Result<(), Error> {
			Err(write_failed())
		}

		async fn close(&mut self, _code: u16, _reason: &[u8]) -> Result<(), Error> {
			Ok(())
		}
	}

	#[derive(Clone)]
	struct NullInjector;

	impl ClosingInjector for NullInjector {
		fn inject_closing(&self) {}
	}

	/// A source that never yields a frame; the driver test never calls
	/// `receive()`, so this only needs to satisfy the trait.
	struct NullSource;

	impl FramedMessageSource for NullSource {
		type Injector = NullInjector;

		fn injector(&self) -> Self::Injector {
			NullInjector
		}

		async fn read(&mut self) -> Result<Option<SourceItem>, Error> {
			std::future::pending().await
		}
	}

	fn make_endpoint(pings: Arc<AtomicUsize>) -> Endpoint<FailingPingWriter, NullSource> {
		let config = Config {
			selected_protocol: None,
			autoclose: true,
			autoping: true,
			close_timeout: std::time::Duration::from_millis(50),
			receive_timeout: None,
			compress: false,
		};

		Endpoint::new(
			FailingPingWriter { pings },
			NullSource,
			config,
			Heartbeat::new(std::time::Duration::ZERO, std::time::Duration::from_millis(50)),
		)
	}

	#[tokio::test]
	async fn failed_ping_does_not_end_the_heartbeat_driver() {
		let pings = Arc::new(AtomicUsize::new(0));
		let endpoint = make_endpoint(pings.clone());

		let ping_event = Arc::new(Notify::new());
		let pong_event = Arc::new(Notify::new());

		let driver = tokio::spawn(drive_heartbeat(endpoint.clone(), ping_event.clone(), pong_event.clone()));

		// First ping fails inside its detached task; the loop must still be
		// alive afterwards to arm a second deadline and notice the timeout.
		ping_event.notify_one();
		tokio::task::yield_now().await;
		tokio::task::yield_now().await;

		assert!(pings.load(Ordering::SeqCst) >= 1, "ping write should have been attempted");
		assert!(!endpoint.closed(), "a failed ping write must not close the endpoint by itself");

		pong_event.notify_one();
		driver.await.expect("heartbeat driver task panicked");

		assert!(endpoint.closed(), "missed pong after a failed ping should still close the endpoint");
		assert_eq!(
			endpoint.close_code(),
			Some(crate::message::close_code::ABNORMAL),
			"timeout after a failed ping closes with the abnormal-closure code"
		);
	}
}
