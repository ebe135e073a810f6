//! The endpoint: write surface, receive coordinator, close orchestrator,
//! and state/iteration.
//!
//! Any number of cloned `Endpoint`s may call `receive()` and `close()`
//! concurrently on the same logical connection, guarded by the shared
//! `Arc<Shared>` handle underneath.
//!
//! Generic over its writer/source collaborators so a test can swap in an
//! in-memory fake for `fastwebsockets` (see the `test` module at the bottom
//! of this file); `WebSocketUpgrade::upgrade` always produces the default
//! `Endpoint<FastWebSocketWriter, FastWebSocketSource>`.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use tokio::sync::{oneshot, Mutex as TokioMutex};
use tracing::{debug, warn};

use crate::error::Error;
use crate::heartbeat::Heartbeat;
use crate::message::{close_code, CloseFrame, Message};
use crate::transport::{ClosingInjector, FastWebSocketSource, FastWebSocketWriter, FramedMessageSource, FramedWriter, RawFrame, SourceItem};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// After this many `receive()` calls on an already-closed endpoint, the
/// caller gets an error instead of a quiet `Closed` sentinel — a guard
/// against a caller that never notices the connection is gone and spins
/// forever.
const THRESHOLD_CONNLOST_ACCESS: u32 = 5;

/// Fixed, immutable-after-construction configuration, set by
/// [`crate::upgrade::WebSocketUpgrade`] once the handshake completes.
pub struct Config {
	pub selected_protocol: Option<String>,
	pub autoclose: bool,
	pub autoping: bool,
	pub close_timeout: Duration,
	pub receive_timeout: Option<Duration>,
	pub compress: bool,
}

/// Holds the `waiting` registration (Invariant 4: "non-empty only while a
/// receive is suspended on the framed-message source") for as long as it is
/// alive, and clears it unconditionally on drop — including a synchronous
/// early return from `receive()` that never actually suspends, and an
/// `.await` on the read future being cancelled by the caller dropping the
/// outer future.
struct WaitingGuard<W: FramedWriter, R: FramedMessageSource> {
	shared: Arc<Shared<W, R>>,
	_tx: oneshot::Sender<()>,
}

impl<W: FramedWriter, R: FramedMessageSource> Drop for WaitingGuard<W, R> {
	fn drop(&mut self) {
		*self.shared.waiting.lock().unwrap() = None;
	}
}

struct Shared<W: FramedWriter, R: FramedMessageSource> {
	config: Config,
	writer: TokioMutex<W>,
	source: TokioMutex<R>,
	injector: R::Injector,
	waiting: StdMutex<Option<oneshot::Receiver<()>>>,
	heartbeat: StdMutex<Heartbeat>,
	closed: AtomicBool,
	closing: AtomicBool,
	close_code: StdMutex<Option<u16>>,
	exception: StdMutex<Option<Arc<Error>>>,
	conn_lost_reads: AtomicU32,
}

/// The live, open WebSocket connection handed to application code.
///
/// Cheaply `Clone`: every clone shares the same underlying connection
/// state, which is what lets one task `receive()` while another calls
/// `close()` on the same logical connection.
pub struct Endpoint<W: FramedWriter = FastWebSocketWriter, R: FramedMessageSource = FastWebSocketSource> {
	shared: Arc<Shared<W, R>>,
	current: Option<Pin<Box<dyn Future<Output = Result<Message, Error>> + Send>>>,
}

impl<W: FramedWriter, R: FramedMessageSource> Clone for Endpoint<W, R> {
	fn clone(&self) -> Self {
		Self {
			shared: self.shared.clone(),
			current: None,
		}
	}
}

impl<W, R> Endpoint<W, R>
where
	W: FramedWriter + 'static,
	R: FramedMessageSource + 'static,
{
	pub(crate) fn new(writer: W, source: R, config: Config, heartbeat: Heartbeat) -> Self {
		let injector = source.injector();

		Self {
			shared: Arc::new(Shared {
				config,
				writer: TokioMutex::new(writer),
				source: TokioMutex::new(source),
				injector,
				waiting: StdMutex::new(None),
				heartbeat: StdMutex::new(heartbeat),
				closed: AtomicBool::new(false),
				closing: AtomicBool::new(false),
				close_code: StdMutex::new(None),
				exception: StdMutex::new(None),
				conn_lost_reads: AtomicU32::new(0),
			}),
			current: None,
		}
	}

	// ----------------------------------------
	// State accessors

	/// The subprotocol selected during the handshake, if any.
	pub fn selected_protocol(&self) -> Option<&str> {
		self.shared.config.selected_protocol.as_deref()
	}

	/// `true` once `close()` has fully completed.
	pub fn closed(&self) -> bool {
		self.shared.closed.load(Ordering::Acquire)
	}

	/// `true` once a close handshake has started (but may not have finished).
	pub fn closing(&self) -> bool {
		self.shared.closing.load(Ordering::Acquire)
	}

	/// The close code latched by whichever of `receive()`/`close()` first
	/// observed or decided one. `None` until a close has begun.
	pub fn close_code(&self) -> Option<u16> {
		*self.shared.close_code.lock().unwrap()
	}

	/// The captured, non-fatal error observed while receiving, if any.
	pub fn exception(&self) -> Option<Arc<Error>> {
		self.shared.exception.lock().unwrap().clone()
	}

	fn ensure_not_closed(&self) -> Result<(), Error> {
		if self.shared.closed.load(Ordering::Acquire) {
			Err(Error::AlreadyClosed)
		} else {
			Ok(())
		}
	}

	/// Arms the heartbeat's pong deadline; called by the heartbeat driver
	/// task right after a ping is actually written to the wire.
	pub(crate) fn arm_pong_deadline(&self) {
		self.shared.heartbeat.lock().unwrap().arm_pong_deadline();
	}

	fn latch_close_code(&self, code: u16) {
		let mut guard = self.shared.close_code.lock().unwrap();
		if guard.is_none() {
			*guard = Some(code);
		}
	}

	// ----------------------------------------
	// Write surface

	/// Sends a ping control frame.
	pub async fn ping(&self, payload: impl Into<Bytes>) -> Result<(), Error> {
		self.ensure_not_closed()?;
		self.shared.writer.lock().await.ping(payload.into()).await
	}

	/// Sends an unsolicited pong control frame.
	pub async fn pong(&self, payload: impl Into<Bytes>) -> Result<(), Error> {
		self.ensure_not_closed()?;
		self.shared.writer.lock().await.pong(payload.into()).await
	}

	/// Resolves the effective per-frame compression flag: `compress`
	/// overrides the connection's negotiated default, but neither can turn
	/// compression on when the extension was never negotiated at handshake.
	fn effective_compress(&self, compress: Option<bool>) -> bool {
		compress.unwrap_or(self.shared.config.compress) && self.shared.config.compress
	}

	/// Sends a text message. `compress` overrides the connection's
	/// negotiated per-frame compression default for this one message.
	pub async fn send_text(&self, text: impl Into<String>, compress: Option<bool>) -> Result<(), Error> {
		self.ensure_not_closed()?;
		let compress = self.effective_compress(compress);
		self
			.shared
			.writer
			.lock()
			.await
			.send(Bytes::from(text.into()), false, compress)
			.await
	}

	/// Sends a binary message. `compress` overrides the connection's
	/// negotiated per-frame compression default for this one message.
	pub async fn send_binary(&self, data: impl Into<Bytes>, compress: Option<bool>) -> Result<(), Error> {
		self.ensure_not_closed()?;
		let compress = self.effective_compress(compress);
		self.shared.writer.lock().await.send(data.into(), true, compress).await
	}

	/// Serializes `value` to JSON and sends it as a text message.
	#[cfg(feature = "json")]
	pub async fn send_json<T: serde::Serialize>(&self, value: &T, compress: Option<bool>) -> Result<(), Error> {
		let text = serde_json::to_string(value).map_err(Error::Json)?;
		self.send_text(text, compress).await
	}

	/// Always fails: raw byte writes aren't a supported operation on a
	/// message-oriented WebSocket endpoint; use
	/// `send_text`/`send_binary` instead.
	pub async fn write(&self, _data: &[u8]) -> Result<(), Error> {
		Err(Error::Unsupported)
	}

	/// Closes the connection with a normal closure code, as a convenience
	/// over `close(close_code::NORMAL, b"")`.
	pub async fn write_eof(&self) -> Result<(), Error> {
		self.close(close_code::NORMAL, b"").await;
		Ok(())
	}

	// ----------------------------------------
	// Receive coordinator

	/// Waits for the next message, applying the autoping/autoclose
	/// post-processing described below.
	///
	/// `ConcurrentReceive`/`AlreadyClosed` (a second receive in flight, or one
	/// too many calls on an already-closed endpoint) and a per-receive
	/// `Timeout` are re-raised as `Err` rather than swallowed. A protocol
	/// violation or any other error observed mid-read is instead captured
	/// into a returned `Ok(Message::Error(..))` value, with the close
	/// orchestrator already invoked by the time it comes back.
	pub async fn receive(&self) -> Result<Message, Error> {
		loop {
			let guard = self.register_waiting()?;

			if self.shared.closed.load(Ordering::Acquire) {
				drop(guard);
				let reads = self.shared.conn_lost_reads.fetch_add(1, Ordering::AcqRel) + 1;
				if reads >= THRESHOLD_CONNLOST_ACCESS {
					return Err(Error::AlreadyClosed);
				}
				return Ok(Message::Closed);
			}

			if self.shared.closing.load(Ordering::Acquire) {
				drop(guard);
				return Ok(Message::Closing);
			}

			let item = match self.read_one(guard).await {
				Ok(Some(item)) => item,
				Ok(None) => {
					self.latch_close_code(close_code::NORMAL);
					self.close(close_code::NORMAL, b"").await;
					return Ok(Message::Closed);
				}
				Err(Error::Timeout) => {
					self.latch_close_code(close_code::ABNORMAL);
					return Err(Error::Timeout);
				}
				// A framing/protocol violation carries its own close code and
				// does not latch `exception`/`closing` up front: the close it
				// triggers below still needs to run as a *locally* initiated
				// close (awaiting the peer's own CLOSE reply), since the peer
				// never initiated one itself.
				Err(Error::Protocol(code)) => {
					self.latch_close_code(code);
					let exception = Arc::new(Error::Protocol(code));
					self.close(code, b"").await;
					return Ok(Message::Error(exception));
				}
				Err(err) => {
					if let Some(code) = err.close_code() {
						self.latch_close_code(code);
					}
					let exception = Arc::new(err);
					*self.shared.exception.lock().unwrap() = Some(exception.clone());
					self.shared.closing.store(true, Ordering::Release);
					let code = self.close_code().unwrap_or(close_code::ABNORMAL);
					self.close(code, b"").await;
					return Ok(Message::Error(exception));
				}
			};

			self.shared.heartbeat.lock().unwrap().reset();

			match item {
				SourceItem::Closing => {
					self.shared.closing.store(true, Ordering::Release);
					return Ok(Message::Closing);
				}
				SourceItem::Frame(RawFrame::Close(frame)) => {
					self.shared.closing.store(true, Ordering::Release);
					let code = frame.as_ref().map(|f| f.code).unwrap_or(close_code::NO_STATUS);
					self.latch_close_code(code);
					if !self.shared.closed.load(Ordering::Acquire) && self.shared.config.autoclose {
						self.close(code, b"").await;
					}
					return Ok(Message::Close(frame));
				}
				SourceItem::Frame(RawFrame::Ping(payload)) => {
					if self.shared.config.autoping {
						let _ = self.pong(payload).await;
						continue;
					}
					return Ok(Message::Ping(payload));
				}
				SourceItem::Frame(RawFrame::Pong(payload)) => {
					if self.shared.config.autoping {
						continue;
					}
					return Ok(Message::Pong(payload));
				}
				SourceItem::Frame(RawFrame::Text(text)) => return Ok(Message::Text(text)),
				SourceItem::Frame(RawFrame::Binary(data)) => return Ok(Message::Binary(data)),
			}
		}
	}

	/// Checks for a concurrent receive and registers the close-interlock
	/// one-shot as a single atomic critical section: the check and the store
	/// happen under one lock acquisition, so two `receive()` calls racing on
	/// different OS threads of a multi-threaded runtime cannot both observe
	/// "no receive in flight" and both proceed (Invariant 2).
	fn register_waiting(&self) -> Result<WaitingGuard<W, R>, Error> {
		let mut waiting = self.shared.waiting.lock().unwrap();
		if waiting.is_some() {
			return Err(Error::ConcurrentReceive);
		}

		let (tx, rx) = oneshot::channel();
		*waiting = Some(rx);
		drop(waiting);

		Ok(WaitingGuard {
			shared: self.shared.clone(),
			_tx: tx,
		})
	}

	/// One read attempt, honoring `receive_timeout` if configured. `guard`
	/// keeps the `waiting` one-shot registered (from [`Self::register_waiting`])
	/// alive for the duration of the read; it is dropped at the end of this
	/// function regardless of how it returns (including via cancellation, if
	/// the caller's future is dropped mid-await), which both clears `waiting`
	/// and drops its sender half, waking a `close()` suspended on the
	/// corresponding receiver.
	async fn read_one(&self, guard: WaitingGuard<W, R>) -> Result<Option<SourceItem>, Error> {
		let _guard = guard;

		let read = async {
			let mut source = self.shared.source.lock().await;
			source.read().await
		};

		match self.shared.config.receive_timeout {
			Some(duration) => match tokio::time::timeout(duration, read).await {
				Ok(result) => result,
				Err(_) => Err(Error::Timeout),
			},
			None => read.await,
		}
	}

	// ----------------------------------------
	// Close orchestrator

	/// Closes the connection, sending a close frame with `code`/`reason` and
	/// waiting (up to `close_timeout`) for the peer's own close frame.
	///
	/// Idempotent: a second call returns `false` immediately. Returns `true`
	/// if this call actually performed the close.
	pub async fn close(&self, code: u16, reason: &[u8]) -> bool {
		let waiting_rx = {
			let mut guard = self.shared.waiting.lock().unwrap();
			if self.shared.closed.load(Ordering::Acquire) {
				None
			} else {
				guard.take()
			}
		};

		if let Some(rx) = waiting_rx {
			debug!("close() waking a receive() in flight");
			self.shared.injector.inject_closing();
			let _ = rx.await;
		}

		if self.shared.closed.swap(true, Ordering::AcqRel) {
			return false;
		}

		self.shared.heartbeat.lock().unwrap().cancel();

		if let Err(err) = self.shared.writer.lock().await.close(code, reason).await {
			warn!(%err, "failed to write close frame");
			self.latch_close_code(close_code::ABNORMAL);
			*self.shared.exception.lock().unwrap() = Some(Arc::new(err));
			return true;
		}

		if self.shared.closing.load(Ordering::Acquire) {
			return true;
		}

		// Exactly one framed message, per spec: anything other than a CLOSE
		// (including another data message arriving first) latches the same
		// abnormal code as a timeout, rather than being skipped in search of
		// a CLOSE.
		let close_timeout = self.shared.config.close_timeout;
		let wait_for_peer_close = async {
			let mut source = self.shared.source.lock().await;
			match source.read().await {
				Ok(Some(SourceItem::Frame(RawFrame::Close(frame)))) => frame.map(|f| f.code).unwrap_or(close_code::NO_STATUS),
				Ok(_) | Err(_) => close_code::ABNORMAL,
			}
		};

		let code = match tokio::time::timeout(close_timeout, wait_for_peer_close).await {
			Ok(code) => code,
			Err(_) => close_code::ABNORMAL,
		};
		self.latch_close_code(code);

		true
	}

	// ----------------------------------------
	// Convenience receive variants

	/// Receives and unwraps a text message, or fails with
	/// `Error::WrongMessageType` if a different message arrived.
	pub async fn receive_text(&self) -> Result<String, Arc<Error>> {
		match self.receive().await {
			Ok(Message::Text(text)) => Ok(text),
			Ok(Message::Error(err)) => Err(err),
			Ok(_) => Err(Arc::new(Error::WrongMessageType)),
			Err(err) => Err(Arc::new(err)),
		}
	}

	/// Receives and unwraps a binary message, or fails with
	/// `Error::WrongMessageType` if a different message arrived.
	pub async fn receive_binary(&self) -> Result<Vec<u8>, Arc<Error>> {
		match self.receive().await {
			Ok(Message::Binary(data)) => Ok(data),
			Ok(Message::Error(err)) => Err(err),
			Ok(_) => Err(Arc::new(Error::WrongMessageType)),
			Err(err) => Err(Arc::new(err)),
		}
	}

	/// Receives a text message and decodes it as JSON.
	#[cfg(feature = "json")]
	pub async fn receive_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, Arc<Error>> {
		let text = self.receive_text().await?;
		serde_json::from_str(&text).map_err(|err| Arc::new(Error::Json(err)))
	}
}

// --------------------------------------------------------------------------------
// Stream

impl<W, R> Stream for Endpoint<W, R>
where
	W: FramedWriter + 'static,
	R: FramedMessageSource + 'static,
{
	type Item = Result<Message, Error>;

	/// Iterates messages until a `Close`/`Closing`/`Closed` sentinel ends the
	/// stream, or a re-raised error (`ConcurrentReceive`, `AlreadyClosed`,
	/// `Timeout`) is yielded once and the stream ends on the next poll.
	fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		let this = self.get_mut();

		if this.current.is_none() {
			let endpoint = this.clone();
			this.current = Some(Box::pin(async move { endpoint.receive().await }));
		}

		let fut = this.current.as_mut().expect("just populated above");
		match fut.as_mut().poll(cx) {
			Poll::Pending => Poll::Pending,
			Poll::Ready(result) => {
				this.current = None;
				match result {
					Ok(message) if message.is_terminal() => Poll::Ready(None),
					Ok(message) => Poll::Ready(Some(Ok(message))),
					Err(err) => Poll::Ready(Some(Err(err))),
				}
			}
		}
	}
}
