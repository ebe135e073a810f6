//! The collaborator interfaces this crate treats as external, plus the
//! default adapter it ships: a `fastwebsockets`-backed pair of
//! `FragmentCollector`s over a `hyper` upgraded connection, split so a
//! heartbeat ping can be written while a `receive()` is parked waiting on
//! the next frame. A single un-split `FragmentCollector` would serialize
//! writes behind an in-flight read, which this endpoint's concurrent
//! receive/close rendezvous cannot tolerate.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use fastwebsockets::{FragmentCollector, Frame, OpCode, Payload, Role, WebSocket as FastWebSocket};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::io::{self, AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::trace;

use crate::compression::{Negotiated, PerMessageDeflate};
use crate::error::Error;
use crate::message::CloseFrame;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// A decoded wire-level frame, prior to the sentinel post-processing
/// `Endpoint::receive` performs.
#[derive(Debug)]
pub enum RawFrame {
	Text(String),
	Binary(Vec<u8>),
	Ping(Bytes),
	Pong(Bytes),
	Close(Option<CloseFrame>),
}

/// An item yielded by a [`FramedMessageSource`]: either a genuine wire frame,
/// or the synthetic "wake the reader" sentinel the close orchestrator
/// injects to interrupt a suspended read.
#[derive(Debug)]
pub enum SourceItem {
	Frame(RawFrame),
	Closing,
}

/// The write half of the framing layer.
pub trait FramedWriter: Send {
	async fn ping(&mut self, payload: Bytes) -> Result<(), Error>;
	async fn pong(&mut self, payload: Bytes) -> Result<(), Error>;
	async fn send(&mut self, payload: Bytes, binary: bool, compress: bool) -> Result<(), Error>;
	async fn close(&mut self, code: u16, reason: &[u8]) -> Result<(), Error>;
}

/// A cheaply cloneable handle capable of delivering the synthetic `Closing`
/// item to a suspended `read()`, without needing `&mut` access to the
/// source itself — this is how the close orchestrator runs from a different
/// task than the one suspended in `receive()`.
pub trait ClosingInjector: Clone + Send + Sync + 'static {
	fn inject_closing(&self);
}

/// The read half of the framing layer.
///
/// `read()` returns `Ok(None)` on end-of-stream, matching the EOF signal
/// callers rely on to detect a closed connection.
pub trait FramedMessageSource: Send {
	type Injector: ClosingInjector;

	fn injector(&self) -> Self::Injector;
	async fn read(&mut self) -> Result<Option<SourceItem>, Error>;
}

// --------------------------------------------------------------------------------
// SourceInjector

/// The concrete injector for [`FastWebSocketSource`].
#[derive(Clone)]
pub struct SourceInjector {
	tx: mpsc::UnboundedSender<()>,
}

impl ClosingInjector for SourceInjector {
	/// Delivers the synthetic `Closing` sentinel to a suspended `read()`.
	///
	/// A send failure means the source has already been dropped; there is
	/// nothing left to wake, so it is silently ignored.
	fn inject_closing(&self) {
		let _ = self.tx.send(());
	}
}

// --------------------------------------------------------------------------------
// ReadOnlyIo / WriteOnlyIo

/// Wraps the read half of a split connection so it can back a
/// `fastwebsockets` stream that only ever reads.
///
/// Writes are rejected outright. This is sound only because the
/// `FragmentCollector` built over it has `auto_pong`/`auto_close` turned
/// off (`upgrade.rs`): nothing in this crate's usage of `read_frame` ever
/// triggers a write on this half.
struct ReadOnlyIo(ReadHalf<TokioIo<Upgraded>>);

impl AsyncRead for ReadOnlyIo {
	fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.0).poll_read(cx, buf)
	}
}

impl AsyncWrite for ReadOnlyIo {
	fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<io::Result<usize>> {
		Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "read half cannot write")))
	}

	fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Poll::Ready(Ok(()))
	}

	fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Poll::Ready(Ok(()))
	}
}

/// Wraps the write half of a split connection so it can back a
/// `fastwebsockets` stream that only ever writes. Reads never resolve,
/// which is sound for the same reason described on [`ReadOnlyIo`].
struct WriteOnlyIo(WriteHalf<TokioIo<Upgraded>>);

impl AsyncRead for WriteOnlyIo {
	fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		Poll::Pending
	}
}

impl AsyncWrite for WriteOnlyIo {
	fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		Pin::new(&mut self.0).poll_write(cx, buf)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.0).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.0).poll_shutdown(cx)
	}
}

/// Splits a freshly-upgraded connection into the two halves the writer and
/// the source each need their own `fastwebsockets` stream over.
pub(crate) fn split(upgraded: Upgraded) -> (FastWebSocket<WriteOnlyIo>, FastWebSocket<ReadOnlyIo>) {
	let (read_half, write_half) = io::split(TokioIo::new(upgraded));
	let write_ws = FastWebSocket::after_handshake(WriteOnlyIo(write_half), Role::Server);
	let read_ws = FastWebSocket::after_handshake(ReadOnlyIo(read_half), Role::Server);
	(write_ws, read_ws)
}

// --------------------------------------------------------------------------------
// FastWebSocketWriter

/// The default [`FramedWriter`], built on `fastwebsockets`.
///
/// Permessage-deflate is negotiated at the handshake (`handshake.rs`,
/// `compression::negotiate`); when the extension was accepted, `send()`
/// deflates the payload through a connection-local [`PerMessageDeflate`] and
/// marks the frame with RSV1, matching RFC 7692 §6.
pub struct FastWebSocketWriter {
	inner: FragmentCollector<WriteOnlyIo>,
	compression: Option<PerMessageDeflate>,
}

impl FastWebSocketWriter {
	pub(crate) fn new(inner: FragmentCollector<WriteOnlyIo>, negotiated: Negotiated) -> Self {
		Self {
			inner,
			compression: negotiated.enabled.then(|| PerMessageDeflate::new(negotiated.no_context_takeover)),
		}
	}
}

impl FramedWriter for FastWebSocketWriter {
	async fn ping(&mut self, payload: Bytes) -> Result<(), Error> {
		let frame = Frame::new(true, OpCode::Ping, None, Payload::Owned(payload.to_vec()));
		self.inner.write_frame(frame).await?;
		Ok(())
	}

	async fn pong(&mut self, payload: Bytes) -> Result<(), Error> {
		let frame = Frame::pong(Payload::Owned(payload.to_vec()));
		self.inner.write_frame(frame).await?;
		Ok(())
	}

	async fn send(&mut self, payload: Bytes, binary: bool, compress: bool) -> Result<(), Error> {
		let opcode = if binary { OpCode::Binary } else { OpCode::Text };

		let mut frame = match (compress, self.compression.as_mut()) {
			(true, Some(codec)) => {
				let deflated = codec.deflate(&payload);
				Frame::new(true, opcode, None, Payload::Owned(deflated))
			}
			_ => Frame::new(true, opcode, None, Payload::Owned(payload.to_vec())),
		};
		frame.rsv1 = compress && self.compression.is_some();

		self.inner.write_frame(frame).await?;
		Ok(())
	}

	async fn close(&mut self, code: u16, reason: &[u8]) -> Result<(), Error> {
		let frame = Frame::close(code, reason);
		self.inner.write_frame(frame).await?;
		Ok(())
	}
}

// --------------------------------------------------------------------------------
// FastWebSocketSource

/// The default [`FramedMessageSource`], built on `fastwebsockets`.
///
/// When the extension was negotiated, a frame arriving with RSV1 set is
/// inflated through a connection-local [`PerMessageDeflate`] before its
/// payload is interpreted as text or binary. A peer setting RSV1 without the
/// extension ever having been negotiated is a protocol violation.
pub struct FastWebSocketSource {
	inner: FragmentCollector<ReadOnlyIo>,
	injected_tx: mpsc::UnboundedSender<()>,
	injected_rx: mpsc::UnboundedReceiver<()>,
	compression: Option<PerMessageDeflate>,
}

impl FastWebSocketSource {
	pub(crate) fn new(inner: FragmentCollector<ReadOnlyIo>, negotiated: Negotiated) -> Self {
		let (injected_tx, injected_rx) = mpsc::unbounded_channel();
		Self {
			inner,
			injected_tx,
			injected_rx,
			compression: negotiated.enabled.then(|| PerMessageDeflate::new(negotiated.no_context_takeover)),
		}
	}

	/// Inflates `payload` when `rsv1` marks it as compressed. A peer that sets
	/// RSV1 when the extension was never negotiated is rejected as a protocol
	/// violation rather than silently treated as plain.
	fn decode_payload(&mut self, rsv1: bool, payload: Vec<u8>) -> Result<Vec<u8>, Error> {
		if !rsv1 {
			return Ok(payload);
		}

		let codec = self
			.compression
			.as_mut()
			.ok_or(Error::Protocol(crate::message::close_code::PROTOCOL))?;

		codec
			.inflate(&payload)
			.map_err(|_| Error::Protocol(crate::message::close_code::PROTOCOL))
	}
}

impl FramedMessageSource for FastWebSocketSource {
	type Injector = SourceInjector;

	fn injector(&self) -> Self::Injector {
		SourceInjector {
			tx: self.injected_tx.clone(),
		}
	}

	async fn read(&mut self) -> Result<Option<SourceItem>, Error> {
		tokio::select! {
			biased;

			injected = self.injected_rx.recv() => {
				if injected.is_some() {
					trace!("delivering injected CLOSING sentinel to suspended receive");
					Ok(Some(SourceItem::Closing))
				} else {
					Ok(None)
				}
			}

			frame = self.inner.read_frame() => {
				let frame = match frame {
					Ok(frame) => frame,
					Err(fastwebsockets::WebSocketError::ConnectionClosed) => return Ok(None),
					Err(err) => return Err(err.into()),
				};

				let raw = match frame.opcode {
					OpCode::Text => {
						let bytes = self.decode_payload(frame.rsv1, frame.payload.to_vec())?;
						let text = String::from_utf8(bytes)
							.map_err(|_| Error::Protocol(crate::message::close_code::INVALID_PAYLOAD))?;
						RawFrame::Text(text)
					}
					OpCode::Binary => {
						let bytes = self.decode_payload(frame.rsv1, frame.payload.to_vec())?;
						RawFrame::Binary(bytes)
					}
					OpCode::Ping => RawFrame::Ping(Bytes::from(frame.payload.to_vec())),
					OpCode::Pong => RawFrame::Pong(Bytes::from(frame.payload.to_vec())),
					OpCode::Close => {
						let payload = frame.payload.to_vec();
						if payload.len() >= 2 {
							let code = u16::from_be_bytes([payload[0], payload[1]]);
							let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
							RawFrame::Close(Some(CloseFrame { code, reason }))
						} else {
							RawFrame::Close(None)
						}
					}
					OpCode::Continuation => {
						return Err(Error::Protocol(crate::message::close_code::PROTOCOL));
					}
				};

				Ok(Some(SourceItem::Frame(raw)))
			}
		}
	}
}
