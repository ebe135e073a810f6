//! A server-side WebSocket endpoint: handshake validation, heartbeat
//! scheduling, and close orchestration layered over `hyper` +
//! `fastwebsockets`.
//!
//! The entry point is [`WebSocketUpgrade::from_request`], which validates
//! an incoming request as a WebSocket opening handshake and, on success,
//! returns a builder that finishes the upgrade and hands the caller a live
//! [`Endpoint`].
//!
//! ```ignore
//! let upgrade = WebSocketUpgrade::from_request(&mut req, &["chat"], true)?;
//! let response = upgrade.upgrade(|endpoint| async move {
//!     loop {
//!         match endpoint.receive().await {
//!             Ok(Message::Text(text)) => { let _ = endpoint.send_text(text, None).await; }
//!             Ok(Message::Closing) | Ok(Message::Closed) => break,
//!             Err(_) => break,
//!             _ => {}
//!         }
//!     }
//! });
//! ```

mod compression;
mod endpoint;
mod error;
mod handshake;
mod heartbeat;
mod message;
mod transport;
mod upgrade;

pub use endpoint::{Config, Endpoint};
pub use error::{BoxBody, Error, HandshakeRejection};
pub use message::{close_code, CloseFrame, Message};
pub use transport::{ClosingInjector, FramedMessageSource, FramedWriter, RawFrame, SourceItem};
pub use upgrade::WebSocketUpgrade;
