//! The heartbeat scheduler: a ping timer and a pong-deadline timer, each a
//! cancellable one-shot task. Closes the connection with an abnormal-closure
//! code once the pong deadline lapses without a reset.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// Schedules pings on an interval and a pong-receipt deadline after each one.
///
/// `Heartbeat` itself holds no state about whether a pong has arrived —
/// that bookkeeping lives on the endpoint, which calls [`Heartbeat::reset`]
/// whenever *any* frame is received, not only a pong.
pub struct Heartbeat {
	interval: Duration,
	pong_timeout: Duration,
	ping_event: Arc<Notify>,
	pong_event: Arc<Notify>,
	ping_task: Option<JoinHandle<()>>,
	pong_task: Option<JoinHandle<()>>,
}

impl Heartbeat {
	pub fn new(interval: Duration, pong_timeout: Duration) -> Self {
		Self {
			interval,
			pong_timeout,
			ping_event: Arc::new(Notify::new()),
			pong_event: Arc::new(Notify::new()),
			ping_task: None,
			pong_task: None,
		}
	}

	/// Resolves once the ping interval elapses. The driver task should send
	/// a ping and then call [`Heartbeat::arm_pong_deadline`].
	pub fn ping_event_handle(&self) -> Arc<Notify> {
		self.ping_event.clone()
	}

	/// Resolves once a pong deadline elapses without a reset. The driver
	/// task should treat this as a dead connection.
	pub fn pong_event_handle(&self) -> Arc<Notify> {
		self.pong_event.clone()
	}

	/// Arms (or re-arms) the ping timer, cancelling any timer already running.
	/// Called on construction and on every frame received while open.
	pub fn reset(&mut self) {
		if let Some(task) = self.pong_task.take() {
			task.abort();
		}

		if let Some(task) = self.ping_task.take() {
			task.abort();
		}

		if self.interval.is_zero() {
			return;
		}

		let event = self.ping_event.clone();
		let interval = self.interval;
		self.ping_task = Some(tokio::spawn(async move {
			tokio::time::sleep(interval).await;
			trace!("heartbeat ping timer fired");
			event.notify_one();
		}));
	}

	/// Called once a ping has actually been written to the wire: arms the
	/// pong deadline.
	pub fn arm_pong_deadline(&mut self) {
		if let Some(task) = self.pong_task.take() {
			task.abort();
		}

		let event = self.pong_event.clone();
		let timeout = self.pong_timeout;
		self.pong_task = Some(tokio::spawn(async move {
			tokio::time::sleep(timeout).await;
			debug!("heartbeat pong deadline elapsed");
			event.notify_one();
		}));
	}

	/// Cancels both timers; called once the endpoint starts closing.
	pub fn cancel(&mut self) {
		if let Some(task) = self.pong_task.take() {
			task.abort();
		}
		if let Some(task) = self.ping_task.take() {
			task.abort();
		}
	}
}

impl Drop for Heartbeat {
	fn drop(&mut self) {
		self.cancel();
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use futures_util::FutureExt;

	#[tokio::test(start_paused = true)]
	async fn ping_timer_fires_after_interval() {
		let mut heartbeat = Heartbeat::new(Duration::from_secs(5), Duration::from_secs(2));
		let event = heartbeat.ping_event_handle();
		heartbeat.reset();

		tokio::time::advance(Duration::from_secs(5)).await;
		event.notified().await;
	}

	#[tokio::test(start_paused = true)]
	async fn pong_deadline_fires_after_ping() {
		let mut heartbeat = Heartbeat::new(Duration::from_secs(5), Duration::from_secs(2));
		let event = heartbeat.pong_event_handle();
		heartbeat.arm_pong_deadline();

		tokio::time::advance(Duration::from_secs(2)).await;
		event.notified().await;
	}

	#[tokio::test]
	async fn zero_interval_disables_ping_timer() {
		let mut heartbeat = Heartbeat::new(Duration::ZERO, Duration::from_secs(2));
		heartbeat.reset();
		assert!(heartbeat.ping_task.is_none());
	}

	#[tokio::test(start_paused = true)]
	async fn reset_cancels_a_pending_pong_deadline() {
		let mut heartbeat = Heartbeat::new(Duration::from_secs(5), Duration::from_secs(2));
		let pong_event = heartbeat.pong_event_handle();
		heartbeat.arm_pong_deadline();
		heartbeat.reset();

		tokio::time::advance(Duration::from_secs(2)).await;
		assert!(pong_event.notified().now_or_never().is_none());
	}
}
