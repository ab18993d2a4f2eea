use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Overflow policy for a bounded mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxPolicy {
	/// Wait for capacity when full. `try_send` reports `Full` instead.
	Backpressure,
	/// Drop the newest message when full.
	DropNewest,
	/// Drop the oldest queued message when full.
	DropOldest,
}

/// Outcome from enqueueing a mailbox message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxSendOutcome {
	/// Message was enqueued without replacement.
	Enqueued,
	/// Message was dropped because policy is drop-newest and queue was full.
	DroppedNewest,
	/// Oldest queued message was evicted to make room.
	ReplacedOldest,
}

/// Mailbox send error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxSendError {
	/// Receiver is gone or the mailbox was closed.
	Closed,
	/// Queue is full and non-blocking send was used.
	Full,
}

impl std::fmt::Display for MailboxSendError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Closed => f.write_str("mailbox closed"),
			Self::Full => f.write_str("mailbox full"),
		}
	}
}

impl std::error::Error for MailboxSendError {}

struct MailboxState<T> {
	queue: VecDeque<T>,
	closed: bool,
}

struct MailboxInner<T> {
	capacity: usize,
	policy: MailboxPolicy,
	senders: AtomicUsize,
	state: Mutex<MailboxState<T>>,
	notify_recv: Notify,
	notify_send: Notify,
}

impl<T> MailboxInner<T> {
	fn close(&self) {
		self.state.lock().closed = true;
		self.notify_recv.notify_waiters();
		self.notify_send.notify_waiters();
	}
}

/// Multi-producer mailbox sender.
///
/// The mailbox closes once every sender is dropped, mirroring a tokio channel.
pub struct MailboxSender<T> {
	inner: Arc<MailboxInner<T>>,
}

/// Single-consumer mailbox receiver. Dropping it closes the mailbox.
pub struct MailboxReceiver<T> {
	inner: Arc<MailboxInner<T>>,
}

/// Bounded mailbox used for process inboxes and relay queues.
pub struct Mailbox;

impl Mailbox {
	/// Creates a bounded mailbox with one of the built-in policies.
	///
	/// # Panics
	///
	/// Panics if `capacity` is zero.
	pub fn bounded<T>(capacity: usize, policy: MailboxPolicy) -> (MailboxSender<T>, MailboxReceiver<T>) {
		assert!(capacity > 0, "mailbox capacity must be > 0");
		let inner = Arc::new(MailboxInner {
			capacity,
			policy,
			senders: AtomicUsize::new(1),
			state: Mutex::new(MailboxState {
				queue: VecDeque::with_capacity(capacity.min(64)),
				closed: false,
			}),
			notify_recv: Notify::new(),
			notify_send: Notify::new(),
		});
		(MailboxSender { inner: Arc::clone(&inner) }, MailboxReceiver { inner })
	}
}

impl<T> Clone for MailboxSender<T> {
	fn clone(&self) -> Self {
		self.inner.senders.fetch_add(1, Ordering::AcqRel);
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<T> Drop for MailboxSender<T> {
	fn drop(&mut self) {
		if self.inner.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
			self.inner.close();
		}
	}
}

impl<T> MailboxSender<T> {
	/// Closes the mailbox. The receiver drains queued items then sees `None`.
	pub fn close(&self) {
		self.inner.close();
	}

	/// Returns true once the mailbox no longer accepts messages.
	pub fn is_closed(&self) -> bool {
		self.inner.state.lock().closed
	}

	/// Non-blocking enqueue for all policies.
	pub fn try_send(&self, msg: T) -> Result<MailboxSendOutcome, MailboxSendError> {
		let mut state = self.inner.state.lock();
		enqueue_with_policy(&self.inner, &mut state, msg)
	}

	/// Enqueues past capacity regardless of policy. Only a closed mailbox refuses.
	///
	/// For messages whose loss would corrupt the receiver's view of the world,
	/// such as exit notifications.
	pub fn force_send(&self, msg: T) -> Result<MailboxSendOutcome, MailboxSendError> {
		let mut state = self.inner.state.lock();
		if state.closed {
			return Err(MailboxSendError::Closed);
		}
		state.queue.push_back(msg);
		self.inner.notify_recv.notify_one();
		Ok(MailboxSendOutcome::Enqueued)
	}

	/// Enqueue honoring policy (`Backpressure` waits for capacity).
	pub async fn send(&self, msg: T) -> Result<MailboxSendOutcome, MailboxSendError> {
		if self.inner.policy != MailboxPolicy::Backpressure {
			return self.try_send(msg);
		}

		loop {
			// Register before checking capacity so a pop between unlock and
			// await still wakes us.
			let notified = self.inner.notify_send.notified();
			{
				let mut state = self.inner.state.lock();
				if state.closed {
					return Err(MailboxSendError::Closed);
				}
				if state.queue.len() < self.inner.capacity {
					state.queue.push_back(msg);
					self.inner.notify_recv.notify_one();
					return Ok(MailboxSendOutcome::Enqueued);
				}
			}
			notified.await;
		}
	}

	/// Returns current queue length.
	pub fn len(&self) -> usize {
		self.inner.state.lock().queue.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Returns queue capacity.
	pub fn capacity(&self) -> usize {
		self.inner.capacity
	}
}

impl<T> MailboxReceiver<T> {
	/// Receives one message. Returns `None` once the mailbox is closed and drained.
	///
	/// Cancel safe: a message is only taken in the same poll that returns it.
	pub async fn recv(&mut self) -> Option<T> {
		loop {
			let notified = self.inner.notify_recv.notified();
			{
				let mut state = self.inner.state.lock();
				if let Some(msg) = state.queue.pop_front() {
					drop(state);
					self.inner.notify_send.notify_one();
					return Some(msg);
				}
				if state.closed {
					return None;
				}
			}
			notified.await;
		}
	}

	/// Takes one queued message without waiting.
	pub fn try_recv(&mut self) -> Option<T> {
		let msg = self.inner.state.lock().queue.pop_front();
		if msg.is_some() {
			self.inner.notify_send.notify_one();
		}
		msg
	}

	/// Stops accepting new messages. Already queued items stay receivable.
	pub fn close(&self) {
		self.inner.close();
	}

	/// Returns current queue length.
	pub fn len(&self) -> usize {
		self.inner.state.lock().queue.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl<T> Drop for MailboxReceiver<T> {
	fn drop(&mut self) {
		let drained = {
			let mut state = self.inner.state.lock();
			state.closed = true;
			std::mem::take(&mut state.queue)
		};
		self.inner.notify_send.notify_waiters();
		drop(drained);
	}
}

fn enqueue_with_policy<T>(inner: &MailboxInner<T>, state: &mut MailboxState<T>, msg: T) -> Result<MailboxSendOutcome, MailboxSendError> {
	if state.closed {
		return Err(MailboxSendError::Closed);
	}

	if state.queue.len() < inner.capacity {
		state.queue.push_back(msg);
		inner.notify_recv.notify_one();
		return Ok(MailboxSendOutcome::Enqueued);
	}

	match inner.policy {
		MailboxPolicy::Backpressure => Err(MailboxSendError::Full),
		MailboxPolicy::DropNewest => Ok(MailboxSendOutcome::DroppedNewest),
		MailboxPolicy::DropOldest => {
			let _ = state.queue.pop_front();
			state.queue.push_back(msg);
			inner.notify_recv.notify_one();
			Ok(MailboxSendOutcome::ReplacedOldest)
		}
	}
}
