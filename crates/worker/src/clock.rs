use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared monotonic counter handing out non-zero identifiers.
///
/// Clones observe the same sequence. Used for process ids, monitor references
/// and call request ids.
#[derive(Debug, Default, Clone)]
pub struct Clock {
	next: Arc<AtomicU64>,
}

impl Clock {
	/// Creates a clock whose first value is 1.
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the next value.
	pub fn next(&self) -> u64 {
		self.next.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
	}
}
