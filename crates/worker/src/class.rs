/// Execution classes attached to every spawned murmur task for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskClass {
	/// Long-lived scope actor loops that own per-scope peer state.
	Scope,
	/// Multicast relays fanning frames out to scope peers.
	Relay,
	/// Short-lived tasks issuing a call on behalf of a caller.
	Call,
}

impl TaskClass {
	/// Stable label used in tracing fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Scope => "scope",
			Self::Relay => "relay",
			Self::Call => "call",
		}
	}
}
