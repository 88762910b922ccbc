use crate::log::Ledger;
use crate::protos::*;

/// Wraps a value that must not be released until the node's metadata has been made
/// durable. There is no way to generically verify that the host really persisted it, so
/// this is a self-check that makes the obligation explicit at the type level.
pub struct MustPersistMetadata<T> {
	inner: T,
}

impl<T> MustPersistMetadata<T> {
	pub fn new(inner: T) -> Self {
		MustPersistMetadata { inner }
	}

	pub fn persisted(self) -> T {
		self.inner
	}
}

/// Wraps a response that is only valid once the local ledger durably contains the given
/// position. With a ledger whose append is durable-before-return this resolves
/// immediately, but the constraint keeps the contract visible if appends ever become
/// deferred.
pub struct MatchConstraint<T> {
	inner: T,
	pos: LogPosition,
}

impl<T> MatchConstraint<T> {
	pub fn new(inner: T, pos: LogPosition) -> Self {
		MatchConstraint { inner, pos }
	}

	pub fn position(&self) -> LogPosition {
		self.pos
	}

	/// Resolves to the inner value if the ledger has durably reached the position,
	/// otherwise hands the constraint back
	pub fn poll(self, ledger: &dyn Ledger) -> std::result::Result<T, MatchConstraint<T>> {
		if self.pos.index == 0 {
			return Ok(self.inner);
		}

		if ledger.last_index() >= self.pos.index && ledger.term_at(self.pos.index) == Some(self.pos.term)
		{
			Ok(self.inner)
		} else {
			Err(self)
		}
	}
}

impl<T> From<T> for MatchConstraint<T> {
	fn from(inner: T) -> Self {
		MatchConstraint::new(inner, LogPosition { term: 0, index: 0 })
	}
}
