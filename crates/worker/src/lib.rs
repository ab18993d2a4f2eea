//! Task and mailbox primitives shared by murmur actors.
//!
//! Every task murmur starts goes through [`spawn`] or [`WorkerJoinSet`] so it
//! carries a [`TaskClass`] in traces. Process inboxes and relay queues are
//! [`Mailbox`] instances: bounded, closable from either side, with an explicit
//! overflow policy.

mod class;
mod clock;
mod join_set;
mod mailbox;
mod spawn;

pub use class::TaskClass;
pub use clock::Clock;
pub use join_set::WorkerJoinSet;
pub use mailbox::{Mailbox, MailboxPolicy, MailboxReceiver, MailboxSendError, MailboxSendOutcome, MailboxSender};
pub use spawn::spawn;
