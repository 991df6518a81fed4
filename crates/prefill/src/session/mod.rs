//! Session lifecycle: one worker container per user, driven through its mailbox.

mod handlers;
pub mod models;
mod operations;
mod recovery;
mod registry;

pub use models::{BannedUser, HistoryEntry, Session, SessionRecord, SessionStatus};
pub use operations::LoginOutcome;
pub use recovery::{RecoveryReport, recover_orphans};
pub use registry::{SYSTEM_ACTOR, SessionRegistry, SweepReport};
