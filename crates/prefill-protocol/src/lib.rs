//! File protocol between the prefill orchestrator and the worker daemon.
//!
//! Every session owns a mailbox made of two directories that are bind-mounted
//! into the worker container:
//!
//! ```text
//! orchestrator --[cmd_<id>.json]--------------> commands/   --> worker
//! orchestrator <--[response_<id>.json]--------- responses/  <-- worker
//!              <--[auth_challenge_<id>.json]--
//!              <--[daemon_status.json]--------
//!              <--[prefill_progress.json]-----
//! ```
//!
//! One message per file, UTF-8 JSON. Field names written by the worker are
//! matched case-insensitively, see [`decode`].

pub mod commands;
pub mod decode;
pub mod files;
pub mod messages;

pub use commands::{CommandKind, CommandRequest, EncryptedCredential, PrefillOptions};
pub use decode::{from_str_ci, from_value_ci};
pub use files::ResponseFile;
pub use messages::{
    CacheInfo, CommandResponse, CredentialChallenge, CredentialType, DaemonState, DaemonStatus,
    OwnedGame, PrefillProgress, PrefillState,
};
