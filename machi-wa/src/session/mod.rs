//! Per-token sessions.
//!
//! [`SessionRegistry`] holds the token → session map, [`SessionController`]
//! drives each session through its [`SessionState`] machine, and
//! [`CredentialStore`] owns the on-disk credential directories.

pub mod controller;
pub mod registry;
pub mod state;
mod storage;

pub use controller::{ControllerOptions, SessionController};
pub use registry::{ArtifactStatus, SessionEntry, SessionInfo, SessionRegistry, Transition};
pub use state::SessionState;
pub use storage::CredentialStore;
