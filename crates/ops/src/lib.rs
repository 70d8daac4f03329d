//! Zenith Ops: the single-flight session slot and local build supervision.
//!
//! A build is a child process whose stdout and stderr are pumped, line by line,
//! into one bounded channel. Slow consumers lose display lines (counted), never
//! the full capture that goes into a failure log. The `SessionSlot` is shared
//! with the remote orchestrator so local and remote sessions exclude each other.

#![forbid(unsafe_code)]

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use zenith_core::BuildOutcome;

pub mod pump;
pub mod session;
pub mod supervisor;
pub mod toolchain;

pub use pump::{truncate_line, LineFilter, LineSink, DEFAULT_LINE_MAX, DEFAULT_QUEUE_CAP};
pub use session::{ActiveSession, SessionGuard, SessionSlot};
pub use supervisor::{kill_tree, ProcessSupervisor, ANDROID_FAIL_PREFIX};
pub use toolchain::{sh_quote, CommandSpec, GradleInvocation, GradleToolchain, Launcher, Toolchain, TurboEffect, TURBO_FLAGS};

/// Result of starting a session: its live output and its single terminal value.
pub struct RunHandle<T> {
    pub session: Arc<ActiveSession>,
    pub rx: mpsc::Receiver<String>,
    pub done: oneshot::Receiver<T>,
}

/// Terminal value of a build session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub outcome: BuildOutcome,
    /// Lines the live channel dropped because the consumer lagged.
    pub dropped: u64,
}
