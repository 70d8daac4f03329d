//! Single-flight session slot.
//!
//! At most one build (or remote reset) is live at a time. Claiming is a
//! compare-and-swap on an `ArcSwapOption`, so readers (`status`, `cancel`) never
//! wait behind a lock held by the running build.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Local};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;
use zenith_core::{BuildError, SessionKind, SessionPhase, SessionStatus};

/// The in-flight session. Mutated only by the orchestrator that claimed it.
#[derive(Debug)]
pub struct ActiveSession {
    pub id: Uuid,
    pub kind: SessionKind,
    pub started_at: DateTime<Local>,
    phase: AtomicU8,
    lines: AtomicU64,
    progress_bits: AtomicU32,
    cancel: CancellationToken,
    torn_down: CancellationToken,
}

impl ActiveSession {
    fn new(kind: SessionKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            started_at: Local::now(),
            phase: AtomicU8::new(SessionPhase::Starting as u8),
            lines: AtomicU64::new(0),
            progress_bits: AtomicU32::new(0f32.to_bits()),
            cancel: CancellationToken::new(),
            torn_down: CancellationToken::new(),
        }
    }

    pub fn phase(&self) -> SessionPhase { SessionPhase::from_u8(self.phase.load(Ordering::Acquire)) }

    pub fn set_phase(&self, phase: SessionPhase) {
        debug!(session = %self.id, phase = ?phase, "ops: session phase");
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub fn lines(&self) -> u64 { self.lines.load(Ordering::Relaxed) }

    pub(crate) fn bump_lines(&self) { self.lines.fetch_add(1, Ordering::Relaxed); }

    pub fn progress(&self) -> f32 { f32::from_bits(self.progress_bits.load(Ordering::Relaxed)) }

    /// Publish the caller-side running estimate. Lower values are ignored.
    pub fn publish_progress(&self, pct: f32) {
        let mut cur = self.progress_bits.load(Ordering::Relaxed);
        while pct > f32::from_bits(cur) {
            match self.progress_bits.compare_exchange_weak(cur, pct.to_bits(), Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Fires when the session is asked to stop.
    pub fn cancel_token(&self) -> CancellationToken { self.cancel.clone() }

    pub fn is_cancelled(&self) -> bool { self.cancel.is_cancelled() }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            id: self.id,
            kind: self.kind,
            phase: self.phase(),
            started_at: self.started_at,
            lines: self.lines(),
            progress: self.progress(),
        }
    }
}

/// Holder of the (at most one) active session.
#[derive(Debug, Default)]
pub struct SessionSlot {
    inner: ArcSwapOption<ActiveSession>,
}

impl SessionSlot {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    /// Claim the slot for a new session or fail with `AlreadyRunning`.
    pub fn claim(self: &Arc<Self>, kind: SessionKind) -> Result<SessionGuard, BuildError> {
        let session = Arc::new(ActiveSession::new(kind));
        let prev = self.inner.compare_and_swap(&None::<Arc<ActiveSession>>, Some(Arc::clone(&session)));
        if let Some(active) = &*prev {
            debug!(active = %active.id, "ops: claim rejected");
            return Err(BuildError::AlreadyRunning(active.id.to_string()));
        }
        info!(session = %session.id, kind = ?kind, "ops: session claimed");
        Ok(SessionGuard { slot: Arc::clone(self), session, done: false })
    }

    pub fn current(&self) -> Option<Arc<ActiveSession>> { self.inner.load_full() }

    pub fn is_busy(&self) -> bool { self.inner.load().is_some() }

    pub fn status(&self) -> Option<SessionStatus> { self.inner.load().as_ref().map(|s| s.status()) }

    /// Ask the active session to stop and wait until its owner has torn it down.
    /// Returns false (and does nothing) when the slot is idle.
    pub async fn cancel(&self) -> bool {
        let Some(active) = self.inner.load_full() else { return false; };
        info!(session = %active.id, "ops: cancel requested");
        active.cancel.cancel();
        active.torn_down.cancelled().await;
        true
    }

    fn release(&self, id: Uuid) {
        let cur = self.inner.load();
        if cur.as_ref().map(|s| s.id) == Some(id) {
            self.inner.compare_and_swap(&*cur, None::<Arc<ActiveSession>>);
        }
    }
}

/// Ownership of a claimed slot. Dropping it (or calling `finish`) frees the slot,
/// so every exit path, including early errors, leaves no residual lock.
#[derive(Debug)]
pub struct SessionGuard {
    slot: Arc<SessionSlot>,
    session: Arc<ActiveSession>,
    done: bool,
}

impl SessionGuard {
    pub fn session(&self) -> &Arc<ActiveSession> { &self.session }

    pub fn finish(mut self) { self.teardown(); }

    fn teardown(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.slot.release(self.session.id);
        self.session.torn_down.cancel();
        debug!(session = %self.session.id, "ops: session released");
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) { self.teardown(); }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_is_rejected_until_release() {
        let slot = SessionSlot::new();
        let g = slot.claim(SessionKind::LocalBuild).expect("first claim");
        let err = slot.claim(SessionKind::RemoteBuild).unwrap_err();
        assert_eq!(err, BuildError::AlreadyRunning(g.session().id.to_string()));
        drop(g);
        assert!(!slot.is_busy());
        assert!(slot.claim(SessionKind::RemoteBuild).is_ok());
    }

    #[tokio::test]
    async fn cancel_idle_slot_is_noop() {
        let slot = SessionSlot::new();
        for _ in 0..3 {
            assert!(!slot.cancel().await);
        }
        assert!(slot.status().is_none());
    }

    #[tokio::test]
    async fn cancel_waits_for_teardown() {
        let slot = SessionSlot::new();
        let guard = slot.claim(SessionKind::LocalBuild).unwrap();
        let token = guard.session().cancel_token();
        let owner = tokio::spawn(async move {
            token.cancelled().await;
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            guard.finish();
        });
        assert!(slot.cancel().await);
        assert!(!slot.is_busy(), "slot must be free once cancel returns");
        owner.await.unwrap();
        assert!(slot.claim(SessionKind::LocalBuild).is_ok());
    }

    #[test]
    fn published_progress_only_moves_up() {
        let slot = SessionSlot::new();
        let g = slot.claim(SessionKind::LocalBuild).unwrap();
        g.session().publish_progress(40.0);
        g.session().publish_progress(12.0);
        assert_eq!(g.session().progress(), 40.0);
        assert_eq!(slot.status().unwrap().progress, 40.0);
    }
}
