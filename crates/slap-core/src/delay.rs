//! Cancellable delayed actions on the tokio timer.
//!
//! A [`DelayedAction`] runs a future after a delay unless it is cancelled
//! first. Firing and cancellation race on a single atomic transition out of
//! `Pending`; whichever wins decides whether the body runs at all.
//!
//! ```text
//! Pending ──┬──► Fired      timer elapsed first, body runs to completion
//!           └──► Cancelled  cancel() won, body is dropped unpolled
//! ```
//!
//! Cancelling after the body started does not abort it. Owners that must
//! ignore a late result keep the action in an [`ActionSlot`] and compare the
//! completing [`ActionId`] against the slot's current one.
//!
//! # Example
//!
//! ```ignore
//! use slap_core::delay::{ActionSlot, DelayedAction};
//! use std::time::Duration;
//!
//! let mut slot = ActionSlot::new();
//! slot.replace(DelayedAction::schedule_fn(Duration::from_millis(500), |id| {
//!     tracing::info!(action_id = %id, "quiet period elapsed");
//! }));
//! // A newer event supersedes the pending one.
//! slot.replace(DelayedAction::schedule_fn(Duration::from_millis(500), |_| {}));
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

static NEXT_ACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one scheduling call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId(u64);

impl ActionId {
    fn next() -> Self {
        Self(NEXT_ACTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "act-{}", self.0)
    }
}

/// Lifecycle of a delayed action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ActionPhase {
    /// Waiting for its fire time.
    Pending = 0,
    /// Timer won; the body has started or finished.
    Fired = 1,
    /// Cancelled before firing; the body never runs.
    Cancelled = 2,
}

impl ActionPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Pending,
            1 => Self::Fired,
            _ => Self::Cancelled,
        }
    }

    /// Whether no further transitions are possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for ActionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Fired => write!(f, "fired"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

struct ActionInner {
    id: ActionId,
    fire_at: Instant,
    phase: AtomicU8,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ActionInner {
    /// Leave `Pending` exactly once. Returns `false` if another transition won.
    fn leave_pending(&self, to: ActionPhase) -> bool {
        self.phase
            .compare_exchange(
                ActionPhase::Pending as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Handle to a unit of deferred work that can be superseded before it fires.
///
/// Handles are cheap to clone; every clone observes and controls the same
/// action. Dropping a handle does **not** cancel the action.
#[derive(Clone)]
pub struct DelayedAction {
    inner: Arc<ActionInner>,
}

impl DelayedAction {
    /// Schedule `body` to run after `delay`.
    ///
    /// The builder receives the action's own id so the body can later check
    /// whether it is still the current action of its owner.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<B, F>(delay: Duration, body: B) -> Self
    where
        B: FnOnce(ActionId) -> F,
        F: Future<Output = ()> + Send + 'static,
    {
        let id = ActionId::next();
        let fire_at = Instant::now() + delay;
        let inner = Arc::new(ActionInner {
            id,
            fire_at,
            phase: AtomicU8::new(ActionPhase::Pending as u8),
            task: Mutex::new(None),
        });

        let body = body(id);
        let gate = Arc::clone(&inner);
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(fire_at).await;
            if !gate.leave_pending(ActionPhase::Fired) {
                return;
            }
            drop(gate);
            trace!(action_id = %id, "delayed action fired");
            body.await;
        });

        *inner.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        trace!(
            action_id = %id,
            delay_ms = delay.as_millis() as u64,
            "delayed action scheduled"
        );

        Self { inner }
    }

    /// Schedule a plain callback to run after `delay`.
    pub fn schedule_fn<F>(delay: Duration, callback: F) -> Self
    where
        F: FnOnce(ActionId) + Send + 'static,
    {
        Self::schedule(delay, move |id| async move { callback(id) })
    }

    /// Cancel the action if it has not fired yet.
    ///
    /// Returns `true` if this call prevented the body from running. Calling
    /// it again, or after the action fired, is a no-op that returns `false`.
    pub fn cancel(&self) -> bool {
        if !self.inner.leave_pending(ActionPhase::Cancelled) {
            return false;
        }
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
        trace!(action_id = %self.inner.id, "delayed action cancelled");
        true
    }

    #[must_use]
    pub fn id(&self) -> ActionId {
        self.inner.id
    }

    /// Logical time at which the action becomes eligible to run.
    #[must_use]
    pub fn fire_at(&self) -> Instant {
        self.inner.fire_at
    }

    /// Time left until `fire_at`, zero once it has passed.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.inner.fire_at.saturating_duration_since(Instant::now())
    }

    #[must_use]
    pub fn phase(&self) -> ActionPhase {
        ActionPhase::from_u8(self.inner.phase.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.phase() == ActionPhase::Cancelled
    }

    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.phase() == ActionPhase::Fired
    }
}

impl fmt::Debug for DelayedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedAction")
            .field("id", &self.inner.id)
            .field("phase", &self.phase())
            .field("remaining", &self.remaining())
            .finish()
    }
}

/// Holder for at most one outstanding [`DelayedAction`].
///
/// Installing a new action always cancels the previous one.
#[derive(Debug, Default)]
pub struct ActionSlot {
    current: Option<DelayedAction>,
}

impl ActionSlot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `action` as current, cancelling and returning the previous one.
    pub fn replace(&mut self, action: DelayedAction) -> Option<DelayedAction> {
        let previous = self.current.replace(action);
        if let Some(previous) = &previous {
            previous.cancel();
        }
        previous
    }

    /// Cancel and clear the current action.
    ///
    /// Returns `true` if a pending action was prevented from firing. The slot
    /// is cleared either way, so a body that already fired is no longer
    /// current.
    pub fn cancel(&mut self) -> bool {
        self.current.take().is_some_and(|action| action.cancel())
    }

    /// Whether `id` identifies the action currently held by this slot.
    #[must_use]
    pub fn is_current(&self, id: ActionId) -> bool {
        self.current.as_ref().is_some_and(|action| action.id() == id)
    }

    #[must_use]
    pub fn current(&self) -> Option<&DelayedAction> {
        self.current.as_ref()
    }

    /// Whether the held action is still waiting to fire.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|action| action.phase() == ActionPhase::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;
    use tokio::time::sleep;

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn bump(count: &Arc<AtomicUsize>) -> impl FnOnce(ActionId) + Send + 'static {
        let count = Arc::clone(count);
        move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let count = counter();
        let action = DelayedAction::schedule_fn(Duration::from_millis(100), bump(&count));

        sleep(Duration::from_millis(99)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(action.phase(), ActionPhase::Pending);

        sleep(Duration::from_millis(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(action.has_fired());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_delay_fires() {
        let count = counter();
        let action = DelayedAction::schedule_fn(Duration::ZERO, bump(&count));
        sleep(Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(action.phase().is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_fire_prevents_body() {
        let count = counter();
        let action = DelayedAction::schedule_fn(Duration::from_millis(100), bump(&count));

        sleep(Duration::from_millis(50)).await;
        assert!(action.cancel());
        sleep(Duration::from_millis(500)).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(action.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent() {
        let count = counter();
        let action = DelayedAction::schedule_fn(Duration::from_millis(100), bump(&count));

        assert!(action.cancel());
        assert!(!action.cancel());
        assert!(!action.clone().cancel());
        assert_eq!(action.phase(), ActionPhase::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_fire_is_noop() {
        let count = counter();
        let action = DelayedAction::schedule_fn(Duration::from_millis(10), bump(&count));

        sleep(Duration::from_millis(20)).await;
        assert!(!action.cancel());
        assert!(!action.cancel());
        assert_eq!(action.phase(), ActionPhase::Fired);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_does_not_abort_running_body() {
        let count = counter();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let done = Arc::clone(&count);
        let action = DelayedAction::schedule(Duration::from_millis(10), move |_| async move {
            let _ = release_rx.await;
            done.fetch_add(1, Ordering::SeqCst);
        });

        sleep(Duration::from_millis(20)).await;
        assert!(action.has_fired());
        assert!(!action.cancel());

        release_tx.send(()).unwrap();
        sleep(Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_does_not_cancel() {
        let count = counter();
        drop(DelayedAction::schedule_fn(
            Duration::from_millis(10),
            bump(&count),
        ));
        sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn body_receives_own_id() {
        let (tx, rx) = oneshot::channel();
        let action = DelayedAction::schedule_fn(Duration::from_millis(5), move |id| {
            let _ = tx.send(id);
        });
        let seen = rx.await.unwrap();
        assert_eq!(seen, action.id());
    }

    #[tokio::test(start_paused = true)]
    async fn ids_are_unique_and_increasing() {
        let a = DelayedAction::schedule_fn(Duration::from_secs(1), |_| {});
        let b = DelayedAction::schedule_fn(Duration::from_secs(1), |_| {});
        assert!(b.id() > a.id());
        assert_ne!(a.id().to_string(), b.id().to_string());
        assert!(a.id().to_string().starts_with("act-"));
    }

    #[tokio::test(start_paused = true)]
    async fn fire_at_and_remaining_track_the_clock() {
        let start = Instant::now();
        let action = DelayedAction::schedule_fn(Duration::from_millis(500), |_| {});
        assert_eq!(action.fire_at(), start + Duration::from_millis(500));

        sleep(Duration::from_millis(200)).await;
        let remaining = action.remaining();
        assert!(remaining <= Duration::from_millis(300));
        assert!(remaining >= Duration::from_millis(299));

        sleep(Duration::from_millis(400)).await;
        assert_eq!(action.remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn slot_replace_cancels_previous() {
        let count = counter();
        let mut slot = ActionSlot::new();

        let first = DelayedAction::schedule_fn(Duration::from_millis(100), bump(&count));
        let first_id = first.id();
        assert!(slot.replace(first).is_none());
        assert!(slot.is_current(first_id));

        let second = DelayedAction::schedule_fn(Duration::from_millis(100), bump(&count));
        let second_id = second.id();
        let previous = slot.replace(second).unwrap();
        assert!(previous.is_cancelled());
        assert!(!slot.is_current(first_id));
        assert!(slot.is_current(second_id));

        sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slot_cancel_clears_even_after_fire() {
        let mut slot = ActionSlot::new();
        assert!(!slot.cancel());

        let action = DelayedAction::schedule_fn(Duration::from_millis(10), |_| {});
        let id = action.id();
        slot.replace(action);
        assert!(slot.is_pending());

        sleep(Duration::from_millis(20)).await;
        assert!(!slot.is_pending());
        assert!(slot.is_current(id));

        assert!(!slot.cancel());
        assert!(!slot.is_current(id));
        assert!(slot.current().is_none());
    }

    #[test]
    fn phase_display_and_terminal() {
        assert_eq!(ActionPhase::Pending.to_string(), "pending");
        assert_eq!(ActionPhase::Fired.to_string(), "fired");
        assert_eq!(ActionPhase::Cancelled.to_string(), "cancelled");
        assert!(!ActionPhase::Pending.is_terminal());
        assert!(ActionPhase::Fired.is_terminal());
        assert!(ActionPhase::Cancelled.is_terminal());
    }
}
