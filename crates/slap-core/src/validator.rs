//! Debounced, cancel-on-restart availability checks for editable fields.
//!
//! Each open edit session owns at most one [`DelayedAction`]. Every input
//! cancels it; a non-trivial value schedules a fresh one that, once the
//! quiet period elapses, runs the caller's [`AvailabilityCheck`].
//!
//! ```text
//!            input == "" or baseline
//!        ┌──────────────────────────────┐
//!        ▼                              │
//!      Idle ──── other input ────► Checking ──── check(true) ──► Available
//!        ▲                           ▲   │                          │
//!        │                           │   └──── check(false) ──► Unavailable
//!        └──── end_edit / submit     └──────── any input ───────────┘
//! ```
//!
//! A check result is applied only if its action is still the field's
//! current action when the check resolves. The comparison is by
//! [`ActionId`] at resolution time, so a check that was already running
//! when a newer keystroke arrived can never overwrite the newer outcome.
//!
//! The validator never times out a check. A check that cannot reach its
//! backend must resolve to `false` itself.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{Instrument, debug, trace};

use crate::config::DebounceConfig;
use crate::delay::{ActionId, ActionSlot, DelayedAction};
use crate::error::ValidatorError;

/// Boxed future returned by [`AvailabilityCheck::check`].
pub type CheckFuture = Pin<Box<dyn Future<Output = bool> + Send + 'static>>;

/// External availability lookup, e.g. "is this username taken".
///
/// Resolves to `true` when the candidate is available. Failures to reach
/// the backing service must resolve to `false`.
pub trait AvailabilityCheck: Send + Sync + 'static {
    fn check(&self, candidate: String) -> CheckFuture;
}

impl<F, Fut> AvailabilityCheck for F
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    fn check(&self, candidate: String) -> CheckFuture {
        Box::pin(self(candidate))
    }
}

/// Identifier of an editable field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldId(String);

impl FieldId {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FieldId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for FieldId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Availability of the value currently in a field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationState {
    /// Nothing to check: value is empty, unmodified, or editing ended.
    #[default]
    Idle,
    /// A check is scheduled or in flight.
    Checking,
    Available,
    Unavailable,
}

impl ValidationState {
    /// Whether a check outcome has been applied.
    #[must_use]
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Available | Self::Unavailable)
    }
}

impl fmt::Display for ValidationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Checking => write!(f, "checking"),
            Self::Available => write!(f, "available"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Counters for observability and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorStats {
    /// Checks invoked after their quiet period elapsed.
    pub checks_started: u64,
    /// Check results that changed a field's state.
    pub results_applied: u64,
    /// Check results dropped because a newer input or teardown superseded them.
    pub results_discarded: u64,
}

struct FieldSession {
    baseline: String,
    value: String,
    slot: ActionSlot,
    state: watch::Sender<ValidationState>,
}

impl FieldSession {
    fn new(baseline: String) -> Self {
        let (state, _) = watch::channel(ValidationState::Idle);
        Self {
            value: baseline.clone(),
            baseline,
            slot: ActionSlot::new(),
            state,
        }
    }

    fn current_state(&self) -> ValidationState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ValidationState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
    }

    fn can_submit(&self) -> bool {
        self.current_state() == ValidationState::Available || self.value == self.baseline
    }

    fn teardown(mut self) {
        self.slot.cancel();
        self.set_state(ValidationState::Idle);
    }
}

#[derive(Default)]
struct Counters {
    checks_started: AtomicU64,
    results_applied: AtomicU64,
    results_discarded: AtomicU64,
}

struct Shared {
    delay: Duration,
    check: Arc<dyn AvailabilityCheck>,
    fields: Mutex<HashMap<FieldId, FieldSession>>,
    counters: Counters,
}

impl Shared {
    fn fields(&self) -> MutexGuard<'_, HashMap<FieldId, FieldSession>> {
        self.fields.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply_result(&self, field: &FieldId, id: ActionId, available: bool) {
        let fields = self.fields();
        let Some(session) = fields.get(field).filter(|s| s.slot.is_current(id)) else {
            self.counters
                .results_discarded
                .fetch_add(1, Ordering::Relaxed);
            trace!(field = %field, action_id = %id, available, "discarding superseded check result");
            return;
        };

        let next = if available {
            ValidationState::Available
        } else {
            ValidationState::Unavailable
        };
        session.set_state(next);
        self.counters.results_applied.fetch_add(1, Ordering::Relaxed);
        debug!(field = %field, action_id = %id, state = %next, "availability check applied");
    }
}

/// Body of a field's delayed action: run the check, then apply the result
/// only if this action is still current.
async fn run_check(shared: Weak<Shared>, field: FieldId, candidate: String, id: ActionId) {
    let check = {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        shared
            .counters
            .checks_started
            .fetch_add(1, Ordering::Relaxed);
        Arc::clone(&shared.check)
    };

    debug!(field = %field, action_id = %id, candidate = %candidate, "running availability check");
    let available = check.check(candidate).await;

    match shared.upgrade() {
        Some(shared) => shared.apply_result(&field, id, available),
        None => trace!(field = %field, action_id = %id, "validator gone; dropping check result"),
    }
}

/// Debounced availability validator for one or more editable fields.
///
/// All state changes for a field happen under one lock that is never held
/// across an await, so input handling and result application for the same
/// field are serialized. Must be used from within a tokio runtime.
///
/// Dropping the validator ends every open session.
pub struct DebounceValidator {
    shared: Arc<Shared>,
}

impl DebounceValidator {
    pub fn new<C: AvailabilityCheck>(config: &DebounceConfig, check: C) -> Self {
        Self::with_check(config, Arc::new(check))
    }

    pub fn with_check(config: &DebounceConfig, check: Arc<dyn AvailabilityCheck>) -> Self {
        Self {
            shared: Arc::new(Shared {
                delay: config.delay(),
                check,
                fields: Mutex::new(HashMap::new()),
                counters: Counters::default(),
            }),
        }
    }

    /// Quiet period applied to every input.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.shared.delay
    }

    /// Open an edit session whose unmodified value is `baseline`.
    ///
    /// An already-open session for the same field is torn down first.
    pub fn begin_edit(
        &self,
        field: impl Into<FieldId>,
        baseline: impl Into<String>,
    ) -> watch::Receiver<ValidationState> {
        let field = field.into();
        let session = FieldSession::new(baseline.into());
        let receiver = session.state.subscribe();

        let previous = self.shared.fields().insert(field.clone(), session);
        if let Some(previous) = previous {
            previous.teardown();
        }
        debug!(field = %field, "edit session opened");
        receiver
    }

    /// Handle one edit of `field`.
    ///
    /// Cancels the field's outstanding action, then either settles to
    /// `Idle` (empty or unmodified value) or enters `Checking` and schedules
    /// a check after the debounce delay. Returns the state after the edit.
    pub fn on_input(
        &self,
        field: &FieldId,
        value: impl Into<String>,
    ) -> Result<ValidationState, ValidatorError> {
        let value = value.into();
        let mut fields = self.shared.fields();
        let session = fields
            .get_mut(field)
            .ok_or_else(|| ValidatorError::NoSession(field.clone()))?;

        session.slot.cancel();
        session.value.clone_from(&value);

        if value.is_empty() || value == session.baseline {
            session.set_state(ValidationState::Idle);
            trace!(field = %field, "value empty or unmodified; nothing to check");
            return Ok(ValidationState::Idle);
        }

        session.set_state(ValidationState::Checking);
        let weak = Arc::downgrade(&self.shared);
        let target = field.clone();
        let action = DelayedAction::schedule(self.shared.delay, move |id| {
            let span = crate::coord_span!(
                "availability_check",
                field = target.as_str(),
                action_id = id.get()
            );
            run_check(weak, target, value, id).instrument(span)
        });
        debug!(
            field = %field,
            action_id = %action.id(),
            delay_ms = self.shared.delay.as_millis() as u64,
            "availability check scheduled"
        );
        session.slot.replace(action);
        Ok(ValidationState::Checking)
    }

    /// Whether an accept action is currently permitted for `field`.
    ///
    /// True when the value is confirmed available, or when it equals the
    /// baseline (an unmodified value needs no check).
    #[must_use]
    pub fn can_submit(&self, field: &FieldId) -> bool {
        self.shared
            .fields()
            .get(field)
            .is_some_and(FieldSession::can_submit)
    }

    /// Accept the field's value and end its session.
    ///
    /// Returns the accepted value for the caller to persist.
    pub fn submit(&self, field: &FieldId) -> Result<String, ValidatorError> {
        let session = {
            let mut fields = self.shared.fields();
            let session = fields
                .get(field)
                .ok_or_else(|| ValidatorError::NoSession(field.clone()))?;
            if !session.can_submit() {
                return Err(ValidatorError::SubmitBlocked {
                    field: field.clone(),
                    state: session.current_state(),
                });
            }
            fields.remove(field)
        };

        let Some(session) = session else {
            return Err(ValidatorError::NoSession(field.clone()));
        };
        let value = session.value.clone();
        session.teardown();
        debug!(field = %field, "edit session submitted");
        Ok(value)
    }

    /// End the field's edit session: cancel its action and reset to `Idle`.
    ///
    /// Returns `false` if no session was open.
    pub fn end_edit(&self, field: &FieldId) -> bool {
        let session = self.shared.fields().remove(field);
        match session {
            Some(session) => {
                session.teardown();
                debug!(field = %field, "edit session closed");
                true
            }
            None => false,
        }
    }

    /// End every open session.
    pub fn shutdown(&self) {
        let sessions: Vec<_> = self.shared.fields().drain().collect();
        for (field, session) in sessions {
            session.teardown();
            trace!(field = %field, "edit session closed on shutdown");
        }
    }

    /// Current state, or `None` if the field has no open session.
    #[must_use]
    pub fn state(&self, field: &FieldId) -> Option<ValidationState> {
        self.shared
            .fields()
            .get(field)
            .map(FieldSession::current_state)
    }

    /// Current value, or `None` if the field has no open session.
    #[must_use]
    pub fn value(&self, field: &FieldId) -> Option<String> {
        self.shared.fields().get(field).map(|s| s.value.clone())
    }

    /// Watch the field's state, or `None` if the field has no open session.
    #[must_use]
    pub fn subscribe(&self, field: &FieldId) -> Option<watch::Receiver<ValidationState>> {
        self.shared.fields().get(field).map(|s| s.state.subscribe())
    }

    #[must_use]
    pub fn stats(&self) -> ValidatorStats {
        let counters = &self.shared.counters;
        ValidatorStats {
            checks_started: counters.checks_started.load(Ordering::Relaxed),
            results_applied: counters.results_applied.load(Ordering::Relaxed),
            results_discarded: counters.results_discarded.load(Ordering::Relaxed),
        }
    }
}

impl Drop for DebounceValidator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
