//! Self-rescheduling randomized trigger for ambient effects.
//!
//! A running scheduler always owns exactly one pending [`DelayedAction`]:
//! the wake-up for its next cycle. Each cycle draws a percentage per slot,
//! starts at most one effect per accepted slot, then arms the next wake-up
//! with a freshly drawn delay.
//!
//! ```text
//!   start()          delay elapsed            cycle done
//! Stopped ──► Scheduled ─────────► Firing ─────────────┐
//!    ▲            ▲                   │                 │
//!    │            └───────────────────┼─────────────────┘
//!    └──────── stop() ────────────────┘  (from Scheduled or Firing)
//! ```
//!
//! `stop()` only cancels the pending wake-up. Effects already playing keep
//! going and their completions are still recorded, even after the
//! scheduler has been dropped.
//!
//! Every `start()` opens a new generation. A cycle loop left over from an
//! earlier generation notices the mismatch and exits without firing, so a
//! fast stop/start never leaves two loops running.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{Instrument, debug, info, trace, warn};

use crate::config::{AmbientConfig, SlotConfig};
use crate::delay::{ActionSlot, DelayedAction};
use crate::error::PlaybackError;
use crate::random::{RandomSource, StdRandom};

/// Live-instance cap of an exclusive slot.
pub const EXCLUSIVE_CAP: usize = 1;

/// How many instances of a slot may play at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exclusivity {
    /// At most [`EXCLUSIVE_CAP`] live instance; extra triggers are dropped.
    Exclusive,
    /// Unlimited overlapping instances.
    Concurrent,
}

impl fmt::Display for Exclusivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exclusive => write!(f, "exclusive"),
            Self::Concurrent => write!(f, "concurrent"),
        }
    }
}

/// Identifier of one concrete playable effect, e.g. a sound file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EffectId(String);

impl EffectId {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EffectId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for EffectId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for EffectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque handle for one started effect, issued by the [`EffectPlayer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlaybackHandle(u64);

impl PlaybackHandle {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PlaybackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "play-{}", self.0)
    }
}

/// Completion notification for one started effect.
pub type FinishCallback = Box<dyn FnOnce(PlaybackHandle) + Send + 'static>;

/// Playback collaborator.
///
/// On success the player owns the underlying resource and must invoke
/// `on_finish` exactly once, with the returned handle, when the effect ends
/// naturally. It may do so before `play` returns. On error `on_finish` must
/// not be invoked.
pub trait EffectPlayer: Send + Sync + 'static {
    fn play(
        &self,
        effect: &EffectId,
        on_finish: FinishCallback,
    ) -> Result<PlaybackHandle, PlaybackError>;
}

impl<P: EffectPlayer> EffectPlayer for Arc<P> {
    fn play(
        &self,
        effect: &EffectId,
        on_finish: FinishCallback,
    ) -> Result<PlaybackHandle, PlaybackError> {
        (**self).play(effect, on_finish)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerPhase {
    #[default]
    Stopped,
    /// Waiting for the next cycle's wake-up.
    Scheduled,
    /// Drawing triggers and starting effects.
    Firing,
}

impl fmt::Display for SchedulerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::Firing => write!(f, "firing"),
        }
    }
}

/// Counters for observability and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbientStats {
    /// Cycles that fired (including ones that started nothing).
    pub cycles: u64,
    pub effects_started: u64,
    pub effects_finished: u64,
    /// Accepted draws dropped because an exclusive slot was at its cap.
    pub triggers_suppressed: u64,
    pub playback_failures: u64,
}

struct SlotState {
    name: String,
    probability: u8,
    exclusivity: Exclusivity,
    effects: Vec<EffectId>,
    live: HashSet<PlaybackHandle>,
    /// Accepted triggers whose `play` call has not returned yet.
    starting: usize,
    /// Completions that arrived before their handle was registered.
    finished_early: HashSet<PlaybackHandle>,
}

impl SlotState {
    fn new(config: &SlotConfig) -> Self {
        Self {
            name: config.name.clone(),
            probability: config.trigger_probability,
            exclusivity: config.exclusivity,
            effects: config.effects.clone(),
            live: HashSet::new(),
            starting: 0,
            finished_early: HashSet::new(),
        }
    }

    fn is_capped(&self) -> bool {
        self.exclusivity == Exclusivity::Exclusive
            && self.live.len() + self.starting >= EXCLUSIVE_CAP
    }
}

/// One accepted trigger, reserved on its slot and waiting to be played.
struct Launch {
    slot: usize,
    effect: EffectId,
}

struct SchedulerState {
    phase: SchedulerPhase,
    generation: u64,
    pending: ActionSlot,
    rng: Box<dyn RandomSource>,
    slots: Vec<SlotState>,
    stats: AmbientStats,
}

impl SchedulerState {
    fn owns(&self, generation: u64, phase: SchedulerPhase) -> bool {
        self.generation == generation && self.phase == phase
    }

    /// Draw every slot for this cycle and reserve the accepted ones.
    fn draw(&mut self, draw_when_capped: bool, cycle: u64) -> Vec<Launch> {
        let mut launches = Vec::new();
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            let capped = slot.is_capped();
            if capped && !draw_when_capped {
                self.stats.triggers_suppressed += 1;
                trace!(cycle, slot = %slot.name, "slot at capacity; draw skipped");
                continue;
            }

            let roll = self.rng.percent();
            if roll >= slot.probability {
                continue;
            }
            if capped {
                self.stats.triggers_suppressed += 1;
                trace!(cycle, slot = %slot.name, roll, "trigger suppressed at capacity");
                continue;
            }
            if slot.effects.is_empty() {
                trace!(cycle, slot = %slot.name, "trigger accepted but slot has no effects");
                continue;
            }

            let pick = self.rng.index(slot.effects.len());
            let Some(effect) = slot.effects.get(pick).cloned() else {
                warn!(
                    cycle,
                    slot = %slot.name,
                    pick,
                    effects = slot.effects.len(),
                    "random source picked an effect out of range; trigger skipped"
                );
                continue;
            };
            slot.starting += 1;
            debug!(cycle, slot = %slot.name, roll, effect = %effect, "trigger accepted");
            launches.push(Launch { slot: idx, effect });
        }
        launches
    }
}

struct Shared {
    delay_range: (Duration, Duration),
    draw_when_capped: bool,
    player: Arc<dyn EffectPlayer>,
    state: Mutex<SchedulerState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start one reserved effect. The lock is released around `play`.
    fn launch(self: &Arc<Self>, launch: Launch, cycle: u64) {
        let weak = Arc::downgrade(self);
        let slot = launch.slot;
        let on_finish: FinishCallback = Box::new(move |handle: PlaybackHandle| match weak.upgrade() {
            Some(shared) => shared.finish(slot, handle),
            None => trace!(handle = %handle, "effect finished after scheduler teardown"),
        });

        let result = self.player.play(&launch.effect, on_finish);

        let mut guard = self.state();
        let state = &mut *guard;
        let Some(slot_state) = state.slots.get_mut(slot) else {
            return;
        };
        slot_state.starting = slot_state.starting.saturating_sub(1);

        match result {
            Ok(handle) => {
                state.stats.effects_started += 1;
                if slot_state.finished_early.remove(&handle) {
                    state.stats.effects_finished += 1;
                    debug!(
                        cycle,
                        slot = %slot_state.name,
                        effect = %launch.effect,
                        handle = %handle,
                        "effect finished before registration"
                    );
                } else {
                    slot_state.live.insert(handle);
                    debug!(
                        cycle,
                        slot = %slot_state.name,
                        effect = %launch.effect,
                        handle = %handle,
                        live = slot_state.live.len(),
                        "effect started"
                    );
                }
            }
            Err(err) => {
                state.stats.playback_failures += 1;
                warn!(
                    cycle,
                    slot = %slot_state.name,
                    effect = %launch.effect,
                    error = %err,
                    "effect playback failed"
                );
            }
        }

        if slot_state.starting == 0 {
            slot_state.finished_early.clear();
        }
    }

    fn finish(&self, slot: usize, handle: PlaybackHandle) {
        let mut guard = self.state();
        let state = &mut *guard;
        let Some(slot_state) = state.slots.get_mut(slot) else {
            return;
        };

        if slot_state.live.remove(&handle) {
            state.stats.effects_finished += 1;
            debug!(
                slot = %slot_state.name,
                handle = %handle,
                live = slot_state.live.len(),
                "effect finished"
            );
        } else if slot_state.starting > 0 {
            slot_state.finished_early.insert(handle);
        } else {
            trace!(slot = %slot_state.name, handle = %handle, "ignoring unknown completion");
        }
    }
}

/// Arm the wake-up for the next cycle of `generation`.
///
/// Returns `None` when the generation is no longer the running one.
fn arm_next_cycle(shared: &Weak<Shared>, generation: u64) -> Option<oneshot::Receiver<()>> {
    let shared = shared.upgrade()?;
    let mut state = shared.state();
    if !state.owns(generation, SchedulerPhase::Scheduled) {
        return None;
    }

    let (min, max) = shared.delay_range;
    let delay = state.rng.delay_between(min, max);
    let (tx, rx) = oneshot::channel();
    let action = DelayedAction::schedule_fn(delay, move |_| {
        let _ = tx.send(());
    });
    debug!(
        generation,
        action_id = %action.id(),
        delay_ms = delay.as_millis() as u64,
        "next ambient cycle scheduled"
    );
    state.pending.replace(action);
    Some(rx)
}

/// Fire one cycle. Returns `false` once the loop should exit.
fn run_cycle(shared: &Weak<Shared>, generation: u64) -> bool {
    let Some(shared) = shared.upgrade() else {
        return false;
    };

    let (cycle, launches) = {
        let mut state = shared.state();
        if !state.owns(generation, SchedulerPhase::Scheduled) {
            return false;
        }
        state.phase = SchedulerPhase::Firing;
        state.stats.cycles += 1;
        let cycle = state.stats.cycles;
        (cycle, state.draw(shared.draw_when_capped, cycle))
    };

    for launch in launches {
        shared.launch(launch, cycle);
    }

    let mut state = shared.state();
    if !state.owns(generation, SchedulerPhase::Firing) {
        return false;
    }
    state.phase = SchedulerPhase::Scheduled;
    true
}

async fn drive(shared: Weak<Shared>, generation: u64) {
    loop {
        let Some(wake) = arm_next_cycle(&shared, generation) else {
            break;
        };
        if wake.await.is_err() {
            trace!(generation, "pending cycle cancelled");
            break;
        }
        if !run_cycle(&shared, generation) {
            break;
        }
    }
    trace!(generation, "ambient cycle loop exited");
}

/// Randomized, self-rescheduling trigger for ambient effects.
///
/// Must be used from within a tokio runtime. Dropping the scheduler stops
/// it.
pub struct AmbientScheduler {
    shared: Arc<Shared>,
}

impl AmbientScheduler {
    /// Scheduler drawing from an OS-seeded random source.
    pub fn new<P: EffectPlayer>(config: &AmbientConfig, player: P) -> Self {
        Self::with_random(config, player, StdRandom::from_entropy())
    }

    pub fn with_random<P, R>(config: &AmbientConfig, player: P, rng: R) -> Self
    where
        P: EffectPlayer,
        R: RandomSource + 'static,
    {
        let state = SchedulerState {
            phase: SchedulerPhase::Stopped,
            generation: 0,
            pending: ActionSlot::new(),
            rng: Box::new(rng),
            slots: config.slots.iter().map(SlotState::new).collect(),
            stats: AmbientStats::default(),
        };
        Self {
            shared: Arc::new(Shared {
                delay_range: config.delay_range(),
                draw_when_capped: config.draw_when_capped,
                player: Arc::new(player),
                state: Mutex::new(state),
            }),
        }
    }

    /// Begin cycling. Returns `false` if already running.
    pub fn start(&self) -> bool {
        let generation = {
            let mut state = self.shared.state();
            if state.phase != SchedulerPhase::Stopped {
                trace!(phase = %state.phase, "ambient scheduler already running");
                return false;
            }
            state.generation += 1;
            state.phase = SchedulerPhase::Scheduled;
            state.generation
        };

        info!(generation, "ambient scheduler started");
        let span = crate::coord_span!("ambient_cycle_loop", generation = generation);
        tokio::spawn(drive(Arc::downgrade(&self.shared), generation).instrument(span));
        true
    }

    /// Cancel the pending cycle. Playing effects are left alone.
    ///
    /// Returns `false` if already stopped.
    pub fn stop(&self) -> bool {
        let mut state = self.shared.state();
        if state.phase == SchedulerPhase::Stopped {
            return false;
        }
        state.phase = SchedulerPhase::Stopped;
        state.pending.cancel();
        info!(generation = state.generation, "ambient scheduler stopped");
        true
    }

    #[must_use]
    pub fn phase(&self) -> SchedulerPhase {
        self.shared.state().phase
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.phase() != SchedulerPhase::Stopped
    }

    /// Number of registered live instances in the named slot.
    #[must_use]
    pub fn live_count(&self, slot: &str) -> usize {
        self.shared
            .state()
            .slots
            .iter()
            .find(|s| s.name == slot)
            .map_or(0, |s| s.live.len())
    }

    #[must_use]
    pub fn stats(&self) -> AmbientStats {
        self.shared.state().stats
    }
}

impl Drop for AmbientScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
