//! Sweep state machine
//!
//! Sequences the phases of one sweep and decides what happens next: advance,
//! wait for outstanding work, rerun, or retry after backoff. It holds no
//! fabric data and performs no I/O; the service feeds it events.
//!
//! State Machine:
//! ```text
//!                  Begin(kind)
//! [IDLE] ──────────────────────────→ [RUNNING {LINK}]
//!   ↑                                     │
//!   │                      PhaseDone ─────┼───── PhasePending
//!   │                         │           │            │
//!   │                         ↓           │            ↓
//!   │               [RUNNING {next}]      │   [WAITING {phase}]
//!   │                                     │            │ Drained
//!   │                                     │            ↓
//!   │                                     │   [RUNNING {next}]
//!   │                                     │
//!   ├──── last phase done (Completed / Incomplete)
//!   ├──── PhaseFailed (Aborted, backoff grows)
//!   └──── Cancelled (lost mastership before LINK)
//!
//! Heavy:  LINK → DROP → ADDRESS → UNICAST → MULTICAST
//! Light:  LINK
//! ```
//!
//! Requests arriving while busy never interrupt the sweep; they are merged
//! into one pending request (heavy wins over light) served after it ends.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Sweep flavour.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepKind {
    /// Discovery and change detection only.
    Light,
    /// Full reconfiguration.
    Heavy,
}

/// One unit of fabric work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepPhase {
    Link,
    Drop,
    Address,
    Unicast,
    Multicast,
}

impl SweepPhase {
    /// Phase following `self` in a sweep of `kind`.
    pub fn next(self, kind: SweepKind) -> Option<SweepPhase> {
        match (kind, self) {
            (SweepKind::Light, _) => None,
            (SweepKind::Heavy, Self::Link) => Some(Self::Drop),
            (SweepKind::Heavy, Self::Drop) => Some(Self::Address),
            (SweepKind::Heavy, Self::Address) => Some(Self::Unicast),
            (SweepKind::Heavy, Self::Unicast) => Some(Self::Multicast),
            (SweepKind::Heavy, Self::Multicast) => None,
        }
    }
}

impl fmt::Display for SweepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Link => "LINK",
            Self::Drop => "DROP",
            Self::Address => "ADDRESS",
            Self::Unicast => "UNICAST",
            Self::Multicast => "MULTICAST",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SweepState {
    #[default]
    Idle,
    /// Phase ready to run.
    Running { kind: SweepKind, phase: SweepPhase },
    /// Phase ran and is waiting for its outstanding work to drain.
    Waiting { kind: SweepKind, phase: SweepPhase },
}

impl SweepState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn phase(&self) -> Option<SweepPhase> {
        match self {
            Self::Idle => None,
            Self::Running { phase, .. } | Self::Waiting { phase, .. } => Some(*phase),
        }
    }
}

/// Events that drive the sweep state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SweepEvent {
    /// Someone wants a sweep; served now if idle, after the current one
    /// otherwise.
    Requested(SweepKind),
    /// Start the pending sweep.
    Begin(SweepKind),
    /// Current phase finished with nothing outstanding.
    PhaseDone,
    /// Current phase finished and issued asynchronous work.
    PhasePending,
    /// Outstanding work of the waiting phase reached zero.
    Drained,
    /// Some transaction of this sweep failed.
    MarkIncomplete,
    /// Current phase returned an error.
    PhaseFailed,
    /// Sweep abandoned without fault (role lost).
    Cancelled,
}

/// How the last sweep ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepOutcome {
    Completed(SweepKind),
    /// Every phase ran but some work failed; a heavy retry is due.
    Incomplete(SweepKind),
    Aborted(SweepKind),
    Cancelled(SweepKind),
}

/// Backoff bounds for heavy-sweep retries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
pub struct SweepStateMachine {
    state: SweepState,
    pending: Option<SweepKind>,
    incomplete: bool,
    consecutive_failures: u32,
    last_outcome: Option<SweepOutcome>,
    retry: RetryPolicy,
}

impl SweepStateMachine {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            state: SweepState::Idle,
            pending: None,
            incomplete: false,
            consecutive_failures: 0,
            last_outcome: None,
            retry,
        }
    }

    pub fn state(&self) -> SweepState {
        self.state
    }

    pub fn pending(&self) -> Option<SweepKind> {
        self.pending
    }

    /// Take the pending request if the machine is idle.
    pub fn take_pending(&mut self) -> Option<SweepKind> {
        if self.state.is_idle() {
            self.pending.take()
        } else {
            None
        }
    }

    pub fn is_incomplete(&self) -> bool {
        self.incomplete
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_outcome(&self) -> Option<SweepOutcome> {
        self.last_outcome
    }

    /// Delay before the heavy retry owed by the last sweep, if any.
    ///
    /// Doubles with every consecutive failure, capped at the policy maximum.
    pub fn retry_delay(&self) -> Option<Duration> {
        match self.last_outcome {
            Some(SweepOutcome::Incomplete(_)) | Some(SweepOutcome::Aborted(_)) => {
                let exp = self.consecutive_failures.saturating_sub(1).min(16);
                let delay = self.retry.base.saturating_mul(1u32 << exp);
                Some(delay.min(self.retry.max))
            }
            _ => None,
        }
    }

    /// Process an event and return the new state.
    pub fn process_event(&mut self, event: SweepEvent) -> SweepState {
        let new_state = self.next_state(event);

        match (self.state, event) {
            (_, SweepEvent::Requested(kind)) => {
                self.pending = Some(self.pending.map_or(kind, |p| p.max(kind)));
            }
            (SweepState::Idle, SweepEvent::Begin(_)) => {
                self.incomplete = false;
            }
            (_, SweepEvent::MarkIncomplete) if !self.state.is_idle() => {
                self.incomplete = true;
            }
            _ => {}
        }

        if !self.state.is_idle() && new_state.is_idle() {
            self.finish(event);
        }

        self.state = new_state;
        new_state
    }

    fn finish(&mut self, event: SweepEvent) {
        let kind = match self.state {
            SweepState::Running { kind, .. } | SweepState::Waiting { kind, .. } => kind,
            SweepState::Idle => return,
        };
        let outcome = match event {
            SweepEvent::PhaseFailed => {
                self.consecutive_failures += 1;
                SweepOutcome::Aborted(kind)
            }
            SweepEvent::Cancelled => SweepOutcome::Cancelled(kind),
            _ if self.incomplete => {
                self.consecutive_failures += 1;
                SweepOutcome::Incomplete(kind)
            }
            _ => {
                if kind == SweepKind::Heavy {
                    self.consecutive_failures = 0;
                }
                SweepOutcome::Completed(kind)
            }
        };
        self.last_outcome = Some(outcome);
    }

    /// Pure transition function.
    fn next_state(&self, event: SweepEvent) -> SweepState {
        match (self.state, event) {
            (SweepState::Idle, SweepEvent::Begin(kind)) => SweepState::Running {
                kind,
                phase: SweepPhase::Link,
            },

            (SweepState::Running { kind, phase }, SweepEvent::PhaseDone)
            | (SweepState::Waiting { kind, phase }, SweepEvent::Drained) => {
                match phase.next(kind) {
                    Some(phase) => SweepState::Running { kind, phase },
                    None => SweepState::Idle,
                }
            }

            (SweepState::Running { kind, phase }, SweepEvent::PhasePending) => {
                SweepState::Waiting { kind, phase }
            }

            (SweepState::Running { .. } | SweepState::Waiting { .. }, SweepEvent::PhaseFailed)
            | (SweepState::Running { .. } | SweepState::Waiting { .. }, SweepEvent::Cancelled) => {
                SweepState::Idle
            }

            // Requests, incompleteness marks and out-of-order events
            (state, _) => state,
        }
    }
}

impl Default for SweepStateMachine {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> SweepStateMachine {
        SweepStateMachine::new(RetryPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_millis(350),
        })
    }

    fn run_heavy(m: &mut SweepStateMachine) {
        m.process_event(SweepEvent::Begin(SweepKind::Heavy));
        for _ in 0..5 {
            m.process_event(SweepEvent::PhaseDone);
        }
    }

    #[test]
    fn test_heavy_sweep_visits_every_phase_in_order() {
        let mut m = machine();
        let mut seen = Vec::new();
        let mut state = m.process_event(SweepEvent::Begin(SweepKind::Heavy));
        while let Some(phase) = state.phase() {
            seen.push(phase);
            state = m.process_event(SweepEvent::PhaseDone);
        }
        assert_eq!(
            seen,
            vec![
                SweepPhase::Link,
                SweepPhase::Drop,
                SweepPhase::Address,
                SweepPhase::Unicast,
                SweepPhase::Multicast
            ]
        );
        assert_eq!(m.last_outcome(), Some(SweepOutcome::Completed(SweepKind::Heavy)));
        assert_eq!(m.retry_delay(), None);
    }

    #[test]
    fn test_light_sweep_is_link_only() {
        let mut m = machine();
        m.process_event(SweepEvent::Begin(SweepKind::Light));
        assert_eq!(m.process_event(SweepEvent::PhaseDone), SweepState::Idle);
        assert_eq!(m.last_outcome(), Some(SweepOutcome::Completed(SweepKind::Light)));
    }

    #[test]
    fn test_pending_phase_waits_for_drain() {
        let mut m = machine();
        m.process_event(SweepEvent::Begin(SweepKind::Heavy));
        let state = m.process_event(SweepEvent::PhasePending);
        assert_eq!(
            state,
            SweepState::Waiting {
                kind: SweepKind::Heavy,
                phase: SweepPhase::Link
            }
        );

        // PhaseDone is not a valid way out of waiting
        assert_eq!(m.process_event(SweepEvent::PhaseDone), state);
        assert_eq!(
            m.process_event(SweepEvent::Drained),
            SweepState::Running {
                kind: SweepKind::Heavy,
                phase: SweepPhase::Drop
            }
        );
    }

    #[test]
    fn test_request_mid_sweep_sets_rerun_only() {
        let mut m = machine();
        m.process_event(SweepEvent::Requested(SweepKind::Light));
        assert_eq!(m.take_pending(), Some(SweepKind::Light));
        m.process_event(SweepEvent::Begin(SweepKind::Light));

        let before = m.state();
        m.process_event(SweepEvent::Requested(SweepKind::Heavy));
        m.process_event(SweepEvent::Requested(SweepKind::Light));
        assert_eq!(m.state(), before);
        assert_eq!(m.take_pending(), None, "not served while busy");

        m.process_event(SweepEvent::PhaseDone);
        assert_eq!(m.take_pending(), Some(SweepKind::Heavy));
    }

    #[test]
    fn test_incomplete_sweep_finishes_and_backs_off() {
        let mut m = machine();
        m.process_event(SweepEvent::Begin(SweepKind::Heavy));
        m.process_event(SweepEvent::PhaseDone);
        m.process_event(SweepEvent::MarkIncomplete);
        for _ in 0..4 {
            m.process_event(SweepEvent::PhaseDone);
        }
        assert!(m.state().is_idle());
        assert_eq!(m.last_outcome(), Some(SweepOutcome::Incomplete(SweepKind::Heavy)));
        assert_eq!(m.retry_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut m = machine();
        let mut delays = Vec::new();
        for _ in 0..4 {
            m.process_event(SweepEvent::Begin(SweepKind::Heavy));
            m.process_event(SweepEvent::PhaseFailed);
            delays.push(m.retry_delay().unwrap().as_millis());
        }
        assert_eq!(delays, vec![100, 200, 350, 350]);

        run_heavy(&mut m);
        assert_eq!(m.consecutive_failures(), 0);
        assert_eq!(m.retry_delay(), None);
    }

    #[test]
    fn test_cancel_is_not_a_failure() {
        let mut m = machine();
        m.process_event(SweepEvent::Begin(SweepKind::Heavy));
        m.process_event(SweepEvent::Cancelled);
        assert!(m.state().is_idle());
        assert_eq!(m.consecutive_failures(), 0);
        assert_eq!(m.retry_delay(), None);
    }

    #[test]
    fn test_incomplete_flag_resets_per_sweep() {
        let mut m = machine();
        m.process_event(SweepEvent::Begin(SweepKind::Heavy));
        m.process_event(SweepEvent::MarkIncomplete);
        assert!(m.is_incomplete());
        m.process_event(SweepEvent::PhaseFailed);

        m.process_event(SweepEvent::Begin(SweepKind::Heavy));
        assert!(!m.is_incomplete());
    }

    #[test]
    fn test_idle_ignores_phase_events() {
        let mut m = machine();
        assert_eq!(m.process_event(SweepEvent::PhaseDone), SweepState::Idle);
        assert_eq!(m.process_event(SweepEvent::Drained), SweepState::Idle);
        assert_eq!(m.process_event(SweepEvent::MarkIncomplete), SweepState::Idle);
        assert!(!m.is_incomplete());
        assert_eq!(m.last_outcome(), None);
    }
}
