//! # Role Arbitration
//!
//! Decides whether this instance is the fabric's master.
//!
//! ```text
//!                  no preferred peer
//! [DISCOVERING] ─────────────────────────→ [MASTER]
//!     │    ↑                                 │  ↑
//!     │    │ polls missed > retry limit      │  │ handover received
//!     │    │                                 │  │
//!     │   [STANDBY] ←── preferred master ────┘  │
//!     │      ↑      ←── handover to preferred   │
//!     │      │          standby                 │
//!     └──────┘ preferred peer                   │
//!            └──────────────────────────────────┘
//! ```
//!
//! Preference: higher priority wins; on a tie the numerically smaller GUID
//! wins. `arbitrate` picks the same winner whatever order peers are listed in.

use fabric_types::{SmCandidate, SmRole};
use parking_lot::Mutex;
use tracing::info;

use crate::metrics;
use crate::ports::outbound::PeerInfo;

/// Best peer that is preferred over `local`, if any.
pub fn arbitrate(local: SmCandidate, peers: &[PeerInfo]) -> Option<SmCandidate> {
    peers
        .iter()
        .map(|p| p.candidate)
        .filter(|c| c.guid != local.guid && c.is_preferred_over(&local))
        .fold(None, |best: Option<SmCandidate>, c| match best {
            Some(b) if b.is_preferred_over(&c) => Some(b),
            _ => Some(c),
        })
}

/// Events that drive role transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleEvent {
    /// Arbitration finished; carries the preferred peer, if one exists.
    DiscoveryCompleted { preferred: Option<SmCandidate> },
    PollSucceeded,
    PollFailed,
    HandoverReceived,
    RemoteMasterDetected(SmCandidate),
    PreferredStandbyDetected(SmCandidate),
}

#[derive(Debug, Clone)]
pub struct RoleStateMachine {
    local: SmCandidate,
    role: SmRole,
    master: Option<SmCandidate>,
    retries: u32,
    max_retries: u32,
}

impl RoleStateMachine {
    pub fn new(local: SmCandidate, max_retries: u32) -> Self {
        Self {
            local,
            role: SmRole::Discovering,
            master: None,
            retries: 0,
            max_retries,
        }
    }

    pub fn role(&self) -> SmRole {
        self.role
    }

    pub fn local(&self) -> SmCandidate {
        self.local
    }

    /// Master followed while in standby.
    pub fn master(&self) -> Option<SmCandidate> {
        self.master
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Process an event and return the new role.
    pub fn process_event(&mut self, event: RoleEvent) -> SmRole {
        match (self.role, event) {
            (SmRole::Discovering, RoleEvent::DiscoveryCompleted { preferred }) => match preferred {
                Some(winner) if winner.is_preferred_over(&self.local) => self.follow(winner),
                _ => self.lead(),
            },

            (SmRole::Standby, RoleEvent::PollSucceeded) => self.retries = 0,
            (SmRole::Standby, RoleEvent::PollFailed) => {
                self.retries += 1;
                if self.retries > self.max_retries {
                    self.role = SmRole::Discovering;
                    self.master = None;
                    self.retries = 0;
                }
            }

            (SmRole::Standby | SmRole::Discovering, RoleEvent::HandoverReceived) => self.lead(),

            (SmRole::Master, RoleEvent::RemoteMasterDetected(remote))
            | (SmRole::Master, RoleEvent::PreferredStandbyDetected(remote))
                if remote.is_preferred_over(&self.local) =>
            {
                self.follow(remote)
            }

            _ => {}
        }
        self.role
    }

    fn lead(&mut self) {
        self.role = SmRole::Master;
        self.master = None;
        self.retries = 0;
    }

    fn follow(&mut self, master: SmCandidate) {
        self.role = SmRole::Standby;
        self.master = Some(master);
        self.retries = 0;
    }
}

/// Shared role state; every transition goes through one lock.
#[derive(Debug)]
pub struct RoleManager {
    inner: Mutex<RoleStateMachine>,
}

impl RoleManager {
    pub fn new(local: SmCandidate, max_retries: u32) -> Self {
        Self {
            inner: Mutex::new(RoleStateMachine::new(local, max_retries)),
        }
    }

    pub fn role(&self) -> SmRole {
        self.inner.lock().role()
    }

    pub fn local(&self) -> SmCandidate {
        self.inner.lock().local()
    }

    pub fn master(&self) -> Option<SmCandidate> {
        self.inner.lock().master()
    }

    /// Apply `event`, returning `(before, after)`.
    pub fn process_event(&self, event: RoleEvent) -> (SmRole, SmRole) {
        let mut machine = self.inner.lock();
        let before = machine.role();
        let after = machine.process_event(event);
        if before != after {
            info!(from = %before, to = %after, event = ?event, "SM role changed");
            metrics::record_role_transition(after);
        }
        (before, after)
    }

    /// Consistent copy of the whole state.
    pub fn snapshot(&self) -> RoleStateMachine {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_types::Guid;

    fn peer(guid: u64, priority: u8, role: SmRole) -> PeerInfo {
        PeerInfo::new(Guid(guid), priority, role)
    }

    #[test]
    fn test_lone_instance_becomes_master() {
        let mut m = RoleStateMachine::new(SmCandidate::new(Guid(10), 5), 2);
        let role = m.process_event(RoleEvent::DiscoveryCompleted { preferred: None });
        assert_eq!(role, SmRole::Master);
    }

    #[test]
    fn test_equal_priority_smaller_guid_wins() {
        let local = SmCandidate::new(Guid(10), 5);
        let remote = peer(3, 5, SmRole::Discovering);

        let mut m = RoleStateMachine::new(local, 2);
        let preferred = arbitrate(local, &[remote]);
        assert_eq!(preferred.map(|c| c.guid), Some(Guid(3)));
        assert_eq!(m.process_event(RoleEvent::DiscoveryCompleted { preferred }), SmRole::Standby);
        assert_eq!(m.master().map(|c| c.guid), Some(Guid(3)));

        let other = SmCandidate::new(Guid(3), 5);
        let mut m = RoleStateMachine::new(other, 2);
        let preferred = arbitrate(other, &[peer(10, 5, SmRole::Discovering)]);
        assert_eq!(preferred, None);
        assert_eq!(m.process_event(RoleEvent::DiscoveryCompleted { preferred }), SmRole::Master);
    }

    #[test]
    fn test_arbitration_ignores_peer_order() {
        let local = SmCandidate::new(Guid(50), 4);
        let peers = vec![
            peer(40, 4, SmRole::Standby),
            peer(7, 6, SmRole::Standby),
            peer(5, 6, SmRole::Master),
            peer(60, 1, SmRole::Standby),
        ];
        let expected = arbitrate(local, &peers);
        assert_eq!(expected.map(|c| c.guid), Some(Guid(5)));

        let mut reversed = peers.clone();
        reversed.reverse();
        assert_eq!(arbitrate(local, &reversed), expected);
        let mut rotated = peers.clone();
        rotated.rotate_left(2);
        assert_eq!(arbitrate(local, &rotated), expected);
    }

    #[test]
    fn test_missed_polls_trigger_rearbitration() {
        let mut m = RoleStateMachine::new(SmCandidate::new(Guid(10), 1), 2);
        m.process_event(RoleEvent::DiscoveryCompleted {
            preferred: Some(SmCandidate::new(Guid(2), 9)),
        });

        m.process_event(RoleEvent::PollFailed);
        m.process_event(RoleEvent::PollSucceeded);
        assert_eq!(m.retries(), 0);

        assert_eq!(m.process_event(RoleEvent::PollFailed), SmRole::Standby);
        assert_eq!(m.process_event(RoleEvent::PollFailed), SmRole::Standby);
        assert_eq!(m.process_event(RoleEvent::PollFailed), SmRole::Discovering);
        assert_eq!(m.master(), None);
    }

    #[test]
    fn test_handover_promotes_standby() {
        let mut m = RoleStateMachine::new(SmCandidate::new(Guid(10), 1), 2);
        m.process_event(RoleEvent::DiscoveryCompleted {
            preferred: Some(SmCandidate::new(Guid(2), 9)),
        });
        assert_eq!(m.process_event(RoleEvent::HandoverReceived), SmRole::Master);
    }

    #[test]
    fn test_master_yields_only_to_preferred_peer() {
        let local = SmCandidate::new(Guid(10), 5);
        let mut m = RoleStateMachine::new(local, 2);
        m.process_event(RoleEvent::DiscoveryCompleted { preferred: None });

        let weaker = SmCandidate::new(Guid(20), 5);
        assert_eq!(m.process_event(RoleEvent::RemoteMasterDetected(weaker)), SmRole::Master);

        let stronger = SmCandidate::new(Guid(30), 9);
        assert_eq!(
            m.process_event(RoleEvent::PreferredStandbyDetected(stronger)),
            SmRole::Standby
        );
        assert_eq!(m.master(), Some(stronger));
    }

    #[test]
    fn test_poll_events_ignored_outside_standby() {
        let mut m = RoleStateMachine::new(SmCandidate::new(Guid(10), 5), 0);
        assert_eq!(m.process_event(RoleEvent::PollFailed), SmRole::Discovering);
        m.process_event(RoleEvent::DiscoveryCompleted { preferred: None });
        assert_eq!(m.process_event(RoleEvent::PollFailed), SmRole::Master);
    }

    #[test]
    fn test_manager_reports_transition() {
        let manager = RoleManager::new(SmCandidate::new(Guid(1), 0), 1);
        let (before, after) =
            manager.process_event(RoleEvent::DiscoveryCompleted { preferred: None });
        assert_eq!((before, after), (SmRole::Discovering, SmRole::Master));
        assert_eq!(manager.snapshot().role(), SmRole::Master);
        assert_eq!(manager.master(), None);
    }
}
