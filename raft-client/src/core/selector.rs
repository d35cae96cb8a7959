//! Leader-biased iteration over candidate servers.

use std::collections::VecDeque;

use crate::Address;

/// The iteration state of the selector.
///
/// `Reset` is a one-shot latch: it is armed whenever a new membership view supersedes the
/// current sweep, observed once by the connection manager when deciding whether to drop an
/// existing connection, and cleared by the first `next()` of the new sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SelectorState {
    /// A new membership view has been adopted and not yet acted upon.
    Reset,
    /// A sweep over the current candidates is underway or exhausted.
    Iterating,
}

/// Chooses which server to contact next.
///
/// Within one sweep each candidate is attempted at most once: the known leader first, then the
/// remaining members in configuration order with duplicates removed. Exhaustion signals "no
/// reachable server this sweep" to the connection manager.
pub(crate) struct AddressSelector {
    members: Vec<Address>,
    leader: Option<Address>,
    state: SelectorState,
    sweep: VecDeque<Address>,
}

impl AddressSelector {
    /// Create a new selector over the bootstrap member list.
    pub(crate) fn new(members: Vec<Address>) -> Self {
        let mut selector = Self {
            members: dedup(members),
            leader: None,
            state: SelectorState::Reset,
            sweep: VecDeque::new(),
        };
        selector.rebuild_sweep();
        selector
    }

    /// Clear the known leader and restore the full candidate list for a fresh sweep.
    pub(crate) fn reset(&mut self) {
        self.leader = None;
        self.state = SelectorState::Reset;
        self.rebuild_sweep();
    }

    /// Adopt a new membership view.
    ///
    /// A view identical to the current one is a no-op, so a handshake confirming what the
    /// selector already believes does not force the connection manager to reconnect.
    pub(crate) fn reset_with(&mut self, leader: Option<Address>, members: Vec<Address>) {
        let members = dedup(members);
        if leader == self.leader && members == self.members {
            return;
        }
        tracing::debug!(leader=?leader, "adopting new membership view");
        self.leader = leader;
        self.members = members;
        self.state = SelectorState::Reset;
        self.rebuild_sweep();
    }

    /// Check whether the current sweep has candidates remaining.
    pub(crate) fn has_next(&self) -> bool {
        !self.sweep.is_empty()
    }

    /// Take the next candidate of the current sweep, consuming the reset latch.
    pub(crate) fn next(&mut self) -> Option<Address> {
        let addr = self.sweep.pop_front();
        if addr.is_some() {
            self.state = SelectorState::Iterating;
        }
        addr
    }

    /// The last known leader, if any.
    pub(crate) fn leader(&self) -> Option<&Address> {
        self.leader.as_ref()
    }

    /// The current candidate list.
    pub(crate) fn servers(&self) -> &[Address] {
        &self.members
    }

    /// The current iteration state.
    pub(crate) fn state(&self) -> SelectorState {
        self.state
    }

    fn rebuild_sweep(&mut self) {
        self.sweep.clear();
        if let Some(leader) = &self.leader {
            self.sweep.push_back(leader.clone());
        }
        for member in &self.members {
            if self.leader.as_ref() != Some(member) {
                self.sweep.push_back(member.clone());
            }
        }
    }
}

/// Remove duplicate addresses while preserving configuration order.
fn dedup(members: Vec<Address>) -> Vec<Address> {
    let mut out: Vec<Address> = Vec::with_capacity(members.len());
    for member in members {
        if !out.contains(&member) {
            out.push(member);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs() -> Vec<Address> {
        vec![Address::new("a", 1), Address::new("b", 2), Address::new("c", 3)]
    }

    #[test]
    fn initial_sweep_follows_configuration_order() {
        let mut selector = AddressSelector::new(addrs());
        assert_eq!(selector.state(), SelectorState::Reset);
        assert_eq!(selector.next(), Some(Address::new("a", 1)));
        assert_eq!(selector.state(), SelectorState::Iterating);
        assert_eq!(selector.next(), Some(Address::new("b", 2)));
        assert_eq!(selector.next(), Some(Address::new("c", 3)));
        assert!(!selector.has_next());
        assert_eq!(selector.next(), None);
    }

    #[test]
    fn leader_is_tried_first_without_duplicates() {
        let mut selector = AddressSelector::new(addrs());
        selector.reset_with(Some(Address::new("b", 2)), addrs());
        assert_eq!(selector.state(), SelectorState::Reset);
        assert_eq!(selector.next(), Some(Address::new("b", 2)));
        assert_eq!(selector.next(), Some(Address::new("a", 1)));
        assert_eq!(selector.next(), Some(Address::new("c", 3)));
        assert_eq!(selector.next(), None);
    }

    #[test]
    fn reset_clears_leader_and_restores_full_list() {
        let mut selector = AddressSelector::new(addrs());
        selector.reset_with(Some(Address::new("c", 3)), addrs());
        while selector.next().is_some() {}
        selector.reset();
        assert_eq!(selector.leader(), None);
        assert_eq!(selector.state(), SelectorState::Reset);
        let sweep: Vec<_> = std::iter::from_fn(|| selector.next()).collect();
        assert_eq!(sweep, addrs());
    }

    #[test]
    fn identical_view_does_not_rearm_the_latch() {
        let mut selector = AddressSelector::new(addrs());
        selector.reset_with(Some(Address::new("b", 2)), addrs());
        assert_eq!(selector.next(), Some(Address::new("b", 2)));
        // Same leader and members: the sweep in progress must be preserved.
        selector.reset_with(Some(Address::new("b", 2)), addrs());
        assert_eq!(selector.state(), SelectorState::Iterating);
        assert_eq!(selector.next(), Some(Address::new("a", 1)));
    }

    #[test]
    fn changed_view_supersedes_the_sweep() {
        let mut selector = AddressSelector::new(addrs());
        assert_eq!(selector.next(), Some(Address::new("a", 1)));
        selector.reset_with(Some(Address::new("c", 3)), addrs());
        assert_eq!(selector.state(), SelectorState::Reset);
        assert_eq!(selector.next(), Some(Address::new("c", 3)));
    }

    #[test]
    fn duplicate_members_are_attempted_once_per_sweep() {
        let mut members = addrs();
        members.push(Address::new("a", 1));
        let mut selector = AddressSelector::new(members);
        assert_eq!(selector.servers().len(), 3);
        let sweep: Vec<_> = std::iter::from_fn(|| selector.next()).collect();
        assert_eq!(sweep, addrs());
    }
}
