//! Connectivity state machine.
//!
//! Tracks whether the remote authority is worth talking to. Two inputs move
//! it: the environment's reachability signal and the outcome of exchanges.

use serde::{Deserialize, Serialize};

/// Link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkState {
    Online,
    Offline,
}

/// Why the link is offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OfflineCause {
    /// The environment reports no network
    Unreachable,
    /// An exchange failed or timed out while the environment looked reachable
    TransportFailure,
}

/// A state change the caller must act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Reconcile immediately, without debouncing
    WentOnline,
    /// Persist pending changes and stop attempting
    WentOffline(OfflineCause),
}

/// The connectivity monitor.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    state: LinkState,
    cause: Option<OfflineCause>,
}

impl ConnectivityMonitor {
    /// Create a monitor from the reachability signal at startup.
    pub fn new(initially_online: bool) -> Self {
        if initially_online {
            Self {
                state: LinkState::Online,
                cause: None,
            }
        } else {
            Self {
                state: LinkState::Offline,
                cause: Some(OfflineCause::Unreachable),
            }
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn cause(&self) -> Option<OfflineCause> {
        self.cause
    }

    pub fn is_online(&self) -> bool {
        self.state == LinkState::Online
    }

    /// Feed an environment reachability event.
    pub fn observe(&mut self, reachable: bool) -> Option<Transition> {
        match (self.state, reachable) {
            (LinkState::Offline, true) => {
                self.go_online();
                Some(Transition::WentOnline)
            }
            (LinkState::Online, false) => Some(self.go_offline(OfflineCause::Unreachable)),
            (LinkState::Offline, false) => {
                // Already offline; the environment now explains why
                self.cause = Some(OfflineCause::Unreachable);
                None
            }
            (LinkState::Online, true) => None,
        }
    }

    /// Record a failed exchange.
    pub fn transport_failed(&mut self) -> Option<Transition> {
        match self.state {
            LinkState::Online => Some(self.go_offline(OfflineCause::TransportFailure)),
            LinkState::Offline => None,
        }
    }

    /// Try the link again after a transport failure.
    ///
    /// Only applies while offline because of a failed exchange; when the
    /// environment itself reports no network, nothing changes.
    pub fn retry_after_failure(&mut self) -> Option<Transition> {
        if self.state == LinkState::Offline && self.cause == Some(OfflineCause::TransportFailure) {
            self.go_online();
            Some(Transition::WentOnline)
        } else {
            None
        }
    }

    fn go_online(&mut self) {
        self.state = LinkState::Online;
        self.cause = None;
    }

    fn go_offline(&mut self, cause: OfflineCause) -> Transition {
        self.state = LinkState::Offline;
        self.cause = Some(cause);
        Transition::WentOffline(cause)
    }
}
