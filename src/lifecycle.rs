//! Shared vocabulary for instance lifecycle state.
//!
//! `LifecycleState` is written by the provisioning event loop, and by
//! `Instance` when a running session ends. Both go through `ProvisionFlow`.
//! Everyone else observes it through a `watch` receiver or the `Transition`
//! broadcast.

use std::fmt;

use crate::flow::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Nothing in flight. Also where a cancelled download lands.
    Unknown,

    /// Fetching the installer into the instance's cache.
    DownloadingInstaller,

    /// Hardware identity committed, installer running.
    InstallingOs,

    /// Handed to a hypervisor session. From here the session's own
    /// state is what changes.
    Running,

    /// A provisioning pass failed. Cleared by the next `boot`.
    Error,
}

impl LifecycleState {
    /// Terminal states end a provisioning pass.
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Running | LifecycleState::Error)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "idle"),
            Self::DownloadingInstaller => write!(f, "downloading installer"),
            Self::InstallingOs => write!(f, "installing"),
            Self::Running => write!(f, "running"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A state change published by the event loop.
#[derive(Debug, Clone)]
pub struct Transition {
    pub old_state: LifecycleState,
    pub new_state: LifecycleState,
    pub event: Event,
}

impl Transition {
    pub fn new(old: LifecycleState, new: LifecycleState, event: Event) -> Self {
        Self {
            old_state: old,
            new_state: new,
            event,
        }
    }

    /// Whether the state actually changed.
    pub fn is_change(&self) -> bool {
        self.old_state != self.new_state
    }
}
