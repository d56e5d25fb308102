//! Event-driven provisioning.
//!
//! A `Flow` is a set of pure transition rules mapping
//! `(LifecycleState, Event) -> (LifecycleState, Vec<Effect>)`. The event loop
//! drives a flow by dispatching effects to workers and feeding their
//! completion events back in.

pub mod event_loop;
pub mod provision;

use std::fmt;
use std::path::PathBuf;

use crate::error::CanneryError;
use crate::lifecycle::LifecycleState;

/// Where in the pass a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ResolveImage,
    Download,
    Configure,
    Install,
    Boot,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResolveImage => write!(f, "locating installer"),
            Self::Download => write!(f, "downloading installer"),
            Self::Configure => write!(f, "configuring"),
            Self::Install => write!(f, "installing"),
            Self::Boot => write!(f, "starting"),
        }
    }
}

// ── Events ──────────────────────────────────────────────────────────

/// Events emitted by workers or received from clients.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Pass just started. Carries whether `machw.bin` exists.
    Started { hardware_model_present: bool },

    // Worker completion events
    ImageAvailable(PathBuf),
    ImageMissing,
    ImageDownloaded(PathBuf),
    DownloadCancelled,
    Configured { install_image: Option<PathBuf> },
    InstallComplete,
    SessionStarted,
    Failed { stage: Stage, message: String },

    // Client command events
    CancelDownload,

    /// The running session is gone, stopped by us or by the guest.
    SessionStopped,
}

// ── Effects ─────────────────────────────────────────────────────────

/// Effects dispatched to workers by the event loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Look for an override or cached installer.
    ResolveImage,
    /// Ask the hypervisor for the latest installer and download it.
    DownloadImage,
    /// Cancel the in-flight download. Handled by the loop itself.
    AbortDownload,
    /// Commit the hardware identity (when installing) and assemble the
    /// VM configuration.
    Configure { install_image: Option<PathBuf> },
    /// Run the installer and wait for the VM to stop.
    Install { image: PathBuf },
    /// Start a hypervisor session from the assembled configuration.
    Boot,
}

// ── Flow trait ──────────────────────────────────────────────────────

pub trait Flow: Send + Sync {
    /// Which states this flow can start from.
    fn valid_entry_states(&self) -> &[LifecycleState];

    /// Pure transition: given current state and an event, return the new
    /// state and any effects to dispatch.
    ///
    /// Unknown events should return the current state unchanged with no
    /// effects (log a warning).
    fn transition(&self, state: &LifecycleState, event: &Event) -> (LifecycleState, Vec<Effect>);
}

pub(crate) fn flow_requires_state(
    state: &LifecycleState,
    valid: &[LifecycleState],
) -> Result<(), CanneryError> {
    if valid.contains(state) {
        Ok(())
    } else {
        Err(CanneryError::Validation {
            message: format!("instance is {state}; it must be idle or failed to boot"),
        })
    }
}
