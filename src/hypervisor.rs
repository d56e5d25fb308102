//! Capabilities consumed from the host hypervisor.
//!
//! The lifecycle code only talks to these traits; `backend::qemu` is the
//! concrete adapter used by the binary.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::configuration::VmConfiguration;
use crate::error::CanneryError;
use crate::identity::{AuxiliaryStorage, HardwareModel};
use crate::image::ImageDescriptor;
use crate::options::Options;

/// Resource bounds reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub min_cpus: u32,
    pub max_cpus: u32,
    pub min_memory: u64,
    pub max_memory: u64,
}

/// State of a running hypervisor session. Observed, never driven, by the
/// lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartOptions {
    pub boot_to_recovery: bool,
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    fn name(&self) -> &str;

    fn limits(&self) -> Limits;

    /// Latest installer this hypervisor can install from.
    async fn latest_image(&self) -> Result<ImageDescriptor, CanneryError>;

    /// Derive the hardware model an installer image requires. Fails with
    /// `RestoreImageBad` when the image has no usable configuration.
    async fn hardware_model_for(&self, image: &Path) -> Result<HardwareModel, CanneryError>;

    /// Fresh boot variable store bound to `model`.
    fn create_auxiliary_storage(
        &self,
        model: &HardwareModel,
    ) -> Result<AuxiliaryStorage, CanneryError>;

    fn validate(&self, config: &VmConfiguration) -> Result<(), CanneryError>;

    /// Run the installer from `image` to completion, reporting fractions on
    /// `progress`. Returns the session that ran it so the caller can wait
    /// for it to stop.
    async fn install(
        &self,
        config: &VmConfiguration,
        image: &Path,
        progress: &watch::Sender<f64>,
    ) -> Result<Arc<dyn Session>, CanneryError>;

    async fn start(
        &self,
        config: &VmConfiguration,
        options: StartOptions,
    ) -> Result<Arc<dyn Session>, CanneryError>;

    /// Optional platform-specific configuration. `None` means the extended
    /// options are ignored.
    fn extensions(&self) -> Option<&dyn PlatformExtensions> {
        None
    }
}

#[async_trait]
pub trait Session: Send + Sync {
    fn state(&self) -> watch::Receiver<SessionState>;

    async fn stop(&self) -> Result<(), CanneryError>;
}

/// Extended settings (debug stub, alternate boot stages, remote display)
/// that only some hypervisors support.
pub trait PlatformExtensions: Send + Sync {
    fn apply(&self, options: &Options, config: &mut VmConfiguration) -> Result<(), CanneryError>;
}

/// Wait until `session` reports `Stopped`, giving up after `timeout`.
pub async fn wait_for_stopped(session: &dyn Session, timeout: Duration) -> Result<(), CanneryError> {
    let mut rx = session.state();
    let waited = tokio::time::timeout(timeout, async {
        rx.wait_for(|s| *s == SessionState::Stopped).await.map(|_| ())
    })
    .await;
    match waited {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) => Err(CanneryError::Hypervisor {
            message: "session went away before reporting stopped".into(),
        }),
        Err(_) => Err(CanneryError::Hypervisor {
            message: format!("session did not stop within {}s", timeout.as_secs()),
        }),
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeSession;
    use super::*;

    #[tokio::test]
    async fn wait_for_stopped_resolves_on_transition() {
        let session = FakeSession::new(SessionState::Running);
        let flip = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            flip.set(SessionState::Stopping);
            flip.set(SessionState::Stopped);
        });
        wait_for_stopped(session.as_ref(), Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wait_for_stopped_times_out() {
        let session = FakeSession::new(SessionState::Running);
        let err = wait_for_stopped(session.as_ref(), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, CanneryError::Hypervisor { .. }));
    }

    #[test]
    fn session_state_names() {
        assert_eq!(SessionState::Stopped.to_string(), "stopped");
        assert_eq!(SessionState::Paused.to_string(), "paused");
    }
}
