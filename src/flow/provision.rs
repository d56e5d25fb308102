//! Provision flow: from an idle instance to a running session, installing
//! first when the instance has no hardware identity yet.

use super::{Effect, Event, Flow};
use crate::lifecycle::LifecycleState;

pub struct ProvisionFlow;

impl Flow for ProvisionFlow {
    fn valid_entry_states(&self) -> &[LifecycleState] {
        &[LifecycleState::Unknown, LifecycleState::Error]
    }

    fn transition(&self, state: &LifecycleState, event: &Event) -> (LifecycleState, Vec<Effect>) {
        use LifecycleState::*;

        match (state, event) {
            // ── Entry ──
            (Unknown | Error, Event::Started { hardware_model_present: true }) => {
                (Unknown, vec![Effect::Configure { install_image: None }])
            }
            (Unknown | Error, Event::Started { hardware_model_present: false }) => {
                (Unknown, vec![Effect::ResolveImage])
            }

            // ── Installer lookup ──
            (Unknown, Event::ImageAvailable(path)) => (
                InstallingOs,
                vec![Effect::Configure {
                    install_image: Some(path.clone()),
                }],
            ),
            (Unknown, Event::ImageMissing) => {
                (DownloadingInstaller, vec![Effect::DownloadImage])
            }

            // ── Download ──
            // Once the image is on disk the download is over, so a later
            // cancel finds InstallingOs and is ignored.
            (DownloadingInstaller, Event::ImageDownloaded(path)) => (
                InstallingOs,
                vec![Effect::Configure {
                    install_image: Some(path.clone()),
                }],
            ),
            (DownloadingInstaller, Event::CancelDownload) => {
                (Unknown, vec![Effect::AbortDownload])
            }
            (DownloadingInstaller | Unknown, Event::DownloadCancelled) => (Unknown, vec![]),

            // ── Configured → install or boot ──
            (InstallingOs, Event::Configured { install_image: Some(image) }) => {
                (InstallingOs, vec![Effect::Install { image: image.clone() }])
            }
            (Unknown, Event::Configured { install_image: None }) => (Unknown, vec![Effect::Boot]),

            // ── Install finished → boot ──
            (InstallingOs, Event::InstallComplete) => (InstallingOs, vec![Effect::Boot]),

            // ── Session up ──
            (Unknown | InstallingOs, Event::SessionStarted) => (Running, vec![]),
            (Running, Event::SessionStopped) => (Unknown, vec![]),

            // ── Failures ──
            (_, Event::Failed { .. }) => (Error, vec![]),

            // ── Unknown event → same state, no effects ──
            _ => {
                tracing::warn!(?state, ?event, "ignoring event");
                (*state, vec![])
            }
        }
    }
}
