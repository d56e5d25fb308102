//! Worker functions that carry out provisioning effects.
//!
//! Each function is a self-contained async operation over a shared
//! `WorkerContext`. They never touch the lifecycle state: the event loop
//! turns their results into events. No UI coupling; progress goes out
//! through the context's watch channels.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::configuration::{self, VmConfiguration};
use crate::error::CanneryError;
use crate::host::HostStorage;
use crate::hypervisor::{self, Hypervisor, Session, StartOptions};
use crate::identity::IdentityStore;
use crate::image;
use crate::options::Options;

/// Upper bound on how long the installer VM may take to report stopped
/// after the installer itself finished.
pub const INSTALL_STOP_TIMEOUT: Duration = Duration::from_secs(120);

/// Everything one provisioning pass needs, shared by its workers.
pub struct WorkerContext {
    pub dir: PathBuf,
    pub options: Options,
    pub hypervisor: Arc<dyn Hypervisor>,
    pub host: Arc<dyn HostStorage>,
    /// Viewer size sampled at boot, used by automatic display sizing.
    pub view_size: Option<(u32, u32)>,
    pub download_progress: watch::Sender<f64>,
    pub install_progress: watch::Sender<f64>,
    /// Cancels the in-flight download.
    pub cancel: CancellationToken,
    pub configuration: Mutex<Option<VmConfiguration>>,
    pub session: Mutex<Option<Arc<dyn Session>>>,
    /// First typed error of the pass, returned to the caller of `boot`.
    pub failure: Mutex<Option<CanneryError>>,
}

impl WorkerContext {
    fn configuration(&self) -> Result<VmConfiguration, CanneryError> {
        self.configuration
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| CanneryError::Hypervisor {
                message: "no configuration assembled".into(),
            })
    }

    pub fn record_failure(&self, error: CanneryError) {
        let mut slot = self.failure.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(error);
        }
    }
}

/// Installer already on disk, if any.
pub async fn resolve_image(ctx: &WorkerContext) -> Option<PathBuf> {
    image::resolve_local(&ctx.dir, &ctx.options)
}

/// Download the hypervisor's latest installer into the instance cache.
pub async fn download_image(ctx: &WorkerContext) -> Result<PathBuf, CanneryError> {
    let descriptor = tokio::select! {
        d = ctx.hypervisor.latest_image() => d?,
        _ = ctx.cancel.cancelled() => return Err(CanneryError::DownloadCancelled),
    };
    tracing::info!(url = %descriptor.url, version = %descriptor.version, "latest installer");
    image::download(&descriptor.url, &ctx.dir, &ctx.download_progress, &ctx.cancel).await
}

/// Commit the hardware identity when installing from `install_image`, then
/// assemble and validate the VM configuration.
pub async fn configure(
    ctx: &WorkerContext,
    install_image: Option<&Path>,
) -> Result<(), CanneryError> {
    if let Some(image) = install_image {
        let model = ctx.hypervisor.hardware_model_for(image).await?;
        IdentityStore::new(&ctx.dir).create(&model)?;
    }

    let config = configuration::assemble(
        &ctx.dir,
        &ctx.options,
        ctx.hypervisor.as_ref(),
        ctx.host.as_ref(),
        ctx.view_size,
    )?;
    *ctx.configuration.lock().unwrap_or_else(|e| e.into_inner()) = Some(config);
    Ok(())
}

/// Run the installer and wait for its VM to stop.
pub async fn install(ctx: &WorkerContext, image: &Path) -> Result<(), CanneryError> {
    let config = ctx.configuration()?;
    ctx.install_progress.send_replace(0.0);
    let session = ctx
        .hypervisor
        .install(&config, image, &ctx.install_progress)
        .await?;
    hypervisor::wait_for_stopped(session.as_ref(), INSTALL_STOP_TIMEOUT).await?;
    ctx.install_progress.send_replace(1.0);
    tracing::info!(image = %image.display(), "installation finished");
    Ok(())
}

/// Start a fresh session from the assembled configuration.
pub async fn boot(ctx: &WorkerContext) -> Result<(), CanneryError> {
    let config = ctx.configuration()?;
    let session = ctx
        .hypervisor
        .start(
            &config,
            StartOptions {
                boot_to_recovery: ctx.options.boot_to_recovery,
            },
        )
        .await?;
    *ctx.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(session);
    tracing::info!(name = %config.name, "session started");
    Ok(())
}
