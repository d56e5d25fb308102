//! One named instance and its provisioning/boot lifecycle.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::CanneryError;
use crate::flow::event_loop::{FlowContext, run_event_loop};
use crate::flow::provision::ProvisionFlow;
use crate::flow::{Event, Flow};
use crate::host::HostStorage;
use crate::hypervisor::{Hypervisor, Session, SessionState};
use crate::identity::{HardwareModel, IdentityStore};
use crate::lifecycle::{LifecycleState, Transition};
use crate::lock::InstanceLock;
use crate::options::{Options, OptionsStore};
use crate::registry::Registry;
use crate::workers::WorkerContext;

const TRANSITION_CAPACITY: usize = 64;

pub struct Instance {
    name: String,
    dir: PathBuf,
    hypervisor: Arc<dyn Hypervisor>,
    host: Arc<dyn HostStorage>,
    options: Mutex<Options>,
    state: watch::Sender<LifecycleState>,
    transitions: broadcast::Sender<Transition>,
    download_progress: watch::Sender<f64>,
    install_progress: watch::Sender<f64>,
    last_error: Mutex<Option<String>>,
    session: Mutex<Option<Arc<dyn Session>>>,
    commands: mpsc::Sender<Event>,
    command_rx: tokio::sync::Mutex<mpsc::Receiver<Event>>,
    in_flight: AtomicBool,
    /// Held from the start of `boot` until the session ends.
    lock: Mutex<Option<InstanceLock>>,
}

/// Clears the in-flight flag when a provisioning pass ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Instance {
    /// Open the instance stored in `dir`, loading (or creating) its options.
    pub fn open(
        dir: impl Into<PathBuf>,
        hypervisor: Arc<dyn Hypervisor>,
        host: Arc<dyn HostStorage>,
    ) -> Result<Self, CanneryError> {
        let dir = dir.into();
        let options = OptionsStore::load_or_create(&dir, None)?;
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| options.name.clone());
        let (commands, command_rx) = mpsc::channel(8);

        Ok(Self {
            name,
            dir,
            hypervisor,
            host,
            options: Mutex::new(options),
            state: watch::channel(LifecycleState::Unknown).0,
            transitions: broadcast::channel(TRANSITION_CAPACITY).0,
            download_progress: watch::channel(0.0).0,
            install_progress: watch::channel(0.0).0,
            last_error: Mutex::new(None),
            session: Mutex::new(None),
            commands,
            command_rx: tokio::sync::Mutex::new(command_rx),
            in_flight: AtomicBool::new(false),
            lock: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn options(&self) -> Options {
        self.options.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Persist new options. They apply from the next `boot`.
    pub fn set_options(&self, options: Options) -> Result<(), CanneryError> {
        options.validate()?;
        OptionsStore::save(&self.dir, &options)?;
        *self.options.lock().unwrap_or_else(|e| e.into_inner()) = options;
        Ok(())
    }

    /// Whether this instance has been installed.
    pub fn is_installed(&self) -> bool {
        IdentityStore::new(&self.dir).exists::<HardwareModel>()
    }

    pub fn state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.transitions.subscribe()
    }

    pub fn download_progress(&self) -> watch::Receiver<f64> {
        self.download_progress.subscribe()
    }

    pub fn install_progress(&self) -> watch::Receiver<f64> {
        self.install_progress.subscribe()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Session of the running instance, if any.
    pub fn session(&self) -> Option<Arc<dyn Session>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Ask the running provisioning pass to abandon its download. Has no
    /// effect outside `DownloadingInstaller`.
    pub fn cancel_download(&self) {
        if self.commands.try_send(Event::CancelDownload).is_err() {
            tracing::debug!(name = %self.name, "cancel request dropped");
        }
    }

    /// Run one provisioning pass: install if needed, then start a session.
    ///
    /// `view_size` is the viewer size used by automatic display sizing.
    /// Fails with `ProvisioningInFlight` if a pass is already running for
    /// this instance, with `InstanceBusy` if another process owns it, and
    /// with `DownloadCancelled` if the download was cancelled (the state is
    /// then `Unknown`, not `Error`).
    pub async fn boot(&self, view_size: Option<(u32, u32)>) -> Result<(), CanneryError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CanneryError::ProvisioningInFlight {
                name: self.name.clone(),
            });
        }
        let _guard = InFlight(&self.in_flight);

        self.reap_stopped_session();
        {
            let mut lock = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            if lock.is_none() {
                *lock = Some(InstanceLock::acquire(&self.dir, &self.name)?);
            }
        }

        let mut command_rx = self.command_rx.lock().await;
        // Drop commands sent while nothing was in flight.
        while command_rx.try_recv().is_ok() {}

        let hardware_model_present = self.is_installed();
        tracing::info!(name = %self.name, hardware_model_present, "provisioning");

        let worker = Arc::new(WorkerContext {
            dir: self.dir.clone(),
            options: self.options(),
            hypervisor: self.hypervisor.clone(),
            host: self.host.clone(),
            view_size,
            download_progress: self.download_progress.clone(),
            install_progress: self.install_progress.clone(),
            cancel: CancellationToken::new(),
            configuration: Mutex::new(None),
            session: Mutex::new(None),
            failure: Mutex::new(None),
        });

        let mut ctx = FlowContext {
            command_rx: &mut *command_rx,
            state_tx: &self.state,
            transition_tx: &self.transitions,
            worker: worker.clone(),
        };
        let final_state = run_event_loop(
            &ProvisionFlow,
            Event::Started {
                hardware_model_present,
            },
            &mut ctx,
        )
        .await?;

        let session = worker
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let failure = worker
            .failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        match final_state {
            LifecycleState::Running => {
                *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = None;
                *self.session.lock().unwrap_or_else(|e| e.into_inner()) = session;
                Ok(())
            }
            LifecycleState::Error => {
                self.release_lock();
                let error = failure.unwrap_or_else(|| CanneryError::Hypervisor {
                    message: "provisioning failed".into(),
                });
                *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(error.to_string());
                Err(error)
            }
            _ => {
                self.release_lock();
                Err(CanneryError::DownloadCancelled)
            }
        }
    }

    /// Stop the running session, if any.
    pub async fn stop(&self) -> Result<(), CanneryError> {
        let session = self
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(session) = session {
            tracing::info!(name = %self.name, "stopping session");
            session.stop().await?;
            self.end_session();
        }
        Ok(())
    }

    /// Stop any session, then move the instance directory to the trash.
    /// Refused while another process owns the instance.
    pub async fn delete(self, registry: &Registry) -> Result<PathBuf, CanneryError> {
        self.stop().await?;
        let _lock = InstanceLock::acquire(&self.dir, &self.name)?;
        registry.delete(&self.name)
    }

    /// Forget a session that ended on its own (guest power-off, crash).
    fn reap_stopped_session(&self) {
        let mut slot = self.session.lock().unwrap_or_else(|e| e.into_inner());
        let ended = slot
            .as_ref()
            .is_some_and(|s| matches!(*s.state().borrow(), SessionState::Stopped | SessionState::Error));
        if ended {
            slot.take();
            drop(slot);
            tracing::info!(name = %self.name, "session ended on its own");
            self.end_session();
        }
    }

    /// Leave `Running` through the provisioning flow and publish the change.
    fn end_session(&self) {
        let old = *self.state.borrow();
        if old == LifecycleState::Running {
            let event = Event::SessionStopped;
            let (new, _) = ProvisionFlow.transition(&old, &event);
            tracing::info!(from = %old, to = %new, "lifecycle transition");
            self.state.send_replace(new);
            let _ = self.transitions.send(Transition::new(old, new, event));
        }
        self.release_lock();
    }

    fn release_lock(&self) {
        self.lock.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::LocalHost;
    use crate::hypervisor::SessionState;
    use crate::hypervisor::fake::FakeHypervisor;
    use crate::image::tests::serve;
    use crate::paths;
    use std::time::Duration;

    /// Minimal ISO-ish payload; the fake hypervisor only needs it non-empty.
    fn payload() -> Vec<u8> {
        vec![0x42; 256 * 1024]
    }

    fn open(dir: &Path, hv: Arc<FakeHypervisor>) -> Instance {
        std::fs::create_dir_all(dir).unwrap();
        Instance::open(dir, hv, Arc::new(LocalHost)).unwrap()
    }

    /// Distinct states in the order they were entered.
    fn states(mut rx: broadcast::Receiver<Transition>) -> Vec<LifecycleState> {
        let mut seen = vec![LifecycleState::Unknown];
        while let Ok(t) = rx.try_recv() {
            if t.is_change() {
                seen.push(t.new_state);
            }
        }
        seen
    }

    #[tokio::test]
    async fn fresh_instance_downloads_installs_and_runs() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("vm");
        let hv = Arc::new(FakeHypervisor::new(serve(payload(), false).await));
        let instance = open(&dir, hv.clone());
        let transitions = instance.subscribe();
        let download = instance.download_progress();
        let install = instance.install_progress();

        instance.boot(None).await.unwrap();

        assert_eq!(
            states(transitions),
            vec![
                LifecycleState::Unknown,
                LifecycleState::DownloadingInstaller,
                LifecycleState::InstallingOs,
                LifecycleState::Running,
            ]
        );
        assert_eq!(*instance.state().borrow(), LifecycleState::Running);
        assert_eq!(*download.borrow(), 1.0);
        assert_eq!(*install.borrow(), 1.0);
        assert!(paths::restore_image_path(&dir).exists());
        assert!(instance.is_installed());
        assert_eq!(hv.installs.load(Ordering::SeqCst), 1);
        assert_eq!(hv.starts.load(Ordering::SeqCst), 1);

        let session = instance.session().unwrap();
        assert_eq!(*session.state().borrow(), SessionState::Running);
        assert!(instance.last_error().is_none());
    }

    #[tokio::test]
    async fn installed_instance_boots_directly() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("vm");
        std::fs::create_dir_all(&dir).unwrap();
        IdentityStore::new(&dir)
            .create(&HardwareModel::from_bytes(b"fake-model-v1".to_vec()))
            .unwrap();

        // An unreachable URL proves nothing is downloaded.
        let hv = Arc::new(FakeHypervisor::new("http://127.0.0.1:9/unreachable.iso"));
        let instance = open(&dir, hv.clone());
        let transitions = instance.subscribe();

        instance.boot(None).await.unwrap();

        assert_eq!(
            states(transitions),
            vec![LifecycleState::Unknown, LifecycleState::Running]
        );
        assert_eq!(hv.installs.load(Ordering::SeqCst), 0);
        assert!(!paths::restore_image_path(&dir).exists());
    }

    #[tokio::test]
    async fn cached_installer_skips_download() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("vm");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(paths::restore_image_path(&dir), payload()).unwrap();

        let hv = Arc::new(FakeHypervisor::new("http://127.0.0.1:9/unreachable.iso"));
        let instance = open(&dir, hv);
        let transitions = instance.subscribe();

        instance.boot(None).await.unwrap();
        assert_eq!(
            states(transitions),
            vec![
                LifecycleState::Unknown,
                LifecycleState::InstallingOs,
                LifecycleState::Running,
            ]
        );
    }

    #[tokio::test]
    async fn cancel_returns_to_unknown_without_cache_file() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("vm");
        let hv = Arc::new(FakeHypervisor::new(serve(payload(), true).await));
        let instance = Arc::new(open(&dir, hv.clone()));

        let mut state = instance.state();
        let canceller = instance.clone();
        tokio::spawn(async move {
            state
                .wait_for(|s| *s == LifecycleState::DownloadingInstaller)
                .await
                .map(|_| ())
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            canceller.cancel_download();
        });

        let err = instance.boot(None).await.unwrap_err();
        assert!(matches!(err, CanneryError::DownloadCancelled));
        assert_eq!(*instance.state().borrow(), LifecycleState::Unknown);
        assert!(!paths::restore_image_path(&dir).exists());
        assert!(!paths::restore_image_part_path(&dir).exists());
        assert!(!instance.is_installed());
        assert_eq!(hv.installs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_after_download_finished_is_ignored() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("vm");
        let hv = Arc::new(FakeHypervisor {
            model_delay: Duration::from_millis(300),
            ..FakeHypervisor::new(serve(payload(), false).await)
        });
        let instance = Arc::new(open(&dir, hv));
        let transitions = instance.subscribe();

        let booting = {
            let instance = instance.clone();
            tokio::spawn(async move { instance.boot(None).await })
        };
        instance
            .state()
            .wait_for(|s| *s == LifecycleState::InstallingOs)
            .await
            .map(|_| ())
            .unwrap();
        // Still deriving the hardware model.
        assert!(!instance.is_installed());
        instance.cancel_download();

        booting.await.unwrap().unwrap();
        assert_eq!(
            states(transitions),
            vec![
                LifecycleState::Unknown,
                LifecycleState::DownloadingInstaller,
                LifecycleState::InstallingOs,
                LifecycleState::Running,
            ]
        );
        assert!(instance.is_installed());
    }

    #[tokio::test]
    async fn cancel_racing_download_completion_never_skips_ahead() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("vm");
        let hv = Arc::new(FakeHypervisor {
            model_delay: Duration::from_millis(300),
            ..FakeHypervisor::new(serve(payload(), false).await)
        });
        let instance = Arc::new(open(&dir, hv));
        let transitions = instance.subscribe();

        let booting = {
            let instance = instance.clone();
            tokio::spawn(async move { instance.boot(None).await })
        };
        let image = paths::restore_image_path(&dir);
        while !image.exists() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        instance.cancel_download();

        let result = booting.await.unwrap();
        let seen = states(transitions);
        match result {
            Ok(()) => assert_eq!(
                seen,
                vec![
                    LifecycleState::Unknown,
                    LifecycleState::DownloadingInstaller,
                    LifecycleState::InstallingOs,
                    LifecycleState::Running,
                ]
            ),
            Err(CanneryError::DownloadCancelled) => {
                assert_eq!(
                    seen,
                    vec![
                        LifecycleState::Unknown,
                        LifecycleState::DownloadingInstaller,
                        LifecycleState::Unknown,
                    ]
                );
                assert_eq!(*instance.state().borrow(), LifecycleState::Unknown);
                assert!(!instance.is_installed());
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[tokio::test]
    async fn failure_moves_to_error_and_is_returned() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("vm");
        std::fs::create_dir_all(&dir).unwrap();
        IdentityStore::new(&dir)
            .create(&HardwareModel::from_bytes(b"fake-model-v1".to_vec()))
            .unwrap();

        let hv = Arc::new(FakeHypervisor {
            fail_validation: true,
            ..FakeHypervisor::new("")
        });
        let instance = open(&dir, hv);

        let err = instance.boot(None).await.unwrap_err();
        assert!(matches!(err, CanneryError::Hypervisor { .. }));
        assert_eq!(*instance.state().borrow(), LifecycleState::Error);
        assert!(instance.last_error().unwrap().contains("configuration rejected"));
        assert!(instance.session().is_none());
        // A failed pass gives the instance up.
        InstanceLock::acquire(&dir, "vm").unwrap();
    }

    #[tokio::test]
    async fn retry_after_error_succeeds() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("vm");
        std::fs::create_dir_all(&dir).unwrap();

        // First attempt: the download URL is refused.
        let hv = Arc::new(FakeHypervisor::new("http://127.0.0.1:9/refused.iso"));
        let instance = open(&dir, hv.clone());
        assert!(matches!(
            instance.boot(None).await,
            Err(CanneryError::DownloadFailed { .. })
        ));
        assert_eq!(*instance.state().borrow(), LifecycleState::Error);

        *hv.image_url.lock().unwrap() = serve(payload(), false).await;
        instance.boot(None).await.unwrap();
        assert_eq!(*instance.state().borrow(), LifecycleState::Running);
    }

    #[tokio::test]
    async fn second_boot_while_in_flight_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("vm");
        let hv = Arc::new(FakeHypervisor::new(serve(payload(), true).await));
        let instance = Arc::new(open(&dir, hv));

        let first = {
            let instance = instance.clone();
            tokio::spawn(async move { instance.boot(None).await })
        };
        instance
            .state()
            .wait_for(|s| *s == LifecycleState::DownloadingInstaller)
            .await
            .map(|_| ())
            .unwrap();

        assert!(matches!(
            instance.boot(None).await,
            Err(CanneryError::ProvisioningInFlight { .. })
        ));

        instance.cancel_download();
        assert!(matches!(
            first.await.unwrap(),
            Err(CanneryError::DownloadCancelled)
        ));
    }

    #[tokio::test]
    async fn stop_ends_session() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("vm");
        std::fs::create_dir_all(&dir).unwrap();
        IdentityStore::new(&dir)
            .create(&HardwareModel::from_bytes(b"fake-model-v1".to_vec()))
            .unwrap();
        let instance = open(&dir, Arc::new(FakeHypervisor::new("")));
        instance.boot(None).await.unwrap();

        let session = instance.session().unwrap();
        instance.stop().await.unwrap();
        assert_eq!(*session.state().borrow(), SessionState::Stopped);
        assert!(instance.session().is_none());
        assert_eq!(*instance.state().borrow(), LifecycleState::Unknown);

        // Stopped instances can boot again.
        instance.boot(None).await.unwrap();
        assert_eq!(*instance.state().borrow(), LifecycleState::Running);
    }

    #[tokio::test]
    async fn stop_is_published_to_subscribers() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("vm");
        std::fs::create_dir_all(&dir).unwrap();
        IdentityStore::new(&dir)
            .create(&HardwareModel::from_bytes(b"fake-model-v1".to_vec()))
            .unwrap();
        let instance = open(&dir, Arc::new(FakeHypervisor::new("")));
        instance.boot(None).await.unwrap();

        let mut transitions = instance.subscribe();
        instance.stop().await.unwrap();
        let t = transitions.try_recv().unwrap();
        assert_eq!(t.old_state, LifecycleState::Running);
        assert_eq!(t.new_state, LifecycleState::Unknown);
        assert_eq!(t.event, Event::SessionStopped);
    }

    #[tokio::test]
    async fn guest_power_off_allows_boot_again() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("vm");
        std::fs::create_dir_all(&dir).unwrap();
        IdentityStore::new(&dir)
            .create(&HardwareModel::from_bytes(b"fake-model-v1".to_vec()))
            .unwrap();
        let hv = Arc::new(FakeHypervisor::new(""));
        let instance = open(&dir, hv.clone());
        instance.boot(None).await.unwrap();

        // The guest shuts itself down; nobody calls `stop`.
        instance.session().unwrap().stop().await.unwrap();
        let transitions = instance.subscribe();

        instance.boot(None).await.unwrap();
        // Initial state, the reaped session, the new session.
        assert_eq!(
            states(transitions),
            vec![
                LifecycleState::Unknown,
                LifecycleState::Unknown,
                LifecycleState::Running,
            ]
        );
        assert_eq!(hv.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn instance_owned_elsewhere_refuses_boot_and_delete() {
        let root = tempfile::tempdir().unwrap();
        let registry = Registry::open(root.path()).unwrap();
        let dir = registry.create(&Options::named("vm")).unwrap();
        IdentityStore::new(&dir)
            .create(&HardwareModel::from_bytes(b"fake-model-v1".to_vec()))
            .unwrap();

        // Two handles on one directory stand in for two processes.
        let owner = open(&dir, Arc::new(FakeHypervisor::new("")));
        owner.boot(None).await.unwrap();

        let other = open(&dir, Arc::new(FakeHypervisor::new("")));
        assert!(matches!(
            other.boot(None).await,
            Err(CanneryError::InstanceBusy { .. })
        ));
        assert_eq!(*other.state().borrow(), LifecycleState::Unknown);
        assert!(matches!(
            other.delete(&registry).await,
            Err(CanneryError::InstanceBusy { .. })
        ));
        assert!(dir.exists());

        owner.stop().await.unwrap();
        let other = open(&dir, Arc::new(FakeHypervisor::new("")));
        other.boot(None).await.unwrap();
    }

    #[tokio::test]
    async fn delete_stops_session_then_trashes() {
        let root = tempfile::tempdir().unwrap();
        let registry = Registry::open(root.path()).unwrap();
        let dir = registry.create(&Options::named("vm")).unwrap();
        IdentityStore::new(&dir)
            .create(&HardwareModel::from_bytes(b"fake-model-v1".to_vec()))
            .unwrap();
        let instance = open(&dir, Arc::new(FakeHypervisor::new("")));
        instance.boot(None).await.unwrap();
        let session = instance.session().unwrap();

        let trashed = instance.delete(&registry).await.unwrap();
        assert_eq!(*session.state().borrow(), SessionState::Stopped);
        assert!(!dir.exists());
        assert!(trashed.join("machw.bin").exists());
    }

    #[test]
    fn set_options_persists() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("vm");
        let instance = open(&dir, Arc::new(FakeHypervisor::new("")));

        let mut options = instance.options();
        options.memory_gb = 8.0;
        instance.set_options(options).unwrap();

        let reloaded = OptionsStore::load_or_create(&dir, None).unwrap();
        assert_eq!(reloaded.memory_gb, 8.0);
        assert_eq!(reloaded.name, "vm");
    }
}
