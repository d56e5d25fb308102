//! Runs instances as `qemu-system-*` child processes.

use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use facet::Facet;
use tokio::process::Command;
use tokio::sync::{Notify, watch};

use crate::config::QemuConfig;
use crate::configuration::{InputMode, RemoteDisplay, VmConfiguration};
use crate::error::CanneryError;
use crate::hypervisor::{Hypervisor, Limits, PlatformExtensions, Session, SessionState, StartOptions};
use crate::identity::{AuxiliaryStorage, HardwareModel};
use crate::image::ImageDescriptor;
use crate::options::{Options, SerialPortKind};
use crate::paths;
use crate::util::GIB;

const MIB: u64 = 1024 * 1024;
const VNC_BASE_PORT: u16 = 5900;
/// ISO 9660 primary volume descriptor: "CD001" at byte 0x8001.
const ISO_MAGIC_OFFSET: usize = 0x8001;
const ISO_MAGIC: &[u8] = b"CD001";

/// What `machw.bin` holds for QEMU instances.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct QemuHardwareModel {
    pub arch: String,
    pub machine: String,
    pub firmware_code: String,
}

impl QemuHardwareModel {
    fn decode(model: &HardwareModel) -> Result<Self, CanneryError> {
        let text = std::str::from_utf8(model.as_bytes()).map_err(|_| CanneryError::Hypervisor {
            message: "hardware model is not a QEMU model".into(),
        })?;
        facet_json::from_str(text).map_err(|e| CanneryError::Hypervisor {
            message: format!("hardware model is not a QEMU model: {e}"),
        })
    }

    fn encode(&self) -> Result<HardwareModel, CanneryError> {
        let json = facet_json::to_string(self).map_err(|e| CanneryError::Hypervisor {
            message: format!("encoding hardware model: {e}"),
        })?;
        Ok(HardwareModel::from_bytes(json.into_bytes()))
    }
}

pub struct QemuHypervisor {
    config: QemuConfig,
    image_url: String,
    feed: String,
    variant: String,
    extensions: QemuExtensions,
}

impl QemuHypervisor {
    pub fn new(config: &crate::config::Config) -> Self {
        Self {
            config: config.qemu.clone(),
            image_url: config.image.url.clone(),
            feed: config.image.feed.clone(),
            variant: config.image.variant.clone(),
            extensions: QemuExtensions,
        }
    }

    /// Guest architecture, from the emulator binary's name.
    fn arch(&self) -> &str {
        self.config
            .binary
            .rsplit_once("qemu-system-")
            .map(|(_, arch)| arch)
            .unwrap_or("x86_64")
    }

    async fn spawn(&self, args: Vec<String>) -> Result<Arc<QemuSession>, CanneryError> {
        tracing::info!(binary = %self.config.binary, args = %args.join(" "), "starting qemu");
        let child = Command::new(&self.config.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CanneryError::Hypervisor {
                message: format!("failed to run {}: {e}", self.config.binary),
            })?;
        Ok(QemuSession::watch(child))
    }
}

#[async_trait]
impl Hypervisor for QemuHypervisor {
    fn name(&self) -> &str {
        "qemu"
    }

    fn limits(&self) -> Limits {
        Limits {
            min_cpus: 1,
            max_cpus: 255,
            min_memory: 512 * MIB,
            max_memory: self.config.max_memory_gb.saturating_mul(GIB),
        }
    }

    async fn latest_image(&self) -> Result<ImageDescriptor, CanneryError> {
        if !self.image_url.is_empty() {
            return Ok(ImageDescriptor {
                url: self.image_url.clone(),
                version: "custom".into(),
            });
        }
        let releases = fetch_releases(&self.feed).await?;
        pick_latest(releases, &self.variant, self.arch()).ok_or_else(|| {
            CanneryError::DownloadFailed {
                message: format!(
                    "no {} installer for {} listed in {}",
                    self.variant,
                    self.arch(),
                    self.feed
                ),
                source: "empty release feed".into(),
            }
        })
    }

    async fn hardware_model_for(&self, image: &Path) -> Result<HardwareModel, CanneryError> {
        let mut header = vec![0u8; ISO_MAGIC_OFFSET + ISO_MAGIC.len()];
        let readable = {
            use tokio::io::AsyncReadExt;
            let mut file = tokio::fs::File::open(image)
                .await
                .map_err(|e| CanneryError::io(format!("opening {}", image.display()), e))?;
            file.read_exact(&mut header).await.is_ok()
        };
        if !readable || &header[ISO_MAGIC_OFFSET..] != ISO_MAGIC {
            return Err(CanneryError::RestoreImageBad {
                message: format!("{} is not an ISO 9660 image", image.display()),
            });
        }

        QemuHardwareModel {
            arch: self.arch().to_string(),
            machine: self.config.machine.clone(),
            firmware_code: self.config.firmware_code.clone(),
        }
        .encode()
    }

    fn create_auxiliary_storage(
        &self,
        model: &HardwareModel,
    ) -> Result<AuxiliaryStorage, CanneryError> {
        QemuHardwareModel::decode(model)?;
        let template = &self.config.firmware_vars;
        let bytes = std::fs::read(template).map_err(|e| CanneryError::Hypervisor {
            message: format!("reading firmware variable template {template}: {e}"),
        })?;
        Ok(AuxiliaryStorage::from_bytes(bytes))
    }

    fn validate(&self, config: &VmConfiguration) -> Result<(), CanneryError> {
        let model = QemuHardwareModel::decode(&config.hardware_model)?;
        if model.arch != self.arch() {
            return Err(CanneryError::Hypervisor {
                message: format!(
                    "instance was installed for {} but {} emulates {}",
                    model.arch,
                    self.config.binary,
                    self.arch()
                ),
            });
        }
        let limits = self.limits();
        if !(limits.min_cpus..=limits.max_cpus).contains(&config.cpu_count) {
            return Err(CanneryError::Hypervisor {
                message: format!("{} CPUs is outside the supported range", config.cpu_count),
            });
        }
        if !(limits.min_memory..=limits.max_memory).contains(&config.memory_size) {
            return Err(CanneryError::Hypervisor {
                message: format!("{} bytes of memory is outside the supported range", config.memory_size),
            });
        }
        if config.storage.is_empty() {
            return Err(CanneryError::Hypervisor {
                message: "no boot disk attached".into(),
            });
        }
        if let Some(vnc) = &config.extensions.remote_display {
            if vnc.port < VNC_BASE_PORT {
                return Err(CanneryError::Hypervisor {
                    message: format!("VNC port {} is below {VNC_BASE_PORT}", vnc.port),
                });
            }
        }
        Ok(())
    }

    async fn install(
        &self,
        config: &VmConfiguration,
        image: &Path,
        progress: &watch::Sender<f64>,
    ) -> Result<Arc<dyn Session>, CanneryError> {
        let model = QemuHardwareModel::decode(&config.hardware_model)?;
        let secret = write_vnc_secret(config)?;
        let args = build_args(&self.config, &model, config, Boot::Install(image), secret.as_deref());
        progress.send_replace(0.0);

        let session = self.spawn(args).await?;
        let status = session.exited().await;
        match status {
            Some(s) if s.success() => {
                progress.send_replace(1.0);
                Ok(session)
            }
            Some(s) => Err(CanneryError::Hypervisor {
                message: format!("installer exited with {s}"),
            }),
            None => Err(CanneryError::Hypervisor {
                message: "lost track of the installer process".into(),
            }),
        }
    }

    async fn start(
        &self,
        config: &VmConfiguration,
        options: StartOptions,
    ) -> Result<Arc<dyn Session>, CanneryError> {
        let model = QemuHardwareModel::decode(&config.hardware_model)?;
        let secret = write_vnc_secret(config)?;
        let args = build_args(&self.config, &model, config, Boot::Disk(options), secret.as_deref());
        let session = self.spawn(args).await?;
        Ok(session)
    }

    fn extensions(&self) -> Option<&dyn PlatformExtensions> {
        Some(&self.extensions)
    }
}

// ── session ───────────────────────────────────────────────

pub struct QemuSession {
    state: watch::Sender<SessionState>,
    exit: watch::Sender<Option<ExitStatus>>,
    kill: Notify,
}

impl QemuSession {
    /// Track `child` until it exits.
    fn watch(mut child: tokio::process::Child) -> Arc<Self> {
        let session = Arc::new(Self {
            state: watch::channel(SessionState::Running).0,
            exit: watch::channel(None).0,
            kill: Notify::new(),
        });

        // Drain stderr while the process runs so a chatty qemu never blocks.
        let stderr_reader = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                use tokio::io::AsyncReadExt;
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf).await;
                buf
            })
        });

        let tracked = session.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = tracked.kill.notified() => {
                    tracked.state.send_replace(SessionState::Stopping);
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let stderr = match stderr_reader {
                Some(handle) => handle.await.unwrap_or_default(),
                None => String::new(),
            };

            match status {
                Ok(s) => {
                    if !s.success() && !stderr.trim().is_empty() {
                        tracing::warn!(status = %s, stderr = %stderr.trim(), "qemu exited");
                    } else {
                        tracing::info!(status = %s, "qemu exited");
                    }
                    tracked.exit.send_replace(Some(s));
                    tracked.state.send_replace(SessionState::Stopped);
                }
                Err(e) => {
                    tracing::error!(error = %e, "waiting for qemu failed");
                    tracked.state.send_replace(SessionState::Error);
                }
            }
        });

        session
    }

    /// Exit status once the process is gone; `None` if it could not be reaped.
    async fn exited(&self) -> Option<ExitStatus> {
        let mut state = self.state.subscribe();
        let _ = state
            .wait_for(|s| matches!(s, SessionState::Stopped | SessionState::Error))
            .await
            .map(|_| ());
        *self.exit.borrow()
    }
}

#[async_trait]
impl Session for QemuSession {
    fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    async fn stop(&self) -> Result<(), CanneryError> {
        if matches!(*self.state.borrow(), SessionState::Stopped | SessionState::Error) {
            return Ok(());
        }
        self.kill.notify_one();
        self.exited().await;
        Ok(())
    }
}

// ── extensions ────────────────────────────────────────────

pub struct QemuExtensions;

impl PlatformExtensions for QemuExtensions {
    fn apply(&self, options: &Options, config: &mut VmConfiguration) -> Result<(), CanneryError> {
        let ext = &options.extended;
        if ext.dfu_boot {
            tracing::warn!("DFU boot is not supported by qemu, ignoring");
        }
        config.extensions.stop_in_boot_stage1 = ext.stop_in_boot_stage1;
        config.extensions.stop_in_boot_stage2 = ext.stop_in_boot_stage2;
        config.extensions.debug_stub = ext.debug_stub;

        let vnc = &options.remote_display;
        config.extensions.remote_display = vnc.enabled.then(|| RemoteDisplay {
            port: vnc.port,
            password: (vnc.authentication && !vnc.password.is_empty())
                .then(|| vnc.password.clone()),
        });
        Ok(())
    }
}

// ── argument building ─────────────────────────────────────

/// Write the VNC password to an owner-only file in the instance directory.
/// qemu reads it from there, so it never shows up in argv.
fn write_vnc_secret(config: &VmConfiguration) -> Result<Option<PathBuf>, CanneryError> {
    let Some(password) = config
        .extensions
        .remote_display
        .as_ref()
        .and_then(|vnc| vnc.password.as_deref())
    else {
        return Ok(None);
    };

    let path = paths::vnc_secret_path(&config.dir);
    let context = || format!("writing VNC secret {}", path.display());
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&path)
        .map_err(|e| CanneryError::io(context(), e))?;
    // `mode` only applies on creation.
    file.set_permissions(std::fs::Permissions::from_mode(0o600))
        .map_err(|e| CanneryError::io(context(), e))?;
    file.write_all(password.as_bytes())
        .map_err(|e| CanneryError::io(context(), e))?;
    Ok(Some(path))
}

enum Boot<'a> {
    Install(&'a Path),
    Disk(StartOptions),
}

fn build_args(
    qemu: &QemuConfig,
    model: &QemuHardwareModel,
    config: &VmConfiguration,
    boot: Boot<'_>,
    vnc_secret: Option<&Path>,
) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    // identity + platform
    push(&mut args, &["-name", &config.name]);
    push(&mut args, &["-uuid", &config.machine_identifier.to_string()]);
    push(&mut args, &["-machine", &format!("{},accel={}", model.machine, qemu.accel)]);
    push(&mut args, &["-smp", &config.cpu_count.to_string()]);
    push(&mut args, &["-m", &format!("{}M", config.memory_size / MIB)]);
    push(&mut args, &[
        "-drive",
        &format!("if=pflash,format=raw,readonly=on,file={}", model.firmware_code),
    ]);
    push(&mut args, &[
        "-drive",
        &format!("if=pflash,format=raw,file={}", config.auxiliary_storage.display()),
    ]);

    if config.audio {
        push(&mut args, &["-audiodev", "none,id=audio0"]);
        push(&mut args, &["-device", "intel-hda", "-device", "hda-duplex,audiodev=audio0"]);
    }

    for (i, disk) in config.storage.iter().enumerate() {
        push(&mut args, &[
            "-drive",
            &format!(
                "file={},if=none,id=disk{i},format=raw,readonly={}",
                disk.path.display(),
                if disk.read_only { "on" } else { "off" }
            ),
        ]);
        push(&mut args, &["-device", &format!("virtio-blk-pci,drive=disk{i},bootindex={}", i + 1)]);
    }

    for (i, nic) in config.network.iter().enumerate() {
        push(&mut args, &["-netdev", &format!("user,id=net{i}")]);
        push(&mut args, &["-device", &format!("virtio-net-pci,netdev=net{i},mac={}", nic.mac)]);
    }

    match config.input {
        InputMode::Native => {
            push(&mut args, &["-device", "virtio-keyboard-pci", "-device", "virtio-tablet-pci"]);
        }
        InputMode::Usb => {
            push(&mut args, &["-device", "qemu-xhci", "-device", "usb-kbd", "-device", "usb-tablet"]);
        }
    }

    if config.memory_balloon {
        push(&mut args, &["-device", "virtio-balloon-pci"]);
    }
    push(&mut args, &[
        "-device",
        &format!(
            "virtio-vga,xres={},yres={}",
            config.display.width, config.display.height
        ),
    ]);
    if config.entropy {
        push(&mut args, &["-object", "rng-random,id=rng0,filename=/dev/urandom"]);
        push(&mut args, &["-device", "virtio-rng-pci,rng=rng0"]);
    }

    if let Some(serial) = &config.serial {
        push(&mut args, &[
            "-chardev",
            &format!("file,id=serial0,path={}", serial.output.display()),
        ]);
        match serial.kind {
            SerialPortKind::Virtio => {
                push(&mut args, &["-device", "virtio-serial-pci", "-device", "virtconsole,chardev=serial0"]);
            }
            SerialPortKind::Pl011 | SerialPortKind::Uart16550 => {
                push(&mut args, &["-serial", "chardev:serial0"]);
            }
        }
    }

    let ext = &config.extensions;
    if ext.debug_stub {
        push(&mut args, &["-s"]);
    }
    if ext.stop_in_boot_stage1 || ext.stop_in_boot_stage2 {
        push(&mut args, &["-S"]);
    }
    if let Some(vnc) = &ext.remote_display {
        let display = vnc.port.saturating_sub(VNC_BASE_PORT);
        match vnc_secret {
            Some(file) => {
                push(&mut args, &["-object", &format!("secret,id=vncpass,file={}", file.display())]);
                push(&mut args, &["-vnc", &format!(":{display},password-secret=vncpass")]);
            }
            None => push(&mut args, &["-vnc", &format!(":{display}")]),
        }
    }

    match boot {
        Boot::Install(image) => {
            push(&mut args, &["-cdrom", &image.display().to_string()]);
            push(&mut args, &["-boot", "once=d", "-no-reboot"]);
        }
        Boot::Disk(options) => {
            if options.boot_to_recovery {
                push(&mut args, &["-boot", "menu=on"]);
            }
        }
    }

    args
}

fn push(args: &mut Vec<String>, items: &[&str]) {
    args.extend(items.iter().map(|s| s.to_string()));
}

// ── release feed ──────────────────────────────────────────

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct FedoraRelease {
    #[facet(default)]
    version: String,
    #[facet(default)]
    arch: String,
    #[facet(default)]
    variant: String,
    #[facet(default)]
    link: String,
}

async fn fetch_releases(feed: &str) -> Result<Vec<FedoraRelease>, CanneryError> {
    let failed = |message: String| {
        move |e: reqwest::Error| CanneryError::DownloadFailed {
            message,
            source: Box::new(e),
        }
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(15))
        .build()
        .map_err(failed("building HTTP client".into()))?;
    let body = client
        .get(feed)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(failed(format!("fetching {feed}")))?
        .text()
        .await
        .map_err(failed(format!("reading {feed}")))?;

    facet_json::from_str(&body).map_err(|e| CanneryError::DownloadFailed {
        message: format!("{feed} is not a release list"),
        source: e.to_string().into(),
    })
}

/// Newest network installer ISO for `variant` on `arch`.
fn pick_latest(releases: Vec<FedoraRelease>, variant: &str, arch: &str) -> Option<ImageDescriptor> {
    releases
        .into_iter()
        .filter(|r| {
            r.variant == variant
                && r.arch == arch
                && r.link.ends_with(".iso")
                && r.link.contains("netinst")
        })
        .filter_map(|r| {
            let key = version_key(&r.version)?;
            Some((key, r))
        })
        .max_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, r)| ImageDescriptor {
            url: r.link,
            version: r.version,
        })
}

/// Numeric release ordering; pre-releases such as "43 Beta" are skipped.
fn version_key(version: &str) -> Option<Vec<u32>> {
    version.split('.').map(|p| p.parse().ok()).collect()
}
