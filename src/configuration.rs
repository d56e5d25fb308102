//! Hypervisor-neutral description of the virtual machine to run.
//!
//! `assemble` reads or creates everything the instance needs on disk (identity
//! artifacts, the boot disk, the serial capture file) and produces a
//! `VmConfiguration` that the hypervisor validates before starting.

use std::path::{Path, PathBuf};

use crate::disk::{self, DiskAttachment};
use crate::error::CanneryError;
use crate::host::HostStorage;
use crate::hypervisor::{Hypervisor, Limits};
use crate::identity::{AuxiliaryStorage, HardwareModel, IdentityStore, MacAddress, MachineIdentifier};
use crate::options::{Options, SerialPortKind};
use crate::paths;
use crate::util::GIB;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    pub ppi: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    /// Paravirtual keyboard and pointer.
    Native,
    /// Emulated USB keyboard and tablet.
    Usb,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDevice {
    pub mac: MacAddress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialPort {
    pub kind: SerialPortKind,
    pub output: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDisplay {
    pub port: u16,
    pub password: Option<String>,
}

/// Filled in only by a hypervisor's `PlatformExtensions`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendedConfig {
    pub dfu_boot: bool,
    pub stop_in_boot_stage1: bool,
    pub stop_in_boot_stage2: bool,
    pub debug_stub: bool,
    pub remote_display: Option<RemoteDisplay>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VmConfiguration {
    pub name: String,
    /// Instance directory; hypervisors keep their private files here.
    pub dir: PathBuf,
    pub hardware_model: HardwareModel,
    pub machine_identifier: MachineIdentifier,
    pub auxiliary_storage: PathBuf,
    pub cpu_count: u32,
    pub memory_size: u64,
    pub audio: bool,
    pub storage: Vec<DiskAttachment>,
    pub network: Vec<NetworkDevice>,
    pub input: InputMode,
    pub memory_balloon: bool,
    pub display: DisplayConfig,
    pub entropy: bool,
    pub serial: Option<SerialPort>,
    pub extensions: ExtendedConfig,
}

/// All host cores but one, at least one, within the hypervisor's bounds.
pub fn cpu_count(host_cores: usize, limits: &Limits) -> u32 {
    let wanted = u32::try_from(host_cores.saturating_sub(1))
        .unwrap_or(u32::MAX)
        .max(1);
    wanted.clamp(limits.min_cpus, limits.max_cpus.max(limits.min_cpus))
}

/// Configured gigabytes as bytes, within the hypervisor's bounds.
pub fn memory_size(memory_gb: f64, limits: &Limits) -> u64 {
    let bytes = if memory_gb.is_finite() && memory_gb > 0.0 {
        (memory_gb * GIB as f64) as u64
    } else {
        0
    };
    bytes.clamp(limits.min_memory, limits.max_memory.max(limits.min_memory))
}

fn host_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Build the configuration for the instance in `dir`.
///
/// The hardware model must already be committed. Machine identifier,
/// auxiliary storage, disk and network address are created on first use.
pub fn assemble(
    dir: &Path,
    options: &Options,
    hypervisor: &dyn Hypervisor,
    host: &dyn HostStorage,
    view_size: Option<(u32, u32)>,
) -> Result<VmConfiguration, CanneryError> {
    let identity = IdentityStore::new(dir);
    let limits = hypervisor.limits();

    // identity
    let hardware_model = identity
        .load::<HardwareModel>()?
        .ok_or_else(|| CanneryError::Corrupt {
            artifact: "hardware model",
            path: identity.path::<HardwareModel>().display().to_string(),
            message: "expected file is missing".into(),
        })?;
    let machine_identifier = identity.load_or_create(|| Ok(MachineIdentifier::random()))?;

    // platform
    identity.load_or_create::<AuxiliaryStorage, _>(|| {
        hypervisor.create_auxiliary_storage(&hardware_model)
    })?;
    let cpu_count = cpu_count(host_cores(), &limits);
    let memory_size = memory_size(options.memory_gb, &limits);

    // storage
    let disk = disk::get_or_create(dir, host)?;

    // network
    let mac = identity.load_or_create(|| Ok(MacAddress::random()))?;

    // input
    let input = if options.native_input {
        InputMode::Native
    } else {
        InputMode::Usb
    };

    // GPU
    let (width, height, ppi) = options.display.geometry(view_size);

    // serial
    let serial = if options.serial.enabled {
        let output = paths::serial_output_path(dir);
        std::fs::File::create(&output).map_err(|e| {
            CanneryError::io(format!("creating serial capture {}", output.display()), e)
        })?;
        Some(SerialPort {
            kind: options.serial.port,
            output,
        })
    } else {
        None
    };

    let mut config = VmConfiguration {
        name: options.name.clone(),
        dir: dir.to_path_buf(),
        hardware_model,
        machine_identifier,
        auxiliary_storage: identity.path::<AuxiliaryStorage>(),
        cpu_count,
        memory_size,
        audio: true,
        storage: vec![disk],
        network: vec![NetworkDevice { mac }],
        input,
        memory_balloon: true,
        display: DisplayConfig { width, height, ppi },
        entropy: true,
        serial,
        extensions: ExtendedConfig::default(),
    };

    match hypervisor.extensions() {
        Some(ext) => ext.apply(options, &mut config)?,
        None => tracing::debug!(hypervisor = hypervisor.name(), "no platform extensions"),
    }

    hypervisor.validate(&config)?;
    tracing::info!(
        name = %config.name,
        cpus = config.cpu_count,
        memory = config.memory_size,
        width = config.display.width,
        height = config.display.height,
        mac = %mac,
        "configuration assembled"
    );
    Ok(config)
}
