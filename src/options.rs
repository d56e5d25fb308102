//! User-editable settings of one instance, persisted as `options.json`.

use std::fmt;
use std::path::Path;

use facet::Facet;

use crate::error::CanneryError;
use crate::identity::write_durably;
use crate::paths;

/// Pixel density used for presets without their own and for automatic sizing.
pub const DEFAULT_PPI: u32 = 80;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Facet)]
#[facet(default)]
#[repr(u8)]
pub enum DisplayResolution {
    #[default]
    R1920x1080,
    R3840x2160,
    /// Follow the size of the viewer at boot time.
    Automatic,
}

impl DisplayResolution {
    /// `(width, height, ppi)` for this preset. `Automatic` takes the
    /// caller-provided view size, falling back to 1920x1080.
    pub fn geometry(self, view_size: Option<(u32, u32)>) -> (u32, u32, u32) {
        match self {
            Self::R1920x1080 => (1920, 1080, DEFAULT_PPI),
            Self::R3840x2160 => (3840, 2160, 157),
            Self::Automatic => {
                let (w, h) = view_size.unwrap_or((1920, 1080));
                (w, h, DEFAULT_PPI)
            }
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "1920x1080" => Some(Self::R1920x1080),
            "3840x2160" => Some(Self::R3840x2160),
            "automatic" | "auto" => Some(Self::Automatic),
            _ => None,
        }
    }
}

impl fmt::Display for DisplayResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::R1920x1080 => write!(f, "1920x1080"),
            Self::R3840x2160 => write!(f, "3840x2160"),
            Self::Automatic => write!(f, "automatic"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Facet)]
#[facet(default)]
#[repr(u8)]
pub enum SerialPortKind {
    #[default]
    Virtio,
    Pl011,
    Uart16550,
}

impl SerialPortKind {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "virtio" => Some(Self::Virtio),
            "pl011" => Some(Self::Pl011),
            "16550" | "uart16550" => Some(Self::Uart16550),
            _ => None,
        }
    }
}

impl fmt::Display for SerialPortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Virtio => write!(f, "virtio"),
            Self::Pl011 => write!(f, "pl011"),
            Self::Uart16550 => write!(f, "16550"),
        }
    }
}

/// Start-up switches that only some hypervisors honour.
#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
pub struct ExtendedOptions {
    #[facet(default)]
    pub dfu_boot: bool,
    #[facet(default)]
    pub stop_in_boot_stage1: bool,
    #[facet(default)]
    pub stop_in_boot_stage2: bool,
    #[facet(default)]
    pub debug_stub: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
pub struct SerialOptions {
    #[facet(default)]
    pub enabled: bool,
    #[facet(default)]
    pub port: SerialPortKind,
}

#[derive(Debug, Clone, PartialEq, Facet)]
#[facet(default)]
pub struct RemoteDisplayOptions {
    #[facet(default)]
    pub enabled: bool,
    #[facet(default = 5905)]
    pub port: u16,
    #[facet(default)]
    pub authentication: bool,
    #[facet(default)]
    pub password: String,
}

impl Default for RemoteDisplayOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 5905,
            authentication: false,
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Facet)]
#[facet(default)]
pub struct Options {
    #[facet(default)]
    pub name: String,
    #[facet(default = 4.0)]
    pub memory_gb: f64,
    #[facet(default)]
    pub display: DisplayResolution,
    #[facet(default)]
    pub boot_to_recovery: bool,
    #[facet(default = true)]
    pub native_input: bool,
    #[facet(default)]
    pub extended: ExtendedOptions,
    #[facet(default)]
    pub serial: SerialOptions,
    #[facet(default)]
    pub remote_display: RemoteDisplayOptions,
    /// Installer to use instead of downloading one. Relative paths are
    /// resolved against the instance directory.
    pub installer_path: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            name: String::new(),
            memory_gb: 4.0,
            display: DisplayResolution::default(),
            boot_to_recovery: false,
            native_input: true,
            extended: ExtendedOptions::default(),
            serial: SerialOptions::default(),
            remote_display: RemoteDisplayOptions::default(),
            installer_path: None,
        }
    }
}

/// Keys accepted by [`Options::set`].
pub const SETTABLE_KEYS: &[&str] = &[
    "memory",
    "display",
    "recovery",
    "native-input",
    "dfu-boot",
    "stop-in-stage1",
    "stop-in-stage2",
    "debug-stub",
    "serial",
    "serial-port",
    "vnc",
    "vnc-port",
    "vnc-auth",
    "vnc-password",
    "installer",
];

impl Options {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), CanneryError> {
        if self.name.is_empty() {
            return Err(CanneryError::Validation {
                message: "instance name must not be empty".into(),
            });
        }
        if !self.memory_gb.is_finite() || self.memory_gb <= 0.0 {
            return Err(CanneryError::Validation {
                message: format!("memory must be a positive number of GB (got {})", self.memory_gb),
            });
        }
        if self.remote_display.enabled && self.remote_display.port < 5900 {
            return Err(CanneryError::Validation {
                message: format!(
                    "remote display port must be 5900 or above (got {})",
                    self.remote_display.port
                ),
            });
        }
        Ok(())
    }

    /// Update a single setting from its command-line form. On error the
    /// record is left as it was.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), CanneryError> {
        let mut updated = self.clone();
        updated.apply(key, value)?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), CanneryError> {
        let invalid = |what: &str| CanneryError::Validation {
            message: format!("invalid value '{value}' for {key}: expected {what}"),
        };
        let flag = || parse_bool(value).ok_or_else(|| invalid("on/off"));

        match key {
            "memory" => {
                self.memory_gb = value.parse().map_err(|_| invalid("a number of GB"))?;
            }
            "display" => {
                self.display = DisplayResolution::parse(value)
                    .ok_or_else(|| invalid("1920x1080, 3840x2160 or automatic"))?;
            }
            "recovery" => self.boot_to_recovery = flag()?,
            "native-input" => self.native_input = flag()?,
            "dfu-boot" => self.extended.dfu_boot = flag()?,
            "stop-in-stage1" => self.extended.stop_in_boot_stage1 = flag()?,
            "stop-in-stage2" => self.extended.stop_in_boot_stage2 = flag()?,
            "debug-stub" => self.extended.debug_stub = flag()?,
            "serial" => self.serial.enabled = flag()?,
            "serial-port" => {
                self.serial.port = SerialPortKind::parse(value)
                    .ok_or_else(|| invalid("virtio, pl011 or 16550"))?;
            }
            "vnc" => self.remote_display.enabled = flag()?,
            "vnc-port" => {
                self.remote_display.port = value.parse().map_err(|_| invalid("a port number"))?;
            }
            "vnc-auth" => self.remote_display.authentication = flag()?,
            "vnc-password" => self.remote_display.password = value.to_string(),
            "installer" => {
                self.installer_path = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            _ => {
                return Err(CanneryError::Validation {
                    message: format!(
                        "unknown setting '{key}' (expected one of: {})",
                        SETTABLE_KEYS.join(", ")
                    ),
                });
            }
        }
        Ok(())
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Some(true),
        "off" | "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

// ── persistence ───────────────────────────────────────────

pub struct OptionsStore;

impl OptionsStore {
    /// Read the persisted record, or fall back to `defaults` (or a default
    /// record named after the directory). The result is always written back
    /// so fields added since the file was created get their defaults on disk.
    pub fn load_or_create(dir: &Path, defaults: Option<Options>) -> Result<Options, CanneryError> {
        let path = paths::options_path(dir);
        let options = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                facet_json::from_str::<Options>(&contents).map_err(|e| {
                    CanneryError::OptionsParse {
                        path: path.display().to_string(),
                        message: e.to_string(),
                    }
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => defaults.unwrap_or_else(|| {
                let name = dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| paths::DEFAULT_INSTANCE.to_string());
                Options::named(name)
            }),
            Err(e) => {
                return Err(CanneryError::io(
                    format!("reading options from {}", path.display()),
                    e,
                ));
            }
        };

        Self::save(dir, &options)?;
        Ok(options)
    }

    pub fn save(dir: &Path, options: &Options) -> Result<(), CanneryError> {
        let path = paths::options_path(dir);
        let json = facet_json::to_string(options).map_err(|e| {
            CanneryError::io(
                format!("serializing options for {}", path.display()),
                std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
            )
        })?;
        write_durably(&path, json.as_bytes())
            .map_err(|e| CanneryError::io(format!("writing options to {}", path.display()), e))?;
        tracing::debug!(path = %path.display(), "saved options");
        Ok(())
    }
}
