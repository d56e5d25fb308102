//! Host-wide settings read from `cannery.toml`.
//!
//! Every section and key is optional; a missing file means all defaults.

use std::path::Path;

use facet::Facet;

use crate::error::CanneryError;

pub const FEDORA_RELEASES_FEED: &str = "https://www.fedoraproject.org/releases.json";

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct Config {
    #[facet(default)]
    pub image: ImageConfig,
    #[facet(default)]
    pub qemu: QemuConfig,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ImageConfig {
    /// Fixed installer URL. When set the release feed is not consulted.
    #[facet(default)]
    pub url: String,
    #[facet(default = "https://www.fedoraproject.org/releases.json")]
    pub feed: String,
    #[facet(default = "Server")]
    pub variant: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            feed: FEDORA_RELEASES_FEED.into(),
            variant: "Server".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct QemuConfig {
    #[facet(default = "qemu-system-x86_64")]
    pub binary: String,
    #[facet(default = "q35")]
    pub machine: String,
    #[facet(default = "kvm")]
    pub accel: String,
    #[facet(default = "/usr/share/OVMF/OVMF_CODE.fd")]
    pub firmware_code: String,
    #[facet(default = "/usr/share/OVMF/OVMF_VARS.fd")]
    pub firmware_vars: String,
    #[facet(default = 64)]
    pub max_memory_gb: u64,
}

impl Default for QemuConfig {
    fn default() -> Self {
        Self {
            binary: "qemu-system-x86_64".into(),
            machine: "q35".into(),
            accel: "kvm".into(),
            firmware_code: "/usr/share/OVMF/OVMF_CODE.fd".into(),
            firmware_vars: "/usr/share/OVMF/OVMF_VARS.fd".into(),
            max_memory_gb: 64,
        }
    }
}

// ── validation ────────────────────────────────────────────

fn validate_config(config: &Config) -> Result<(), CanneryError> {
    let url = &config.image.url;
    if !url.is_empty()
        && !url.starts_with("http://")
        && !url.starts_with("https://")
        && !Path::new(url.trim_start_matches("file://")).is_absolute()
    {
        return Err(CanneryError::Validation {
            message: format!("image.url must be an http(s) URL or an absolute path (got '{url}')"),
        });
    }
    if url.is_empty() && config.image.feed.is_empty() {
        return Err(CanneryError::Validation {
            message: "one of image.url or image.feed must be set".into(),
        });
    }
    if config.qemu.binary.is_empty() {
        return Err(CanneryError::Validation {
            message: "qemu.binary must not be empty".into(),
        });
    }
    if config.qemu.max_memory_gb < 1 {
        return Err(CanneryError::Validation {
            message: "qemu.max_memory_gb must be at least 1".into(),
        });
    }
    Ok(())
}

// ── public API ────────────────────────────────────────────

/// Load the config at `path`, falling back to defaults when the file does
/// not exist.
pub fn load_config(path: &Path) -> Result<Config, CanneryError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Config::default());
        }
        Err(source) => {
            return Err(CanneryError::ConfigLoad {
                path: path.display().to_string(),
                source,
            });
        }
    };

    let config: Config = facet_toml::from_str(&contents).map_err(|e| CanneryError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    validate_config(&config)?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok(config)
}
