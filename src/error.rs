use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CanneryError {
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{artifact} at {path} is corrupt: {message}")]
    #[diagnostic(help(
        "the instance cannot be started safely; restore the file from a backup or delete the instance"
    ))]
    Corrupt {
        artifact: &'static str,
        path: String,
        message: String,
    },

    #[error("not enough disk space to allocate {requested} at {path}")]
    #[diagnostic(help("free some disk space and try again"))]
    DiskSpaceUnavailable { path: String, requested: String },

    #[error("restore image is unusable: {message}")]
    RestoreImageBad { message: String },

    #[error("download of installer failed: {message}")]
    #[diagnostic(help("check your network connection and try again"))]
    DownloadFailed {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("download of installer was cancelled")]
    DownloadCancelled,

    #[error("virtual machine '{name}' already exists")]
    #[diagnostic(help("pick a different name or delete the existing instance"))]
    VirtualMachineExists { name: String },

    #[error("virtual machine '{name}' does not exist")]
    VirtualMachineNotFound { name: String },

    #[error("cannot read instance root directory {path}")]
    RootDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("failed to parse options from {path}: {message}")]
    OptionsParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("hypervisor error: {message}")]
    Hypervisor { message: String },

    #[error("virtual machine '{name}' is already being provisioned")]
    ProvisioningInFlight { name: String },

    #[error("virtual machine '{name}' is in use by another cannery process{}", holder(.pid))]
    #[diagnostic(help("stop the instance in that process first"))]
    InstanceBusy { name: String, pid: Option<u32> },
}

fn holder(pid: &Option<u32>) -> String {
    pid.map(|pid| format!(" (pid {pid})")).unwrap_or_default()
}

impl CanneryError {
    /// Shorthand for wrapping an `io::Error` with a human-readable context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        CanneryError::Io {
            context: context.into(),
            source,
        }
    }
}
