use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cannery", about = "Named virtual machine instances: install once, boot anytime")]
pub struct Cli {
    /// Directory holding one subdirectory per instance
    #[arg(long, env = "CANNERY_ROOT", global = true)]
    pub root: Option<PathBuf>,

    /// Path to host config file
    #[arg(short, long, env = "CANNERY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Show debug logs on stderr
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only print the final outcome
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List instances
    List,

    /// Create a new instance
    Create {
        /// Instance name ([a-zA-Z0-9][a-zA-Z0-9._-]*)
        name: String,

        /// Memory in GB
        #[arg(long)]
        memory: Option<f64>,

        /// Installer image to use instead of downloading one
        #[arg(long)]
        installer: Option<String>,
    },

    /// Show an instance's options and identity
    Show {
        /// Instance name
        #[arg(default_value = "default")]
        name: String,
    },

    /// Change one setting of an instance (takes effect at next boot)
    Set {
        /// Instance name
        name: String,

        /// Setting to change (memory, display, serial, vnc, ...)
        key: String,

        /// New value
        value: String,
    },

    /// Move an instance to the trash
    Delete {
        /// Instance name
        name: String,
    },

    /// Install (if needed) and start an instance. Ctrl+C cancels the
    /// download, or stops the running instance.
    Boot {
        /// Instance name, created with default options if missing
        #[arg(default_value = "default")]
        name: String,

        /// Viewer size for automatic display sizing, e.g. 2560x1440
        #[arg(long, value_parser = parse_view_size_arg)]
        view_size: Option<(u32, u32)>,
    },
}

fn parse_view_size_arg(s: &str) -> Result<(u32, u32), String> {
    crate::util::parse_view_size(s).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn boot_defaults_to_default_instance() {
        let cli = Cli::try_parse_from(["cannery", "boot"]).unwrap();
        match cli.command {
            Command::Boot { name, view_size } => {
                assert_eq!(name, "default");
                assert_eq!(view_size, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn view_size_is_parsed() {
        let cli = Cli::try_parse_from(["cannery", "boot", "vm", "--view-size", "2560x1440"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Boot { view_size: Some((2560, 1440)), .. }
        ));
        assert!(Cli::try_parse_from(["cannery", "boot", "--view-size", "wide"]).is_err());
    }
}
