use std::path::Path;
use std::sync::Arc;

use clap::Parser;

use cannery::backend;
use cannery::cli::{Cli, Command};
use cannery::config;
use cannery::error::CanneryError;
use cannery::host::LocalHost;
use cannery::hypervisor::SessionState;
use cannery::identity::{HardwareModel, IdentityStore, MacAddress, MachineIdentifier};
use cannery::instance::Instance;
use cannery::logging;
use cannery::options::{Options, OptionsStore};
use cannery::paths;
use cannery::progress::{LifecycleProgress, OutputMode};
use cannery::registry::{MigrationAction, Registry};

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    let mode = OutputMode::resolve(cli.verbose, cli.quiet);
    let file_handle = logging::init(mode);

    let root = cli.root.clone().unwrap_or_else(paths::default_root);
    let registry = Registry::open(&root)?;

    // Only the default root can have a pre-multi-instance predecessor.
    if cli.root.is_none() {
        match registry.migrate_legacy_if_needed(&paths::legacy_dir()) {
            Ok(MigrationAction::Migrate) => {
                eprintln!("Moved legacy instance into {}", registry.instance_dir(paths::DEFAULT_INSTANCE).display());
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "legacy migration failed"),
        }
    }

    let config_path = cli.config.clone().unwrap_or_else(paths::default_config_path);

    match cli.command {
        Command::List => {
            let mut names: Vec<String> = registry.list()?.collect();
            names.sort();
            if names.is_empty() {
                println!("No instances. Create one with `cannery create <name>`.");
            }
            for name in names {
                let dir = registry.instance_dir(&name);
                let status = if IdentityStore::new(&dir).exists::<HardwareModel>() {
                    "installed"
                } else {
                    "not installed"
                };
                println!("{name}\t{status}");
            }
        }
        Command::Create {
            name,
            memory,
            installer,
        } => {
            let mut options = Options::named(&name);
            if let Some(memory) = memory {
                options.memory_gb = memory;
            }
            options.installer_path = installer;
            let dir = registry.create(&options)?;
            println!("Created instance '{name}' at {}", dir.display());
        }
        Command::Show { name } => {
            let dir = existing_dir(&registry, &name)?;
            let options = OptionsStore::load_or_create(&dir, None)?;
            show(&dir, &options)?;
        }
        Command::Set { name, key, value } => {
            let dir = existing_dir(&registry, &name)?;
            let mut options = OptionsStore::load_or_create(&dir, None)?;
            options.set(&key, &value)?;
            OptionsStore::save(&dir, &options)?;
            println!("{name}: {key} = {value}");
        }
        Command::Delete { name } => {
            let dir = existing_dir(&registry, &name)?;
            let config = config::load_config(&config_path)?;
            let instance = Instance::open(dir, backend::create_backend(&config), Arc::new(LocalHost))?;
            let trashed = instance.delete(&registry).await?;
            println!("Moved '{name}' to {}", trashed.display());
        }
        Command::Boot { name, view_size } => {
            let dir = if registry.exists(&name) {
                registry.instance_dir(&name)
            } else {
                registry.create(&Options::named(&name))?
            };
            if let Err(e) = file_handle.activate_for_instance(&dir) {
                tracing::warn!(error = %e, "could not open instance log");
            }

            let config = config::load_config(&config_path)?;
            let hypervisor = backend::create_backend(&config);
            tracing::info!(name = %name, hypervisor = hypervisor.name(), "booting");
            let instance = Instance::open(dir, hypervisor, Arc::new(LocalHost))?;
            run_boot(&instance, mode, view_size).await?;
        }
    }

    Ok(())
}

fn existing_dir(registry: &Registry, name: &str) -> Result<std::path::PathBuf, CanneryError> {
    if registry.exists(name) {
        Ok(registry.instance_dir(name))
    } else {
        Err(CanneryError::VirtualMachineNotFound {
            name: name.to_string(),
        })
    }
}

fn show(dir: &Path, options: &Options) -> Result<(), CanneryError> {
    let identity = IdentityStore::new(dir);
    let on_off = |b: bool| if b { "on" } else { "off" };

    println!("name:          {}", options.name);
    println!("directory:     {}", dir.display());
    println!(
        "installed:     {}",
        if identity.exists::<HardwareModel>() { "yes" } else { "no" }
    );
    if let Some(id) = identity.load::<MachineIdentifier>()? {
        println!("machine id:    {id}");
    }
    if let Some(mac) = identity.load::<MacAddress>()? {
        println!("mac address:   {mac}");
    }
    println!("memory:        {} GB", options.memory_gb);
    println!("display:       {}", options.display);
    println!("recovery boot: {}", on_off(options.boot_to_recovery));
    println!("native input:  {}", on_off(options.native_input));
    if options.serial.enabled {
        println!("serial:        {} -> {}", options.serial.port, paths::serial_output_path(dir).display());
    } else {
        println!("serial:        off");
    }
    if options.remote_display.enabled {
        println!(
            "vnc:           port {}{}",
            options.remote_display.port,
            if options.remote_display.authentication { " (password)" } else { "" }
        );
    } else {
        println!("vnc:           off");
    }
    if let Some(installer) = &options.installer_path {
        println!("installer:     {installer}");
    }
    Ok(())
}

/// Drive one `boot` with progress rendering, then keep the session in the
/// foreground until it stops or the user hits Ctrl+C.
async fn run_boot(
    instance: &Instance,
    mode: OutputMode,
    view_size: Option<(u32, u32)>,
) -> Result<(), CanneryError> {
    let mut transitions = instance.subscribe();
    let mut progress = LifecycleProgress::new(mode, instance.download_progress(), instance.install_progress());

    let boot = instance.boot(view_size);
    tokio::pin!(boot);
    let result = loop {
        tokio::select! {
            result = &mut boot => break result,
            Ok(t) = transitions.recv() => progress.on_transition(&t),
            _ = tokio::signal::ctrl_c() => {
                // Only meaningful while downloading; ignored by the flow otherwise.
                instance.cancel_download();
            }
        }
    };
    while let Ok(t) = transitions.try_recv() {
        progress.on_transition(&t);
    }

    match result {
        Ok(()) => {}
        Err(CanneryError::DownloadCancelled) => return Ok(()),
        Err(e) => return Err(e),
    }

    let Some(session) = instance.session() else {
        return Ok(());
    };

    let options = instance.options();
    if options.serial.enabled {
        progress.info(&format!(
            "serial console: {}",
            paths::serial_output_path(instance.dir()).display()
        ));
    }
    if options.remote_display.enabled {
        progress.info(&format!("vnc: 127.0.0.1:{}", options.remote_display.port));
    }
    progress.info("press Ctrl+C to stop");

    let mut state = session.state();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            instance.stop().await?;
            progress.println("stopped");
        }
        _ = state.wait_for(|s| matches!(s, SessionState::Stopped | SessionState::Error)) => {
            let last = *session.state().borrow();
            progress.println(&format!("session {last}"));
        }
    }
    Ok(())
}
