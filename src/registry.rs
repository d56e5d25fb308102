use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::CanneryError;
use crate::host;
use crate::options::{Options, OptionsStore};
use crate::paths;

/// Named instance directories under one root.
///
/// Nothing is cached: every call re-reads the root, so several processes
/// can create and list instances side by side.
pub struct Registry {
    root: PathBuf,
}

impl Registry {
    /// Open (creating if needed) the registry rooted at `root`.
    ///
    /// A root that cannot be created or enumerated is fatal: no instance can
    /// be resolved from it.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CanneryError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| CanneryError::RootDirectory {
            path: root.display().to_string(),
            source,
        })?;
        fs::read_dir(&root).map_err(|source| CanneryError::RootDirectory {
            path: root.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn instance_dir(&self, name: &str) -> PathBuf {
        paths::instance_dir(&self.root, name)
    }

    pub fn exists(&self, name: &str) -> bool {
        validate_name(name).is_ok() && self.instance_dir(name).is_dir()
    }

    /// Instance names, read lazily from the root. Hidden entries (the
    /// trash) and plain files are skipped.
    pub fn list(&self) -> Result<impl Iterator<Item = String>, CanneryError> {
        let entries = fs::read_dir(&self.root).map_err(|source| CanneryError::RootDirectory {
            path: self.root.display().to_string(),
            source,
        })?;
        Ok(entries.filter_map(|entry| {
            let entry = entry.ok()?;
            if !entry.file_type().ok()?.is_dir() {
                return None;
            }
            let name = entry.file_name().into_string().ok()?;
            (!name.starts_with('.')).then_some(name)
        }))
    }

    /// Create the directory for `options.name` and persist its options.
    pub fn create(&self, options: &Options) -> Result<PathBuf, CanneryError> {
        validate_name(&options.name)?;
        options.validate()?;

        let dir = self.instance_dir(&options.name);
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(CanneryError::VirtualMachineExists {
                    name: options.name.clone(),
                });
            }
            Err(e) => {
                return Err(CanneryError::io(
                    format!("creating instance directory {}", dir.display()),
                    e,
                ));
            }
        }

        OptionsStore::save(&dir, options)?;
        tracing::info!(name = %options.name, dir = %dir.display(), "created instance");
        Ok(dir)
    }

    /// Move the instance directory to the trash and return where it went.
    ///
    /// Callers holding a live session go through `Instance::delete`, which
    /// stops it first.
    pub fn delete(&self, name: &str) -> Result<PathBuf, CanneryError> {
        validate_name(name)?;
        let dir = self.instance_dir(name);
        if !dir.is_dir() {
            return Err(CanneryError::VirtualMachineNotFound {
                name: name.to_string(),
            });
        }
        host::move_to_trash(&dir, &paths::trash_dir(&self.root))
    }

    /// Move a pre-multi-instance directory into place as the default
    /// instance, unless that instance already has content.
    pub fn migrate_legacy_if_needed(&self, legacy_dir: &Path) -> Result<MigrationAction, CanneryError> {
        let target = self.instance_dir(paths::DEFAULT_INSTANCE);
        let action = plan_migration(legacy_dir.is_dir(), has_content(&target));

        if action == MigrationAction::Migrate {
            // An empty placeholder would make the rename fail.
            if target.is_dir() {
                fs::remove_dir(&target).map_err(|e| {
                    CanneryError::io(format!("removing empty {}", target.display()), e)
                })?;
            }
            fs::rename(legacy_dir, &target).map_err(|e| {
                CanneryError::io(
                    format!("migrating {} to {}", legacy_dir.display(), target.display()),
                    e,
                )
            })?;
            tracing::info!(from = %legacy_dir.display(), to = %target.display(), "migrated legacy instance");
        }
        Ok(action)
    }
}

/// What startup should do about a legacy single-instance directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationAction {
    /// No legacy directory.
    None,
    /// The default instance already holds content; the legacy directory is
    /// left alone.
    AlreadyMigrated,
    /// Move the legacy directory into place as the default instance.
    Migrate,
}

pub fn plan_migration(legacy_exists: bool, target_has_content: bool) -> MigrationAction {
    match (legacy_exists, target_has_content) {
        (false, _) => MigrationAction::None,
        (true, true) => MigrationAction::AlreadyMigrated,
        (true, false) => MigrationAction::Migrate,
    }
}

fn has_content(dir: &Path) -> bool {
    fs::read_dir(dir).is_ok_and(|mut entries| entries.next().is_some())
}

/// Instance names double as directory names.
pub fn validate_name(name: &str) -> Result<(), CanneryError> {
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if !valid {
        return Err(CanneryError::Validation {
            message: format!("instance name must match [a-zA-Z0-9][a-zA-Z0-9._-]* (got '{name}')"),
        });
    }
    Ok(())
}
