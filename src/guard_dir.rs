/// Guard files: lets other processes hold a guard by creating a file.
///
/// A file named `<guard>` inside the guard directory means that guard is
/// active. The daemon folds the directory into its [`GuardSet`] on a short
/// tick; the `guard activate|release` subcommands write the files.
use crate::guard::{is_valid_guard_name, GuardSet};
use std::collections::BTreeSet;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct GuardDir {
    root: PathBuf,
}

impl GuardDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, GuardFileError> {
        if !is_valid_guard_name(name) {
            return Err(GuardFileError::InvalidName(name.to_string()));
        }
        Ok(self.root.join(name))
    }

    /// Create the guard file (and the directory if needed).
    pub fn activate(&self, name: &str) -> Result<(), GuardFileError> {
        let path = self.path_for(name)?;
        std::fs::create_dir_all(&self.root).map_err(|e| GuardFileError::Io {
            path: self.root.clone(),
            source: e,
        })?;
        std::fs::write(&path, format!("{}\n", std::process::id())).map_err(|e| {
            GuardFileError::Io { path, source: e }
        })
    }

    /// Remove the guard file. Releasing an inactive guard is not an error.
    pub fn release(&self, name: &str) -> Result<(), GuardFileError> {
        let path = self.path_for(name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GuardFileError::Io { path, source: e }),
        }
    }

    /// Names of guards currently held. A missing directory holds none.
    pub fn scan(&self) -> Result<BTreeSet<String>, GuardFileError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => {
                return Err(GuardFileError::Io {
                    path: self.root.clone(),
                    source: e,
                })
            }
        };

        let mut names = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(|e| GuardFileError::Io {
                path: self.root.clone(),
                source: e,
            })?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if is_valid_guard_name(name) {
                    names.insert(name.to_string());
                }
            }
        }
        Ok(names)
    }
}

/// Mirrors a [`GuardDir`] into a [`GuardSet`].
///
/// Only guards this syncer turned on are ever turned off by it, so guards
/// set in-process (e.g. from the command line) are left alone.
#[derive(Debug)]
pub struct GuardDirSync {
    dir: GuardDir,
    held: BTreeSet<String>,
}

impl GuardDirSync {
    pub fn new(dir: GuardDir) -> Self {
        Self {
            dir,
            held: BTreeSet::new(),
        }
    }

    pub fn sync(&mut self, guards: &GuardSet) -> Result<(), GuardFileError> {
        let present = self.dir.scan()?;
        let already_active = guards.snapshot().active();

        let mut held = BTreeSet::new();
        for name in &present {
            if self.held.contains(name) {
                held.insert(name.clone());
            } else if !already_active.contains(name) {
                guards.activate(name);
                held.insert(name.clone());
            }
        }
        for name in self.held.difference(&present) {
            guards.release(name);
        }
        self.held = held;
        Ok(())
    }
}

/// Errors from guard file operations.
#[derive(Debug)]
pub enum GuardFileError {
    InvalidName(String),
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for GuardFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuardFileError::InvalidName(name) => write!(
                f,
                "invalid guard name {name:?} (use letters, digits, '-', '_' or '.')"
            ),
            GuardFileError::Io { path, source } => {
                write!(f, "guard file error at {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for GuardFileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GuardFileError::InvalidName(_) => None,
            GuardFileError::Io { source, .. } => Some(source),
        }
    }
}
