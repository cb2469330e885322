use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
#[error("project key must be an absolute config file path: {}", path.display())]
pub struct InvalidProjectKey {
    path: PathBuf,
}

/// Identity of a project root, derived from the location of its config file
/// (e.g. `/proj/tsconfig.json`).
///
/// Two files belong to the same project exactly when their nearest enclosing
/// config file is the same path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectKey(PathBuf);

impl ProjectKey {
    pub fn new(config_file: impl Into<PathBuf>) -> Result<Self, InvalidProjectKey> {
        let path = config_file.into();
        if !path.is_absolute() || path.parent().is_none() || path.file_name().is_none() {
            return Err(InvalidProjectKey { path });
        }
        Ok(Self(path))
    }

    /// The config file that defines this project.
    #[must_use]
    pub fn config_file(&self) -> &Path {
        &self.0
    }

    /// The directory the config file lives in.
    #[must_use]
    pub fn root(&self) -> &Path {
        // Construction guarantees a parent.
        self.0.parent().unwrap_or(&self.0)
    }

    /// Whether `path` lives somewhere under this project's root directory.
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(self.root())
    }
}

impl fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}
