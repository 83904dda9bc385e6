//! Job payloads: scripts to upload and ad-hoc commands.

use std::path::{Path, PathBuf};

use crate::util::remote_join;
use crate::{Error, Result};

/// Name of the entry point inside a directory-mode script.
pub const ENTRY_POINT: &str = "script";

/// A local file, or a directory with an entry point, to run remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    path: PathBuf,
    name: String,
    dir_mode: bool,
}

impl Script {
    /// Inspect `path` on the local filesystem.
    ///
    /// A plain file is never directory mode. A directory is directory mode
    /// only if it contains a file named `script`; otherwise it is rejected.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let invalid = |reason: String| Error::InvalidScript {
            path: path.to_path_buf(),
            reason,
        };

        let meta = std::fs::metadata(path).map_err(|e| invalid(e.to_string()))?;

        let dir_mode = if meta.is_dir() {
            if !path.join(ENTRY_POINT).is_file() {
                return Err(invalid(format!("directory has no `{}` entry point", ENTRY_POINT)));
            }
            true
        } else {
            false
        };

        let name = match path.file_name() {
            Some(name) => name.to_string_lossy().to_string(),
            None => path
                .canonicalize()
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
                .ok_or_else(|| invalid("cannot determine file name".to_string()))?,
        };

        Ok(Self {
            path: path.to_path_buf(),
            name,
            dir_mode,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Base name the payload has once uploaded.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_dir_mode(&self) -> bool {
        self.dir_mode
    }

    /// Path of the executable once the payload is uploaded into `workspace`.
    pub fn remote_entry_point(&self, workspace: &str) -> String {
        let uploaded = remote_join(workspace, &self.name);
        if self.dir_mode {
            remote_join(&uploaded, ENTRY_POINT)
        } else {
            uploaded
        }
    }
}

/// An ad-hoc shell command, run without upload or cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    cmd: String,
}

impl Command {
    pub fn new(cmd: &str) -> Result<Self> {
        if cmd.trim().is_empty() {
            return Err(Error::Validation("Command cannot be empty".to_string()));
        }
        Ok(Self {
            cmd: cmd.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.cmd
    }
}
