//! PID file guard for single-instance enforcement.
//!
//! A PID file maps one path to the process currently owning the service.
//! Acquisition fails when another process already holds the path; the owning
//! process may acquire it again without error.
//!
//! The guard does not watch for process termination. A process killed without
//! running its shutdown callbacks (crash, `kill -9`) leaves a stale file behind
//! that an operator has to remove by hand.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Permissions for newly created PID files (owner read/write, world read)
#[cfg(unix)]
const PID_FILE_MODE: u32 = 0o644;

#[derive(Debug, thiserror::Error)]
pub enum PidFileError {
    #[error("PID file {} is held by process {holder}. Please delete it and try again.", path.display())]
    AlreadyRunning { path: PathBuf, holder: String },

    #[error("PID file {} does not contain a valid PID: {contents:?}", path.display())]
    Corrupt { path: PathBuf, contents: String },

    #[error("PID file {} I/O error: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A PID file path bound to the process identity that will write it.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
    pid: u32,
}

impl PidFile {
    /// Bind `path` to the current process.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_pid(path, std::process::id())
    }

    /// Bind `path` to an explicit process identity.
    pub fn with_pid(path: impl Into<PathBuf>, pid: u32) -> Self {
        Self {
            path: path.into(),
            pid,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Claim the PID file for this identity.
    ///
    /// Creation uses `create_new`, so two processes racing for the same path
    /// cannot both win. If the file already holds our own PID the call is a
    /// no-op and the file is left untouched.
    pub fn acquire(&self) -> Result<(), PidFileError> {
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(PID_FILE_MODE);
        }

        match options.open(&self.path) {
            Ok(mut file) => {
                file.write_all(self.pid.to_string().as_bytes())
                    .map_err(|source| self.io_error(source))?;
                tracing::debug!(path = %self.path.display(), pid = self.pid, "PID file written");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let contents =
                    fs::read_to_string(&self.path).map_err(|source| self.io_error(source))?;
                match contents.trim().parse::<u32>() {
                    Ok(holder) if holder == self.pid => {
                        tracing::debug!(path = %self.path.display(), pid = self.pid, "PID file already ours");
                        Ok(())
                    }
                    _ => Err(PidFileError::AlreadyRunning {
                        path: self.path.clone(),
                        holder: contents.trim().to_string(),
                    }),
                }
            }
            Err(source) => Err(self.io_error(source)),
        }
    }

    /// Delete the PID file. A file that is already gone counts as released.
    pub fn release(&self) -> Result<(), PidFileError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "PID file removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(self.io_error(source)),
        }
    }

    fn io_error(&self, source: io::Error) -> PidFileError {
        PidFileError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Read and parse the PID stored at `path`.
///
/// Returns `Ok(None)` when the file does not exist.
pub fn read_pid(path: &Path) -> Result<Option<u32>, PidFileError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(PidFileError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    contents
        .trim()
        .parse::<u32>()
        .map(Some)
        .map_err(|_| PidFileError::Corrupt {
            path: path.to_path_buf(),
            contents,
        })
}
