//! Mount point management for staging and publish targets.
//!
//! Mount table state is the only record of whether a volume is staged or
//! published, so every mutation first asks the host what the path currently
//! is. All operations tolerate leftovers from an earlier, partially completed
//! attempt.

use std::ffi::OsString;
use std::io;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::exec::{CommandRunner, ExecError, Outcome, argv};

/// Default mount table consulted by [`HostMounter`].
pub const DEFAULT_MOUNT_TABLE: &str = "/proc/mounts";
/// Default deadline for mount/umount invocations.
pub const DEFAULT_MOUNT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum MountError {
    #[error("failed to {op} {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("'{command}' failed: {output}")]
    CommandFailed { command: String, output: String },

    #[error("'{command}' timed out")]
    TimedOut { command: String },
}

impl MountError {
    fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        MountError::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Host mount primitives.
#[tonic::async_trait]
pub trait Mounter: Send + Sync {
    /// Whether `path` is a mount point. A missing path is reported as an
    /// `io::ErrorKind::NotFound` error.
    async fn is_mount_point(&self, path: &Path) -> io::Result<bool>;

    async fn bind_mount(&self, source: &Path, target: &Path) -> Result<(), MountError>;

    async fn unmount(&self, target: &Path) -> Result<(), MountError>;
}

/// [`Mounter`] backed by the kernel mount table and `mount`/`umount`.
pub struct HostMounter {
    runner: Arc<dyn CommandRunner>,
    mount_table: PathBuf,
    timeout: Duration,
}

impl HostMounter {
    pub fn new(runner: Arc<dyn CommandRunner>, mount_table: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            runner,
            mount_table: mount_table.into(),
            timeout,
        }
    }

    async fn run(&self, cmd: Vec<String>) -> Result<String, MountError> {
        let result = self.runner.run(&cmd, self.timeout).await?;
        match result.outcome {
            Outcome::Success => Ok(result.output),
            Outcome::TimedOut => Err(MountError::TimedOut {
                command: cmd.join(" "),
            }),
            Outcome::Failed(_) => Err(MountError::CommandFailed {
                command: cmd.join(" "),
                output: result.output.trim().to_string(),
            }),
        }
    }
}

#[tonic::async_trait]
impl Mounter for HostMounter {
    async fn is_mount_point(&self, path: &Path) -> io::Result<bool> {
        fs::symlink_metadata(path).await?;

        // NotFound is reserved for a missing path; a missing table is a host failure
        let table = fs::read_to_string(&self.mount_table).await.map_err(|e| {
            io::Error::other(format!(
                "failed to read mount table {}: {}",
                self.mount_table.display(),
                e
            ))
        })?;
        let canonical = fs::canonicalize(path).await.ok();

        Ok(mount_points(&table)
            .iter()
            .any(|mp| mp == path || canonical.as_deref() == Some(mp.as_path())))
    }

    async fn bind_mount(&self, source: &Path, target: &Path) -> Result<(), MountError> {
        let cmd = argv([
            "mount",
            "--bind",
            &*source.to_string_lossy(),
            &*target.to_string_lossy(),
        ]);
        self.run(cmd).await.map(|_| ())
    }

    async fn unmount(&self, target: &Path) -> Result<(), MountError> {
        match self.run(argv(["umount", &*target.to_string_lossy()])).await {
            Err(MountError::CommandFailed { output, .. }) if output.contains("not mounted") => {
                warn!(target = %target.display(), "Path was not mounted");
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }
}

/// Mount points listed in a `/proc/mounts` style table.
fn mount_points(table: &str) -> Vec<PathBuf> {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(unescape_mount_field)
        .collect()
}

/// Undo the kernel's octal escaping (`\040` for space, `\011` for tab, ...).
fn unescape_mount_field(field: &str) -> PathBuf {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..=i + 3].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = bytes[i + 1..=i + 3]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    PathBuf::from(OsString::from_vec(out))
}

/// Idempotent mount point operations over a [`Mounter`].
#[derive(Clone)]
pub struct MountManager {
    mounter: Arc<dyn Mounter>,
}

impl MountManager {
    pub fn new(mounter: Arc<dyn Mounter>) -> Self {
        Self { mounter }
    }

    /// Whether `path` is currently a mount point. A missing path is not.
    pub async fn is_mount_point(&self, path: &Path) -> Result<bool, MountError> {
        match self.mounter.is_mount_point(path).await {
            Ok(mounted) => Ok(mounted),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(MountError::io("check mount point", path, e)),
        }
    }

    /// Make sure `path` can receive a block device bind mount.
    ///
    /// Returns true when the path is already a mount point, in which case
    /// nothing is touched. Otherwise the parent directory and an empty
    /// placeholder file are created if missing; existing files are kept.
    pub async fn ensure_mount_target(&self, path: &Path) -> Result<bool, MountError> {
        if self.is_mount_point(path).await? {
            info!(path = %path.display(), "Already mounted");
            return Ok(true);
        }

        if let Some(parent) = path.parent() {
            debug!(dir = %parent.display(), "Creating mount point parent");
            fs::create_dir_all(parent)
                .await
                .map_err(|e| MountError::io("create parent dir of", path, e))?;
        }

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .await
        {
            Ok(_) => info!(path = %path.display(), "Created block device target file"),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!(path = %path.display(), "Block device target file already exists");
            }
            Err(e) => return Err(MountError::io("create block device target file", path, e)),
        }

        Ok(false)
    }

    pub async fn bind_mount(&self, source: &Path, target: &Path) -> Result<(), MountError> {
        info!(source = %source.display(), target = %target.display(), "Creating bind mount");
        self.mounter.bind_mount(source, target).await.inspect_err(|e| {
            error!(error = %e, source = %source.display(), target = %target.display(), "bind mount failed");
        })
    }

    /// Unmount `path`, then remove the placeholder and its parent if empty.
    ///
    /// A path that is not a mount point, including one that does not exist,
    /// is considered torn down already.
    pub async fn teardown(&self, path: &Path) -> Result<(), MountError> {
        if !self.is_mount_point(path).await? {
            info!(path = %path.display(), "Not a mount point, nothing to tear down");
            return Ok(());
        }

        info!(path = %path.display(), "Unmounting");
        self.mounter.unmount(path).await?;

        match fs::symlink_metadata(path).await {
            Ok(meta) => {
                let removed = if meta.is_dir() {
                    fs::remove_dir(path).await
                } else {
                    fs::remove_file(path).await
                };
                match removed {
                    Ok(()) => info!(path = %path.display(), "Removed mount point"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(MountError::io("remove mount point", path, e)),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(MountError::io("stat mount point", path, e)),
        }

        if let Some(parent) = path.parent() {
            match fs::remove_dir(parent).await {
                Ok(()) => info!(dir = %parent.display(), "Removed empty parent directory"),
                // Other volumes may share the parent
                Err(e) if e.kind() == io::ErrorKind::DirectoryNotEmpty => {
                    debug!(dir = %parent.display(), "Parent directory not empty, keeping it");
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(MountError::io("remove parent dir", parent, e)),
            }
        }

        Ok(())
    }
}
