use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use rand::RngCore;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct LockToken {
    pid: u32,
    acquired_at: DateTime<Utc>,
    /// Identifies one acquisition; release only clears a marker carrying it.
    nonce: String,
}

/// Global single-flight guard for the image rebuild, backed by a marker file.
///
/// A marker older than the TTL is treated as left behind by a crashed holder
/// and taken over. Every check-and-replace on the marker runs under an
/// exclusive `flock` on a sidecar file, so takeover and release are atomic
/// across threads and processes.
#[derive(Debug, Clone)]
pub struct RebuildLock {
    path: PathBuf,
    ttl: Duration,
}

/// Removes the marker when dropped, unless another holder has taken it over.
#[derive(Debug)]
pub struct RebuildGuard {
    lock: RebuildLock,
    nonce: String,
}

impl Drop for RebuildGuard {
    fn drop(&mut self) {
        let path = &self.lock.path;
        let _serial = match self.lock.serialize() {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to release rebuild lock");
                return;
            }
        };
        match read_token(path) {
            Some(token) if token.nonce == self.nonce => {
                if let Err(e) = fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "failed to release rebuild lock");
                }
            }
            Some(token) => warn!(
                path = %path.display(),
                holder_pid = token.pid,
                "rebuild lock was taken over, leaving the new holder's marker"
            ),
            None => debug!(path = %path.display(), "rebuild lock marker already gone"),
        }
    }
}

impl RebuildLock {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn serial_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".flock");
        PathBuf::from(name)
    }

    /// Blocks until this process holds the sidecar flock. The critical
    /// sections it protects only touch the marker file.
    fn serialize(&self) -> std::io::Result<File> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.serial_path())?;
        flock_exclusive(&file)?;
        Ok(file)
    }

    /// Never waits on a rebuild. `None` means another holder owns the lock,
    /// or the marker could not be written at all.
    pub fn try_acquire(&self) -> Option<RebuildGuard> {
        let _serial = match self.serialize() {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to lock rebuild marker");
                return None;
            }
        };
        match self.create_marker() {
            Ok(guard) => Some(guard),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if !self.is_stale() {
                    return None;
                }
                warn!(path = %self.path.display(), "taking over stale rebuild lock");
                if let Err(e) = fs::remove_file(&self.path) {
                    if e.kind() != ErrorKind::NotFound {
                        warn!(path = %self.path.display(), error = %e, "failed to clear stale rebuild lock");
                        return None;
                    }
                }
                match self.create_marker() {
                    Ok(guard) => Some(guard),
                    Err(e) => {
                        warn!(path = %self.path.display(), error = %e, "failed to create rebuild lock");
                        None
                    }
                }
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to create rebuild lock");
                None
            }
        }
    }

    /// Must run under `serialize`.
    fn create_marker(&self) -> std::io::Result<RebuildGuard> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        let token = LockToken {
            pid: std::process::id(),
            acquired_at: Utc::now(),
            nonce: new_nonce(),
        };
        let written = serde_json::to_vec(&token)
            .map_err(std::io::Error::other)
            .and_then(|payload| file.write_all(&payload))
            .and_then(|()| file.sync_all());
        if let Err(e) = written {
            let _ = fs::remove_file(&self.path);
            return Err(e);
        }
        Ok(RebuildGuard {
            lock: self.clone(),
            nonce: token.nonce,
        })
    }

    fn is_stale(&self) -> bool {
        let acquired_at = match read_token(&self.path) {
            Some(token) => token.acquired_at,
            // An unreadable payload falls back to the file's mtime.
            None => match fs::metadata(&self.path).and_then(|m| m.modified()) {
                Ok(modified) => DateTime::<Utc>::from(modified),
                Err(_) => return false,
            },
        };
        let age = Utc::now().signed_duration_since(acquired_at);
        age.to_std().map(|age| age > self.ttl).unwrap_or(false)
    }
}

fn new_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(unix)]
fn flock_exclusive(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = file.as_raw_fd();
    loop {
        // SAFETY: `fd` is a valid descriptor owned by `file` for the whole call.
        let result = unsafe { libc::flock(fd, libc::LOCK_EX) };
        if result == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(unix))]
fn flock_exclusive(_file: &File) -> std::io::Result<()> {
    Ok(())
}

fn read_token(path: &Path) -> Option<LockToken> {
    let raw = fs::read(path).ok()?;
    serde_json::from_slice(&raw).ok()
}

/// Refreshes the shared sandbox image.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn rebuild(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct ShellImageBuilder {
    pub source_dir: PathBuf,
    pub image: String,
    pub dockerfile: String,
    pub sync_timeout: Duration,
    pub build_timeout: Duration,
}

#[async_trait]
impl ImageBuilder for ShellImageBuilder {
    async fn rebuild(&self) -> anyhow::Result<()> {
        info!(source_dir = %self.source_dir.display(), "syncing image source");
        run_command(
            "git",
            &["pull", "--ff-only"],
            &self.source_dir,
            self.sync_timeout,
        )
        .await
        .context("source sync")?;

        info!(image = %self.image, "building image");
        run_command(
            "docker",
            &["build", "-t", &self.image, "-f", &self.dockerfile, "."],
            &self.source_dir,
            self.build_timeout,
        )
        .await
        .context("image build")?;

        info!(image = %self.image, "image rebuilt");
        Ok(())
    }
}

/// Runs a command to completion under a hard timeout. The child is killed if
/// the timeout elapses.
pub(crate) async fn run_command(
    program: &str,
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
) -> anyhow::Result<()> {
    let child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawn {program}"))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output.with_context(|| format!("wait for {program}"))?,
        Err(_) => bail!("{program} timed out after {}s", timeout.as_secs_f64()),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "{program} exited with {}: {}",
            output.status,
            tail_lines(&stderr, 20)
        );
    }
    Ok(())
}

fn tail_lines(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim_end().lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
