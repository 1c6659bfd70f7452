//! Single-mount-per-target manager.
//!
//! Windows can only mount a single layer at a given location; parent layers travel in the
//! mount options, opaquely to this module. [`LocalMounter`] therefore accepts exactly one
//! [`Mount`] from its [`Mountable`] and backs it with at most one host mount at a time:
//! - a writable `bind`/`rbind` mount is used in place, its source is returned directly;
//! - anything else is materialized into a fresh temporary directory, which is unmounted
//!   and removed by [`LocalMounter::unmount`] before another one can be created.
//!
//! Each manager serializes its own `mount`/`unmount` pair only. Distinct managers are not
//! coordinated with each other.

use anyhow::{anyhow, bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, MutexGuard};
use tempfile::TempDir;

/// Prefix of temporary mount targets.
const MOUNT_DIR_PREFIX: &str = "buildkit-mount";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub mount_type: String,
    pub source: PathBuf,
    pub options: Vec<String>,
}

impl Mount {
    pub fn is_bind(&self) -> bool {
        matches!(self.mount_type.as_str(), "bind" | "rbind")
    }

    pub fn is_read_only(&self) -> bool {
        self.options.iter().any(|opt| opt == "ro")
    }
}

/// Callback releasing whatever a [`Mountable`] acquired.
pub type Release = Box<dyn FnOnce() -> Result<()> + Send>;

/// Something that can describe the mounts backing it.
pub trait Mountable {
    fn mount(&self) -> Result<(Vec<Mount>, Option<Release>)>;
}

/// Performs host mounts.
pub trait MountBackend {
    fn mount(&self, mount: &Mount, target: &Path) -> Result<()>;
    fn unmount(&self, target: &Path) -> Result<()>;
}

/// [`MountBackend`] running the host `mount`/`umount` commands.
pub struct SystemMounter;

impl SystemMounter {
    fn run_command(&self, program: &str, args: &[&str]) -> Result<()> {
        let output = Command::new(program)
            .args(args)
            .output()
            .context(format!("Failed to execute {} command: {:?}", program, args))?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("{} command failed: {}", program, error.trim()));
        }
        Ok(())
    }
}

impl MountBackend for SystemMounter {
    fn mount(&self, mount: &Mount, target: &Path) -> Result<()> {
        let source = mount.source.to_string_lossy();
        let target = target.to_string_lossy();
        let options = mount.options.join(",");

        let mut args = vec!["-t", mount.mount_type.as_str()];
        if !options.is_empty() {
            args.extend(["-o", options.as_str()]);
        }
        args.extend([&*source, &*target]);
        self.run_command("mount", &args)
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        let target = target.to_string_lossy();
        self.run_command("umount", &[&*target])
    }
}

#[derive(Default)]
struct MounterState {
    mounts: Option<Vec<Mount>>,
    release: Option<Release>,
    target: Option<TempDir>,
}

/// Exposes a [`Mountable`] at a single local path.
pub struct LocalMounter<M: Mountable, B: MountBackend = SystemMounter> {
    mountable: M,
    backend: B,
    state: Mutex<MounterState>,
}

impl<M: Mountable> LocalMounter<M, SystemMounter> {
    pub fn new(mountable: M) -> Self {
        Self::with_backend(mountable, SystemMounter)
    }
}

impl<M: Mountable, B: MountBackend> LocalMounter<M, B> {
    pub fn with_backend(mountable: M, backend: B) -> Self {
        Self {
            mountable,
            backend,
            state: Mutex::new(MounterState::default()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn lock(&self) -> Result<MutexGuard<'_, MounterState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("Mount state lock poisoned"))
    }

    /// Returns a local path exposing the mountable's content.
    pub fn mount(&self) -> Result<PathBuf> {
        let mut state = self.lock()?;

        if let Some(target) = &state.target {
            bail!(
                "Already mounted at {}; unmount before mounting again",
                target.path().display()
            );
        }

        if state.mounts.is_none() {
            let (mounts, release) = self.mountable.mount()?;
            state.mounts = Some(mounts);
            state.release = release;
        }
        let mounts = state.mounts.as_deref().unwrap_or_default();

        if mounts.len() != 1 {
            bail!(
                "Not implemented: request to mount {} layers, only 1 is supported",
                mounts.len()
            );
        }
        let mount = mounts[0].clone();

        if mount.is_bind() && !mount.is_read_only() {
            log::debug!("Using bind source {} in place", mount.source.display());
            return Ok(mount.source);
        }

        let dir = tempfile::Builder::new()
            .prefix(MOUNT_DIR_PREFIX)
            .tempdir()
            .context("Failed to create temp dir")?;
        // On failure `dir` is dropped, which removes it
        self.backend
            .mount(&mount, dir.path())
            .with_context(|| format!("Failed to mount in-place: {:?}", mount))?;

        let target = dir.path().to_path_buf();
        log::debug!("Mounted {} at {}", mount.source.display(), target.display());
        state.target = Some(dir);
        Ok(target)
    }

    /// Unmounts and removes the materialized target, then releases the mountable.
    pub fn unmount(&self) -> Result<()> {
        let mut state = self.lock()?;

        if let Some(target) = state.target.take() {
            if let Err(err) = self.backend.unmount(target.path()) {
                // Still mounted, keep it so a later unmount can retry
                state.target = Some(target);
                return Err(err);
            }
            let path = target.path().to_path_buf();
            if let Err(err) = target.close() {
                log::warn!("Failed to remove mount target {}: {}", path.display(), err);
            }
        }

        state.mounts = None;
        match state.release.take() {
            Some(release) => release(),
            None => Ok(()),
        }
    }
}
