//! Files that importing rewrites in place.
//!
//! The utility VM boot configuration store is modified by the layer import itself, so its
//! content is mirrored byte-for-byte into a backup file inside the layer directory while
//! the entry is replayed. A caller that needs the pristine content reads the backup later.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Archive path of a mutated file and the backup file name it is mirrored to.
pub const MUTATED_FILES: &[(&str, &str)] = &[
    ("UtilityVM/Files/EFI/Microsoft/Boot/BCD", "bcd.bak"),
    ("UtilityVM/Files/EFI/Microsoft/Boot/BCD.LOG", "bcd.log.bak"),
    ("UtilityVM/Files/EFI/Microsoft/Boot/BCD.LOG1", "bcd.log1.bak"),
    ("UtilityVM/Files/EFI/Microsoft/Boot/BCD.LOG2", "bcd.log2.bak"),
];

/// Backup file name for an archive entry, if the entry is a mutated file.
pub fn backup_name(name: &str) -> Option<&'static str> {
    MUTATED_FILES
        .iter()
        .find(|(path, _)| *path == name)
        .map(|(_, backup)| *backup)
}

/// Location of the backup for `name` inside `layer`, if it has one.
pub fn backup_path(layer: &Path, name: &str) -> Option<PathBuf> {
    backup_name(name).map(|backup| layer.join(backup))
}

/// Writes every chunk to two sinks.
pub struct Tee<A, B> {
    primary: A,
    mirror: B,
}

impl<A: Write, B: Write> Tee<A, B> {
    pub fn new(primary: A, mirror: B) -> Self {
        Self { primary, mirror }
    }
}

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Both sinks must see the same bytes, so never report a partial write
        self.primary.write_all(buf)?;
        self.mirror.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.primary.flush()?;
        self.mirror.flush()
    }
}

/// Creates (or truncates) the backup file at `path`.
pub fn create_backup(path: &Path) -> Result<File> {
    File::create(path).with_context(|| format!("Failed to create backup file: {}", path.display()))
}

/// Flushes the backup to disk and closes it, reporting any failure.
pub fn close_backup(mut file: File, path: &Path) -> Result<()> {
    file.flush()
        .and_then(|_| file.sync_all())
        .with_context(|| format!("Failed to close backup file: {}", path.display()))
}
