//! OCI tar stream → layer.
//!
//! [`LayerImporter`] opens a [`LayerWriter`] for the target layer and replays the archive
//! in stream order. Each entry is one of:
//! - a whiteout (`dir/.wh.name`) → `remove(dir/name)`, shadowing the parents' copy;
//! - a hard link → `add_link(name, target)`;
//! - anything else → `add(name, info)`, then the primary data is written to the writer and
//!   the trailing tagged blocks are attached with `add_stream`.
//!
//! Entries listed in [`crate::mutated`] have their primary data mirrored into a backup file
//! in the layer directory. The writer is closed exactly once whatever happens, and the
//! first error encountered is the one reported.

use crate::backup_stream::{self, EntryMetadata};
use crate::cancel::{is_cancelled, CancelToken};
use crate::driver::{LayerDriver, LayerWriter};
use crate::mutated::{self, Tee};
use crate::notifier::Notifier;
use crate::release::first_error;
use crate::whiteout;
use anyhow::{anyhow, bail, Context, Result};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tar_rs as tar;

/// Builds on-disk layers managed by `D` from OCI layer tar streams.
pub struct LayerImporter<D: LayerDriver> {
    driver: D,
    notifier: Notifier,
}

/// Splits a layer path into the driver home directory and the layer id.
fn split_layer_path(layer: &Path) -> Result<(PathBuf, String)> {
    let id = layer
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("Layer path has no usable id: {}", layer.display()))?;
    let home = layer.parent().map(Path::to_path_buf).unwrap_or_default();
    Ok((home, id.to_string()))
}

/// Copies exactly `size` bytes, failing on a short source.
fn copy_exact<R: Read, W: Write + ?Sized>(src: R, dst: &mut W, size: u64, name: &str) -> Result<()> {
    let copied = io::copy(&mut src.take(size), dst)
        .with_context(|| format!("Failed to write data of {}", name))?;
    if copied != size {
        bail!(
            "Truncated body for {}: expected {} bytes, got {}",
            name,
            size,
            copied
        );
    }
    Ok(())
}

impl<D: LayerDriver> LayerImporter<D> {
    pub fn new(driver: D, notifier: Notifier) -> Self {
        Self { driver, notifier }
    }

    /// Import the OCI tar stream `source` into `layer`, returning the total size of the
    /// layer's files in bytes.
    ///
    /// `parents` must be ordered from lowest to highest precedence. The caller must
    /// already hold whatever privileges the driver needs to write layers.
    ///
    /// # Errors
    /// - Malformed or truncated archives.
    /// - Writer failures, including the final close.
    /// - [`crate::cancel::Cancelled`] if `cancel` trips; the writer is still closed.
    pub fn import<R: Read>(
        &self,
        cancel: &CancelToken,
        source: R,
        layer: &Path,
        parents: &[PathBuf],
    ) -> Result<u64> {
        self.notifier
            .info(&format!("Importing layer {}", layer.display()));

        let result = self.import_layer(cancel, source, layer, parents);
        match &result {
            Ok(size) => self.notifier.finish(&format!(
                "Imported layer {} ({} bytes)",
                layer.display(),
                size
            )),
            Err(err) if is_cancelled(err) => self
                .notifier
                .abort(&format!("Import of layer {} cancelled", layer.display())),
            Err(err) => self.notifier.abort(&format!(
                "Import of layer {} failed: {:#}",
                layer.display(),
                err
            )),
        }
        result
    }

    fn import_layer<R: Read>(
        &self,
        cancel: &CancelToken,
        source: R,
        layer: &Path,
        parents: &[PathBuf],
    ) -> Result<u64> {
        let (home, id) = split_layer_path(layer)?;
        self.notifier.debug(&format!(
            "Layer home: {}, id: {}, parents: {:?}",
            home.display(),
            id,
            parents
        ));

        let mut writer = self
            .driver
            .open_writer(&home, &id, parents)
            .with_context(|| format!("Failed to open writer for layer {}", layer.display()))?;

        let result = self.apply_archive(cancel, source, &mut *writer, layer);
        // A failed close can leave an invalid layer on disk, so it is never dropped silently
        let closed = writer
            .close()
            .with_context(|| format!("Failed to finalize layer {}", layer.display()));
        first_error(result, closed)
    }

    fn apply_archive<R: Read>(
        &self,
        cancel: &CancelToken,
        source: R,
        writer: &mut dyn LayerWriter,
        layer: &Path,
    ) -> Result<u64> {
        let mut archive = tar::Archive::new(source);
        let mut entries = archive.entries().context("Failed to read tar stream")?;
        let mut total = 0u64;
        let mut count = 0u64;

        loop {
            cancel.check()?;

            let Some(entry) = entries.next() else {
                break;
            };
            let mut entry = entry.context("Failed to read tar entry")?;

            let name = {
                let path = entry.path().context("Failed to get entry path")?;
                path.to_str()
                    .ok_or_else(|| anyhow!("Non UTF-8 entry name: {}", path.display()))?
                    .trim_end_matches('/')
                    .to_string()
            };

            if let Some((dir, base)) = whiteout::decode(&name) {
                let original = whiteout::original_path(&name);
                self.notifier
                    .trace(&format!("Whiteout {} removes {:?} from {:?}", name, base, dir));
                writer
                    .remove(&whiteout::to_native_path(&original))
                    .with_context(|| format!("Failed to remove {}", original))?;
            } else if entry.header().entry_type() == tar::EntryType::Link {
                let target = entry
                    .link_name()
                    .context("Failed to get hardlink target")?
                    .ok_or_else(|| anyhow!("Hardlink without target: {}", name))?;
                let target = target
                    .to_str()
                    .ok_or_else(|| anyhow!("Non UTF-8 hardlink target for {}", name))?
                    .to_string();
                self.notifier
                    .trace(&format!("Linking {} -> {}", name, target));
                writer
                    .add_link(
                        &whiteout::to_native_path(&name),
                        &whiteout::to_native_path(&target),
                    )
                    .with_context(|| format!("Failed to link {} to {}", name, target))?;
            } else {
                let meta = backup_stream::metadata_from_entry(&mut entry)
                    .with_context(|| format!("Invalid metadata for {}", name))?;
                writer
                    .add(&whiteout::to_native_path(&name), &meta.info)
                    .with_context(|| format!("Failed to add {}", name))?;
                total += meta.size;
                self.replay_body(&mut entry, writer, &name, &meta, layer)?;
            }

            count += 1;
            self.notifier.progress(count, "Entries imported");
        }

        self.notifier
            .debug(&format!("Applied {} entries, {} bytes", count, total));
        Ok(total)
    }

    /// Replays an entry body onto the writer: primary data first, then tagged blocks.
    fn replay_body<R: Read>(
        &self,
        body: &mut R,
        writer: &mut dyn LayerWriter,
        name: &str,
        meta: &EntryMetadata,
        layer: &Path,
    ) -> Result<()> {
        match mutated::backup_path(layer, name) {
            Some(backup_path) => {
                self.notifier.debug(&format!(
                    "Backing up mutated file {} to {}",
                    name,
                    backup_path.display()
                ));
                let mut backup = mutated::create_backup(&backup_path)?;
                let result = {
                    let mut tee = Tee::new(&mut *writer, &mut backup);
                    copy_exact(&mut *body, &mut tee, meta.size, name).and_then(|_| {
                        tee.flush()
                            .with_context(|| format!("Failed to flush data of {}", name))
                    })
                };
                let closed = mutated::close_backup(backup, &backup_path);
                first_error(result, closed)?;
            }
            None => {
                copy_exact(&mut *body, writer, meta.size, name)?;
                writer
                    .flush()
                    .with_context(|| format!("Failed to flush data of {}", name))?;
            }
        }

        let mut blocks = body.take(meta.block_len);
        while let Some(block) = backup_stream::read_block(&mut blocks)
            .with_context(|| format!("Invalid stream blocks for {}", name))?
        {
            writer
                .add_stream(&block)
                .with_context(|| format!("Failed to add {:?} stream to {}", block.kind, name))?;
        }
        if blocks.limit() != 0 {
            bail!("Truncated stream blocks for {}", name);
        }
        Ok(())
    }
}
