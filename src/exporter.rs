//! Layer → OCI tar stream.
//!
//! [`LayerExporter`] brackets the export with the driver lifecycle (activate, prepare,
//! unprepare, and finally deactivate), enumerates the layer with a [`LayerReader`], and
//! writes one tar entry per layer entry:
//! - deletions become empty whiteout entries (`dir/.wh.name`),
//! - everything else becomes a header built from the file's metadata and a body holding
//!   its primary data followed by its tagged blocks (see [`crate::backup_stream`]).
//!
//! The end-of-archive trailer is only written when every entry made it into the stream.
//! After an error or cancellation the sink holds an unterminated archive that must be
//! discarded.

use crate::backup_stream;
use crate::cancel::{is_cancelled, CancelToken};
use crate::driver::{LayerDriver, LayerReader};
use crate::notifier::Notifier;
use crate::release::first_error;
use crate::whiteout;
use anyhow::{Context, Result};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tar_rs as tar;

/// Sink wrapper that refuses further writes once sealed.
///
/// `tar::Builder` appends the end-of-archive trailer when dropped; sealing the sink after
/// a failure keeps a partial export unterminated.
struct ExportSink<W: Write> {
    inner: W,
    sealed: bool,
}

impl<W: Write> ExportSink<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            sealed: false,
        }
    }

    fn seal(&mut self) {
        self.sealed = true;
    }
}

impl<W: Write> Write for ExportSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.sealed {
            return Err(io::Error::new(io::ErrorKind::Other, "export stream abandoned"));
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.sealed {
            return Ok(());
        }
        self.inner.flush()
    }
}

/// Writes OCI layer tar streams from on-disk layers managed by `D`.
pub struct LayerExporter<D: LayerDriver> {
    driver: D,
    notifier: Notifier,
}

impl<D: LayerDriver> LayerExporter<D> {
    pub fn new(driver: D, notifier: Notifier) -> Self {
        Self { driver, notifier }
    }

    /// Export `layer` as an OCI tar stream into `sink`.
    ///
    /// `parents` must be ordered from lowest to highest precedence. The layer is activated
    /// for the duration of the call, so the caller must not have it mounted.
    ///
    /// # Errors
    /// - Driver lifecycle, enumeration or tar encoding failures.
    /// - [`crate::cancel::Cancelled`] if `cancel` trips; check with
    ///   [`crate::cancel::is_cancelled`].
    pub fn export<W: Write>(
        &self,
        cancel: &CancelToken,
        sink: W,
        layer: &Path,
        parents: &[PathBuf],
    ) -> Result<()> {
        self.notifier
            .info(&format!("Exporting layer {}", layer.display()));
        self.notifier
            .debug(&format!("Parent layers: {:?}", parents));

        let result = self.export_layer(cancel, sink, layer, parents);
        match &result {
            Ok(()) => self
                .notifier
                .finish(&format!("Exported layer {}", layer.display())),
            Err(err) if is_cancelled(err) => self
                .notifier
                .abort(&format!("Export of layer {} cancelled", layer.display())),
            Err(err) => self.notifier.abort(&format!(
                "Export of layer {} failed: {:#}",
                layer.display(),
                err
            )),
        }
        result
    }

    fn export_layer<W: Write>(
        &self,
        cancel: &CancelToken,
        sink: W,
        layer: &Path,
        parents: &[PathBuf],
    ) -> Result<()> {
        self.driver
            .activate(layer)
            .with_context(|| format!("Failed to activate layer {}", layer.display()))?;

        let result = self.export_activated(cancel, sink, layer, parents);
        let deactivated = self
            .driver
            .deactivate(layer)
            .with_context(|| format!("Failed to deactivate layer {}", layer.display()));
        first_error(result, deactivated)
    }

    fn export_activated<W: Write>(
        &self,
        cancel: &CancelToken,
        sink: W,
        layer: &Path,
        parents: &[PathBuf],
    ) -> Result<()> {
        // Prepare and unprepare so the on-disk layer is fully initialized
        self.driver
            .prepare(layer, parents)
            .with_context(|| format!("Failed to prepare layer {}", layer.display()))?;
        self.driver
            .unprepare(layer)
            .with_context(|| format!("Failed to unprepare layer {}", layer.display()))?;

        let mut reader = self
            .driver
            .open_reader(layer, parents)
            .with_context(|| format!("Failed to open reader for layer {}", layer.display()))?;

        let result = self.write_tar_from_layer(cancel, &mut *reader, sink);
        let closed = reader
            .close()
            .with_context(|| format!("Failed to close reader for layer {}", layer.display()));
        first_error(result, closed)
    }

    fn write_tar_from_layer<W: Write>(
        &self,
        cancel: &CancelToken,
        reader: &mut dyn LayerReader,
        sink: W,
    ) -> Result<()> {
        let mut builder = tar::Builder::new(ExportSink::new(sink));

        match self.write_entries(cancel, reader, &mut builder) {
            Ok(count) => {
                let mut sink = builder.into_inner().context("Failed to finish tar stream")?;
                sink.flush().context("Failed to flush tar stream")?;
                self.notifier
                    .debug(&format!("Wrote {} entries", count));
                Ok(())
            }
            Err(err) => {
                builder.get_mut().seal();
                Err(err)
            }
        }
    }

    fn write_entries<W: Write>(
        &self,
        cancel: &CancelToken,
        reader: &mut dyn LayerReader,
        builder: &mut tar::Builder<W>,
    ) -> Result<u64> {
        let mut count = 0u64;
        loop {
            cancel.check()?;

            let Some(entry) = reader.next().context("Failed to read next layer entry")? else {
                break;
            };
            let name = whiteout::to_archive_path(&entry.name)?;

            match &entry.info {
                None => {
                    let marker = whiteout::whiteout_name(&name);
                    self.notifier
                        .trace(&format!("Writing whiteout {} for deleted {}", marker, name));
                    let mut header = tar::Header::new_gnu();
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_size(0);
                    header.set_mode(0o644);
                    builder
                        .append_data(&mut header, &marker, io::empty())
                        .with_context(|| format!("Failed to write whiteout for {}", name))?;
                }
                Some(info) => {
                    self.notifier
                        .trace(&format!("Writing {} ({} bytes)", name, entry.size));
                    let blocks = reader
                        .streams()
                        .with_context(|| format!("Failed to read streams of {}", name))?;
                    backup_stream::append_file(builder, &name, info, entry.size, reader, &blocks)?;
                }
            }

            count += 1;
            self.notifier.progress(count, "Entries exported");
        }
        Ok(count)
    }
}
