//! Layer-store driver interface.
//!
//! A driver materializes layers on disk. The transcoder needs four lifecycle calls for
//! export, a [`LayerReader`] enumerating a layer's delta, and a [`LayerWriter`] that
//! builds a new layer one file at a time. Writer operations are one-shot and order
//! sensitive: bytes written and blocks added belong to the file most recently added.

use crate::backup_stream::StreamBlock;
use crate::file_info::FileInfo;
use anyhow::Result;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// One item of a layer's delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerEntry {
    /// Path relative to the layer root, in native form.
    pub name: PathBuf,
    /// Size of the primary data in bytes.
    pub size: u64,
    /// `None` when the entry records a deletion of `name` relative to the parents.
    pub info: Option<FileInfo>,
}

/// Enumerates a layer. Reading yields the primary data of the current entry.
pub trait LayerReader: Read {
    /// Advances to the next entry; `None` once the layer is exhausted.
    fn next(&mut self) -> Result<Option<LayerEntry>>;

    /// Tagged blocks (security descriptor, alternate streams, ...) of the current entry.
    fn streams(&mut self) -> Result<Vec<StreamBlock>>;

    fn close(self: Box<Self>) -> Result<()>;
}

/// Builds a layer. Writing appends primary data to the most recently added file.
pub trait LayerWriter: Write {
    fn add(&mut self, name: &Path, info: &FileInfo) -> Result<()>;

    /// Records that `name` is deleted relative to the parent layers.
    fn remove(&mut self, name: &Path) -> Result<()>;

    /// Adds `name` as a hard link to `target`.
    fn add_link(&mut self, name: &Path, target: &Path) -> Result<()>;

    /// Attaches a tagged block to the most recently added file.
    fn add_stream(&mut self, block: &StreamBlock) -> Result<()>;

    /// Finalizes the layer. Must be called exactly once.
    fn close(self: Box<Self>) -> Result<()>;
}

/// Layer store operations used by export and import.
///
/// `parents` are always ordered from lowest to highest precedence.
pub trait LayerDriver {
    fn activate(&self, layer: &Path) -> Result<()>;
    fn prepare(&self, layer: &Path, parents: &[PathBuf]) -> Result<()>;
    fn unprepare(&self, layer: &Path) -> Result<()>;
    fn deactivate(&self, layer: &Path) -> Result<()>;

    fn open_reader<'a>(
        &'a self,
        layer: &Path,
        parents: &[PathBuf],
    ) -> Result<Box<dyn LayerReader + 'a>>;

    fn open_writer<'a>(
        &'a self,
        home: &Path,
        id: &str,
        parents: &[PathBuf],
    ) -> Result<Box<dyn LayerWriter + 'a>>;
}

impl<T: LayerDriver + ?Sized> LayerDriver for &T {
    fn activate(&self, layer: &Path) -> Result<()> {
        (**self).activate(layer)
    }

    fn prepare(&self, layer: &Path, parents: &[PathBuf]) -> Result<()> {
        (**self).prepare(layer, parents)
    }

    fn unprepare(&self, layer: &Path) -> Result<()> {
        (**self).unprepare(layer)
    }

    fn deactivate(&self, layer: &Path) -> Result<()> {
        (**self).deactivate(layer)
    }

    fn open_reader<'a>(
        &'a self,
        layer: &Path,
        parents: &[PathBuf],
    ) -> Result<Box<dyn LayerReader + 'a>> {
        (**self).open_reader(layer, parents)
    }

    fn open_writer<'a>(
        &'a self,
        home: &Path,
        id: &str,
        parents: &[PathBuf],
    ) -> Result<Box<dyn LayerWriter + 'a>> {
        (**self).open_writer(home, id, parents)
    }
}
