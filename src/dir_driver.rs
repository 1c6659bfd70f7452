//! Directory-backed layer store.
//!
//! [`DirDriver`] keeps every layer in a plain directory so layers can be exported and
//! imported on any host:
//!
//! ```text
//! <layer>/
//!   Files/            file content, one host file per layer file
//!   index.json        archive path → present (size, metadata, streams) | deleted
//!   layerchain.json   parent layer paths, lowest to highest precedence
//! ```
//!
//! Only the layer's own delta lives in `index.json`; deletions are kept as tombstones so
//! they can be exported as whiteouts again. Parents are consulted when resolving hard link
//! targets that are not part of the layer being written.

use crate::backup_stream::StreamBlock;
use crate::driver::{LayerDriver, LayerEntry, LayerReader, LayerWriter};
use crate::file_info::FileInfo;
use crate::whiteout::{to_archive_path, to_native_path};
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{btree_map, BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub const FILES_DIR: &str = "Files";
pub const INDEX_FILE: &str = "index.json";
pub const LAYER_CHAIN_FILE: &str = "layerchain.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum IndexEntry {
    Present {
        size: u64,
        info: FileInfo,
        #[serde(default)]
        streams: Vec<StreamBlock>,
    },
    Deleted,
}

/// The delta recorded by one layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerIndex {
    pub entries: BTreeMap<String, IndexEntry>,
}

/// Writes `contents` next to `dest` and renames it into place.
fn write_atomic(dir: &Path, dest: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest)
        .with_context(|| format!("Failed to persist {}", dest.display()))?;
    Ok(())
}

impl LayerIndex {
    pub fn load(layer: &Path) -> Result<Self> {
        let path = layer.join(INDEX_FILE);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read layer index: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse layer index: {}", path.display()))
    }

    pub fn save(&self, layer: &Path) -> Result<()> {
        let content = serde_json::to_vec_pretty(self).context("Failed to serialize layer index")?;
        write_atomic(layer, &layer.join(INDEX_FILE), &content)
    }

    pub fn get(&self, name: &str) -> Option<&IndexEntry> {
        self.entries.get(name)
    }
}

pub fn read_layer_chain(layer: &Path) -> Result<Vec<PathBuf>> {
    let path = layer.join(LAYER_CHAIN_FILE);
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read layer chain: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse layer chain: {}", path.display()))
}

fn write_layer_chain(layer: &Path, parents: &[PathBuf]) -> Result<()> {
    let content = serde_json::to_vec_pretty(parents).context("Failed to serialize layer chain")?;
    write_atomic(layer, &layer.join(LAYER_CHAIN_FILE), &content)
}

fn ensure_layer(layer: &Path, what: &str) -> Result<()> {
    if !layer.join(INDEX_FILE).is_file() {
        bail!("{} not found: {}", what, layer.display());
    }
    Ok(())
}

#[derive(Debug, Default)]
struct LayerState {
    prepared: bool,
}

/// Layer store keeping each layer in its own directory.
#[derive(Debug, Default)]
pub struct DirDriver {
    active: Mutex<HashMap<PathBuf, LayerState>>,
}

impl DirDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory holding the content of `layer`.
    pub fn files_dir(layer: &Path) -> PathBuf {
        layer.join(FILES_DIR)
    }

    pub fn is_active(&self, layer: &Path) -> Result<bool> {
        Ok(self.state()?.contains_key(layer))
    }

    fn state(&self) -> Result<MutexGuard<'_, HashMap<PathBuf, LayerState>>> {
        self.active
            .lock()
            .map_err(|_| anyhow!("Layer state lock poisoned"))
    }
}

impl LayerDriver for DirDriver {
    fn activate(&self, layer: &Path) -> Result<()> {
        ensure_layer(layer, "Layer")?;
        let mut state = self.state()?;
        if state.contains_key(layer) {
            bail!("Layer is already active: {}", layer.display());
        }
        log::debug!("Activated layer {}", layer.display());
        state.insert(layer.to_path_buf(), LayerState::default());
        Ok(())
    }

    fn prepare(&self, layer: &Path, parents: &[PathBuf]) -> Result<()> {
        for parent in parents {
            ensure_layer(parent, "Parent layer")?;
        }
        let mut state = self.state()?;
        let layer_state = state
            .get_mut(layer)
            .ok_or_else(|| anyhow!("Layer is not active: {}", layer.display()))?;
        layer_state.prepared = true;
        Ok(())
    }

    fn unprepare(&self, layer: &Path) -> Result<()> {
        let mut state = self.state()?;
        match state.get_mut(layer) {
            Some(layer_state) if layer_state.prepared => {
                layer_state.prepared = false;
                Ok(())
            }
            Some(_) => bail!("Layer is not prepared: {}", layer.display()),
            None => bail!("Layer is not active: {}", layer.display()),
        }
    }

    fn deactivate(&self, layer: &Path) -> Result<()> {
        self.state()?
            .remove(layer)
            .map(|_| log::debug!("Deactivated layer {}", layer.display()))
            .ok_or_else(|| anyhow!("Layer is not active: {}", layer.display()))
    }

    fn open_reader<'a>(
        &'a self,
        layer: &Path,
        parents: &[PathBuf],
    ) -> Result<Box<dyn LayerReader + 'a>> {
        for parent in parents {
            ensure_layer(parent, "Parent layer")?;
        }
        let index = LayerIndex::load(layer)?;
        Ok(Box::new(DirLayerReader {
            files: Self::files_dir(layer),
            entries: index.entries.into_iter(),
            current: None,
            streams: Vec::new(),
        }))
    }

    fn open_writer<'a>(
        &'a self,
        home: &Path,
        id: &str,
        parents: &[PathBuf],
    ) -> Result<Box<dyn LayerWriter + 'a>> {
        if id.is_empty() {
            bail!("Empty layer id");
        }
        for parent in parents {
            ensure_layer(parent, "Parent layer")?;
        }
        let root = home.join(id);
        if root.join(INDEX_FILE).exists() {
            bail!("Layer already exists: {}", root.display());
        }
        let files = Self::files_dir(&root);
        fs::create_dir_all(&files)
            .with_context(|| format!("Failed to create layer directory: {}", files.display()))?;

        Ok(Box::new(DirLayerWriter {
            root,
            files,
            parents: parents.to_vec(),
            index: LayerIndex::default(),
            current: None,
        }))
    }
}

struct DirLayerReader {
    files: PathBuf,
    entries: btree_map::IntoIter<String, IndexEntry>,
    current: Option<File>,
    streams: Vec<StreamBlock>,
}

impl Read for DirLayerReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.current.as_mut() {
            Some(file) => file.read(buf),
            None => Ok(0),
        }
    }
}

impl LayerReader for DirLayerReader {
    fn next(&mut self) -> Result<Option<LayerEntry>> {
        self.current = None;
        self.streams.clear();

        let Some((name, entry)) = self.entries.next() else {
            return Ok(None);
        };
        let native = to_native_path(&name);
        match entry {
            IndexEntry::Deleted => Ok(Some(LayerEntry {
                name: native,
                size: 0,
                info: None,
            })),
            IndexEntry::Present {
                size,
                info,
                streams,
            } => {
                if !info.is_directory() {
                    let path = self.files.join(&native);
                    let file = File::open(&path)
                        .with_context(|| format!("Failed to open layer file: {}", path.display()))?;
                    self.current = Some(file);
                }
                self.streams = streams;
                Ok(Some(LayerEntry {
                    name: native,
                    size,
                    info: Some(info),
                }))
            }
        }
    }

    fn streams(&mut self) -> Result<Vec<StreamBlock>> {
        Ok(self.streams.clone())
    }

    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// The file currently receiving data.
struct OpenFile {
    key: String,
    file: Option<File>,
    written: u64,
}

struct DirLayerWriter {
    root: PathBuf,
    files: PathBuf,
    parents: Vec<PathBuf>,
    index: LayerIndex,
    current: Option<OpenFile>,
}

impl DirLayerWriter {
    fn key_for(name: &Path) -> Result<String> {
        let key = to_archive_path(name)?;
        if key.is_empty() {
            bail!("Empty layer path");
        }
        Ok(key)
    }

    fn finish_current(&mut self) -> Result<()> {
        if let Some(open) = self.current.take() {
            if let Some(mut file) = open.file {
                file.flush()
                    .with_context(|| format!("Failed to flush layer file {}", open.key))?;
            }
            if let Some(IndexEntry::Present { size, .. }) = self.index.entries.get_mut(&open.key) {
                *size = open.written;
            }
        }
        Ok(())
    }

    fn remove_existing(path: &Path) -> Result<()> {
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)
                .with_context(|| format!("Failed to remove directory: {}", path.display())),
            Ok(_) => fs::remove_file(path)
                .with_context(|| format!("Failed to remove file: {}", path.display())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to stat {}", path.display())),
        }
    }

    /// Finds the content and index record of a hard link target, searching this layer
    /// first and then the parents from highest to lowest precedence.
    fn resolve_link_target(&self, key: &str, target: &Path) -> Result<(PathBuf, IndexEntry)> {
        if let Some(entry @ IndexEntry::Present { .. }) = self.index.get(key) {
            return Ok((self.files.join(target), entry.clone()));
        }
        if let Some(IndexEntry::Deleted) = self.index.get(key) {
            bail!("Hardlink target was deleted in this layer: {}", key);
        }
        for parent in self.parents.iter().rev() {
            let index = LayerIndex::load(parent)?;
            match index.get(key) {
                Some(entry @ IndexEntry::Present { .. }) => {
                    return Ok((DirDriver::files_dir(parent).join(target), entry.clone()));
                }
                Some(IndexEntry::Deleted) => {
                    bail!("Hardlink target was deleted in {}: {}", parent.display(), key)
                }
                None => {}
            }
        }
        bail!("Hardlink target not found: {}", key)
    }
}

impl Write for DirLayerWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let open = self
            .current
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no file has been added"))?;
        let file = open.file.as_mut().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot write data to directory {}", open.key),
            )
        })?;
        let n = file.write(buf)?;
        open.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.current.as_mut().and_then(|open| open.file.as_mut()) {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl LayerWriter for DirLayerWriter {
    fn add(&mut self, name: &Path, info: &FileInfo) -> Result<()> {
        self.finish_current()?;
        let key = Self::key_for(name)?;
        let dest = self.files.join(name);

        let file = if info.is_directory() {
            if dest.exists() && !dest.is_dir() {
                Self::remove_existing(&dest)?;
            }
            fs::create_dir_all(&dest)
                .with_context(|| format!("Failed to create directory: {}", dest.display()))?;
            None
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
            Self::remove_existing(&dest)?;
            let file = File::create(&dest)
                .with_context(|| format!("Failed to create file: {}", dest.display()))?;
            Some(file)
        };

        self.index.entries.insert(
            key.clone(),
            IndexEntry::Present {
                size: 0,
                info: info.clone(),
                streams: Vec::new(),
            },
        );
        self.current = Some(OpenFile {
            key,
            file,
            written: 0,
        });
        Ok(())
    }

    fn remove(&mut self, name: &Path) -> Result<()> {
        self.finish_current()?;
        let key = Self::key_for(name)?;
        Self::remove_existing(&self.files.join(name))?;

        let prefix = format!("{}/", key);
        self.index.entries.retain(|k, _| !k.starts_with(&prefix));
        self.index.entries.insert(key, IndexEntry::Deleted);
        Ok(())
    }

    fn add_link(&mut self, name: &Path, target: &Path) -> Result<()> {
        self.finish_current()?;
        let key = Self::key_for(name)?;
        let target_key = Self::key_for(target)?;
        let (source, entry) = self.resolve_link_target(&target_key, target)?;

        let dest = self.files.join(name);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        Self::remove_existing(&dest)?;

        if let Err(e) = fs::hard_link(&source, &dest) {
            // Parents may live on another filesystem
            log::debug!(
                "hardlink failed ({}), falling back to copy: {} -> {}",
                e,
                source.display(),
                dest.display()
            );
            fs::copy(&source, &dest).with_context(|| {
                format!("Failed to copy {} to {}", source.display(), dest.display())
            })?;
        }

        self.index.entries.insert(key, entry);
        Ok(())
    }

    fn add_stream(&mut self, block: &StreamBlock) -> Result<()> {
        let open = self
            .current
            .as_ref()
            .ok_or_else(|| anyhow!("No file has been added to attach a stream to"))?;
        match self.index.entries.get_mut(&open.key) {
            Some(IndexEntry::Present { streams, .. }) => {
                streams.push(block.clone());
                Ok(())
            }
            _ => bail!("Layer index lost track of {}", open.key),
        }
    }

    fn close(self: Box<Self>) -> Result<()> {
        let mut writer = *self;
        writer.finish_current()?;
        writer.index.save(&writer.root)?;
        write_layer_chain(&writer.root, &writer.parents)?;
        log::debug!(
            "Finalized layer {} with {} entries",
            writer.root.display(),
            writer.index.entries.len()
        );
        Ok(())
    }
}
