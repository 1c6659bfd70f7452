//! Common utilities for integration tests

use anyhow::{anyhow, Result};
use chrono::{TimeZone, Utc};
use ociwclayer::{
    CancelToken, FileAttributes, FileInfo, LayerDriver, LayerEntry, LayerReader, LayerWriter,
    Notifier, StreamBlock,
};
use std::cell::RefCell;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tar_rs as tar;

/// Everything the mock driver was asked to do, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Activate(PathBuf),
    Prepare(PathBuf, Vec<PathBuf>),
    Unprepare(PathBuf),
    Deactivate(PathBuf),
    OpenReader(PathBuf),
    CloseReader,
    OpenWriter(PathBuf, String, Vec<PathBuf>),
    Add(String, FileInfo),
    Write(Vec<u8>),
    Remove(String),
    AddLink(String, String),
    AddStream(StreamBlock),
    CloseWriter,
}

impl Call {
    /// Whether the call applies an archive entry to the writer.
    pub fn is_entry(&self) -> bool {
        matches!(self, Call::Add(..) | Call::Remove(_) | Call::AddLink(..))
    }
}

/// A layer entry served by the mock reader.
#[derive(Debug, Clone)]
pub struct MockEntry {
    pub name: PathBuf,
    pub size: u64,
    pub info: Option<FileInfo>,
    pub data: Vec<u8>,
    pub streams: Vec<StreamBlock>,
}

impl MockEntry {
    pub fn file(name: &str, data: &[u8]) -> Self {
        Self {
            name: native(name),
            size: data.len() as u64,
            info: Some(file_info()),
            data: data.to_vec(),
            streams: Vec::new(),
        }
    }

    pub fn deleted(name: &str) -> Self {
        Self {
            name: native(name),
            size: 0,
            info: None,
            data: Vec::new(),
            streams: Vec::new(),
        }
    }

    pub fn with_streams(mut self, streams: Vec<StreamBlock>) -> Self {
        self.streams = streams;
        self
    }
}

#[derive(Debug, Default, Clone)]
pub struct Failures {
    pub activate: bool,
    pub deactivate: bool,
    pub close_reader: bool,
    pub close_writer: bool,
    /// Fail the reader's `next` call with this index (0-based).
    pub next_at: Option<usize>,
    /// Fail `add` for this archive-form name.
    pub add_named: Option<String>,
    /// Fail data writes to this archive-form name.
    pub write_named: Option<String>,
}

pub struct MockDriver {
    pub calls: RefCell<Vec<Call>>,
    pub entries: Vec<MockEntry>,
    pub failures: Failures,
    /// Trip the token once this many entries have been read or applied.
    pub cancel_after: Option<(usize, CancelToken)>,
}

impl MockDriver {
    pub fn new(entries: Vec<MockEntry>) -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            entries,
            failures: Failures::default(),
            cancel_after: None,
        }
    }

    pub fn with_failures(mut self, failures: Failures) -> Self {
        self.failures = failures;
        self
    }

    pub fn cancel_after(mut self, entries: usize, token: &CancelToken) -> Self {
        self.cancel_after = Some((entries, token.clone()));
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    /// Calls made through the writer, without open/close bookkeeping.
    pub fn writer_ops(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| !matches!(call, Call::OpenWriter(..) | Call::CloseWriter))
            .collect()
    }

    fn record(&self, call: Call) {
        let mut calls = self.calls.borrow_mut();
        // Chunked writes of one file are recorded as a single write
        if let (Call::Write(more), Some(Call::Write(data))) = (&call, calls.last_mut()) {
            data.extend_from_slice(more);
            return;
        }
        calls.push(call);
    }

    fn maybe_cancel(&self, seen: usize) {
        if let Some((after, token)) = &self.cancel_after {
            if seen >= *after {
                token.cancel();
            }
        }
    }

    fn applied_entries(&self) -> usize {
        self.calls.borrow().iter().filter(|c| c.is_entry()).count()
    }
}

impl LayerDriver for MockDriver {
    fn activate(&self, layer: &Path) -> Result<()> {
        self.record(Call::Activate(layer.to_path_buf()));
        if self.failures.activate {
            return Err(anyhow!("activate failed"));
        }
        Ok(())
    }

    fn prepare(&self, layer: &Path, parents: &[PathBuf]) -> Result<()> {
        self.record(Call::Prepare(layer.to_path_buf(), parents.to_vec()));
        Ok(())
    }

    fn unprepare(&self, layer: &Path) -> Result<()> {
        self.record(Call::Unprepare(layer.to_path_buf()));
        Ok(())
    }

    fn deactivate(&self, layer: &Path) -> Result<()> {
        self.record(Call::Deactivate(layer.to_path_buf()));
        if self.failures.deactivate {
            return Err(anyhow!("deactivate failed"));
        }
        Ok(())
    }

    fn open_reader<'a>(
        &'a self,
        layer: &Path,
        _parents: &[PathBuf],
    ) -> Result<Box<dyn LayerReader + 'a>> {
        self.record(Call::OpenReader(layer.to_path_buf()));
        self.maybe_cancel(0);
        Ok(Box::new(MockReader {
            driver: self,
            next: 0,
            current: None,
        }))
    }

    fn open_writer<'a>(
        &'a self,
        home: &Path,
        id: &str,
        parents: &[PathBuf],
    ) -> Result<Box<dyn LayerWriter + 'a>> {
        self.record(Call::OpenWriter(home.to_path_buf(), id.to_string(), parents.to_vec()));
        // Mutated-file backups land in the layer directory
        if !home.as_os_str().is_empty() && home.exists() {
            fs::create_dir_all(home.join(id))?;
        }
        self.maybe_cancel(0);
        Ok(Box::new(MockWriter {
            driver: self,
            current: None,
        }))
    }
}

struct MockReader<'a> {
    driver: &'a MockDriver,
    next: usize,
    current: Option<io::Cursor<Vec<u8>>>,
}

impl Read for MockReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.current.as_mut() {
            Some(cursor) => cursor.read(buf),
            None => Ok(0),
        }
    }
}

impl LayerReader for MockReader<'_> {
    fn next(&mut self) -> Result<Option<LayerEntry>> {
        if self.driver.failures.next_at == Some(self.next) {
            return Err(anyhow!("enumeration failed"));
        }
        let Some(entry) = self.driver.entries.get(self.next) else {
            return Ok(None);
        };
        self.next += 1;
        self.current = Some(io::Cursor::new(entry.data.clone()));
        self.driver.maybe_cancel(self.next);
        Ok(Some(LayerEntry {
            name: entry.name.clone(),
            size: entry.size,
            info: entry.info.clone(),
        }))
    }

    fn streams(&mut self) -> Result<Vec<StreamBlock>> {
        Ok(self
            .next
            .checked_sub(1)
            .and_then(|idx| self.driver.entries.get(idx))
            .map(|entry| entry.streams.clone())
            .unwrap_or_default())
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.driver.record(Call::CloseReader);
        if self.driver.failures.close_reader {
            return Err(anyhow!("reader close failed"));
        }
        Ok(())
    }
}

struct MockWriter<'a> {
    driver: &'a MockDriver,
    current: Option<String>,
}

impl MockWriter<'_> {
    fn applied(&self) {
        self.driver.maybe_cancel(self.driver.applied_entries());
    }
}

impl Write for MockWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.current.is_some() && self.driver.failures.write_named == self.current {
            return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
        }
        self.driver.record(Call::Write(buf.to_vec()));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LayerWriter for MockWriter<'_> {
    fn add(&mut self, name: &Path, info: &FileInfo) -> Result<()> {
        let name = archive(name);
        if self.driver.failures.add_named.as_deref() == Some(name.as_str()) {
            return Err(anyhow!("add failed for {}", name));
        }
        self.current = Some(name.clone());
        self.driver.record(Call::Add(name, info.clone()));
        self.applied();
        Ok(())
    }

    fn remove(&mut self, name: &Path) -> Result<()> {
        self.driver.record(Call::Remove(archive(name)));
        self.applied();
        Ok(())
    }

    fn add_link(&mut self, name: &Path, target: &Path) -> Result<()> {
        self.driver
            .record(Call::AddLink(archive(name), archive(target)));
        self.applied();
        Ok(())
    }

    fn add_stream(&mut self, block: &StreamBlock) -> Result<()> {
        self.driver.record(Call::AddStream(block.clone()));
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.driver.record(Call::CloseWriter);
        if self.driver.failures.close_writer {
            return Err(anyhow!("writer close failed"));
        }
        Ok(())
    }
}

pub fn native(name: &str) -> PathBuf {
    ociwclayer::whiteout::to_native_path(name)
}

pub fn archive(path: &Path) -> String {
    ociwclayer::whiteout::to_archive_path(path).expect("utf-8 test path")
}

pub fn file_info() -> FileInfo {
    FileInfo {
        attributes: FileAttributes::ARCHIVE,
        creation_time: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
        last_access_time: Utc.timestamp_opt(1_700_000_000, 250_000_000).unwrap(),
        last_write_time: Utc.with_ymd_and_hms(2023, 1, 1, 1, 0, 0).unwrap(),
        change_time: Utc.with_ymd_and_hms(2023, 1, 1, 2, 0, 0).unwrap(),
    }
}

pub fn dir_info() -> FileInfo {
    FileInfo {
        attributes: FileAttributes::DIRECTORY,
        ..file_info()
    }
}

pub fn quiet() -> Notifier {
    Notifier::new(0)
}

/// Names, entry types, sizes and bodies of every entry in a tar stream.
pub fn read_archive(bytes: &[u8]) -> Result<Vec<(String, tar::EntryType, u64, Vec<u8>)>> {
    let mut archive = tar::Archive::new(bytes);
    let mut out = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().to_string();
        let kind = entry.header().entry_type();
        let size = entry.size();
        let mut body = Vec::new();
        entry.read_to_end(&mut body)?;
        out.push((name, kind, size, body));
    }
    Ok(out)
}
