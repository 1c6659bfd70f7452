//! Encoding of layer files as tar entries.
//!
//! A regular layer file becomes one tar entry:
//! - the header (plus PAX records) carries [`FileInfo`]: attributes in `MSWINDOWS.fileattr`,
//!   timestamps in `mtime`/`atime`/`ctime`/`LIBARCHIVE.creationtime`;
//! - the body is the file's primary data followed by zero or more tagged [`StreamBlock`]s
//!   (alternate data streams, security descriptor, reparse data, extended attributes).
//!   `MSWINDOWS.blocks` records how many trailing body bytes are blocks, so the declared
//!   file size is `entry size - blocks`.
//!
//! Block framing is `tag: u32 LE | name_len: u32 LE | data_len: u64 LE | name | data`.
//! Blocks are opaque here; they round-trip byte for byte.

use crate::file_info::{FileAttributes, FileInfo};
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use tar_rs as tar;

pub const PAX_FILE_ATTR: &str = "MSWINDOWS.fileattr";
pub const PAX_BLOCKS: &str = "MSWINDOWS.blocks";
pub const PAX_CREATION_TIME: &str = "LIBARCHIVE.creationtime";
pub const PAX_MTIME: &str = "mtime";
pub const PAX_ATIME: &str = "atime";
pub const PAX_CTIME: &str = "ctime";

const BLOCK_HEADER_LEN: usize = 16;

/// Kind of a tagged block. Values follow the Win32 backup stream identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    ExtendedAttributes,
    SecurityDescriptor,
    AlternateData,
    Reparse,
}

impl StreamKind {
    pub fn tag(self) -> u32 {
        match self {
            StreamKind::ExtendedAttributes => 2,
            StreamKind::SecurityDescriptor => 3,
            StreamKind::AlternateData => 4,
            StreamKind::Reparse => 8,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            2 => Some(StreamKind::ExtendedAttributes),
            3 => Some(StreamKind::SecurityDescriptor),
            4 => Some(StreamKind::AlternateData),
            8 => Some(StreamKind::Reparse),
            _ => None,
        }
    }
}

/// Extra per-file data that does not fit in a tar header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamBlock {
    pub kind: StreamKind,
    /// Stream name; only alternate data streams are named.
    pub name: String,
    pub data: Vec<u8>,
}

impl StreamBlock {
    pub fn new(kind: StreamKind, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            name: name.into(),
            data: data.into(),
        }
    }

    pub fn encoded_len(&self) -> u64 {
        (BLOCK_HEADER_LEN + self.name.len() + self.data.len()) as u64
    }
}

pub fn write_block<W: Write>(w: &mut W, block: &StreamBlock) -> io::Result<()> {
    w.write_all(&block.kind.tag().to_le_bytes())?;
    w.write_all(&(block.name.len() as u32).to_le_bytes())?;
    w.write_all(&(block.data.len() as u64).to_le_bytes())?;
    w.write_all(block.name.as_bytes())?;
    w.write_all(&block.data)
}

pub fn encode_blocks(blocks: &[StreamBlock]) -> Vec<u8> {
    let mut out = Vec::with_capacity(blocks.iter().map(|b| b.encoded_len() as usize).sum());
    for block in blocks {
        // Writing into a Vec cannot fail
        let _ = write_block(&mut out, block);
    }
    out
}

/// Reads as many bytes as available up to `buf.len()`, stopping early only at EOF.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Reads the next tagged block, or `None` at a clean end of input.
pub fn read_block<R: Read>(r: &mut R) -> Result<Option<StreamBlock>> {
    let mut head = [0u8; BLOCK_HEADER_LEN];
    let got = read_full(r, &mut head).context("Failed to read stream block header")?;
    if got == 0 {
        return Ok(None);
    }
    if got < BLOCK_HEADER_LEN {
        bail!("Truncated stream block header ({} of {} bytes)", got, BLOCK_HEADER_LEN);
    }

    let tag = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
    let name_len = u32::from_le_bytes([head[4], head[5], head[6], head[7]]) as u64;
    let mut data_len_bytes = [0u8; 8];
    data_len_bytes.copy_from_slice(&head[8..16]);
    let data_len = u64::from_le_bytes(data_len_bytes);

    let kind = StreamKind::from_tag(tag).ok_or_else(|| anyhow!("Unknown stream block tag {}", tag))?;

    let mut name = Vec::new();
    r.take(name_len)
        .read_to_end(&mut name)
        .context("Failed to read stream block name")?;
    if name.len() as u64 != name_len {
        bail!("Truncated stream block name");
    }
    let name = String::from_utf8(name).context("Stream block name is not UTF-8")?;

    let mut data = Vec::new();
    r.take(data_len)
        .read_to_end(&mut data)
        .context("Failed to read stream block data")?;
    if data.len() as u64 != data_len {
        bail!(
            "Truncated stream block data ({} of {} bytes)",
            data.len(),
            data_len
        );
    }

    Ok(Some(StreamBlock { kind, name, data }))
}

pub fn read_blocks<R: Read>(mut r: R) -> Result<Vec<StreamBlock>> {
    let mut blocks = Vec::new();
    while let Some(block) = read_block(&mut r)? {
        blocks.push(block);
    }
    Ok(blocks)
}

/// PAX `sec.nanos` form. Times before the epoch are written sign-magnitude (`-1.5` is
/// one and a half seconds before 1970), as POSIX readers expect.
fn format_time(time: &DateTime<Utc>) -> String {
    let secs = time.timestamp();
    let nanos = time.timestamp_subsec_nanos();
    if secs >= 0 {
        return format!("{}.{:09}", secs, nanos);
    }
    if nanos == 0 {
        format!("-{}.{:09}", secs.unsigned_abs(), 0)
    } else {
        format!("-{}.{:09}", (secs + 1).unsigned_abs(), 1_000_000_000 - nanos)
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    let (negative, magnitude) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value),
    };
    let (secs, frac) = magnitude.split_once('.').unwrap_or((magnitude, ""));
    if secs.is_empty() || !secs.chars().all(|c| c.is_ascii_digit()) {
        bail!("Invalid timestamp: {}", value);
    }
    let secs: i64 = secs
        .parse()
        .with_context(|| format!("Invalid timestamp: {}", value))?;
    let mut digits: String = frac.chars().take(9).collect();
    if !frac.chars().all(|c| c.is_ascii_digit()) {
        bail!("Invalid timestamp: {}", value);
    }
    while digits.len() < 9 {
        digits.push('0');
    }
    let nanos: u32 = digits
        .parse()
        .with_context(|| format!("Invalid timestamp: {}", value))?;

    let (secs, nanos) = match (negative, nanos) {
        (false, _) => (secs, nanos),
        (true, 0) => (-secs, 0),
        (true, _) => (-secs - 1, 1_000_000_000 - nanos),
    };
    DateTime::from_timestamp(secs, nanos).ok_or_else(|| anyhow!("Timestamp out of range: {}", value))
}

/// Tar header and PAX records describing a layer file.
pub fn header_for(
    info: &FileInfo,
    size: u64,
    block_len: u64,
) -> (tar::Header, Vec<(&'static str, String)>) {
    let mut header = tar::Header::new_gnu();
    if info.is_directory() {
        header.set_entry_type(tar::EntryType::Directory);
        header.set_mode(0o755);
    } else {
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
    }
    header.set_size(size + block_len);
    header.set_mtime(info.last_write_time.timestamp().max(0) as u64);

    let mut pax = vec![
        (PAX_MTIME, format_time(&info.last_write_time)),
        (PAX_ATIME, format_time(&info.last_access_time)),
        (PAX_CTIME, format_time(&info.change_time)),
        (PAX_CREATION_TIME, format_time(&info.creation_time)),
        (PAX_FILE_ATTR, info.attributes.bits().to_string()),
    ];
    if block_len > 0 {
        pax.push((PAX_BLOCKS, block_len.to_string()));
    }
    (header, pax)
}

/// Appends a regular layer file to `builder`.
///
/// Exactly `size` bytes of primary data are taken from `data`; fewer is an error.
pub fn append_file<W: Write, R: Read + ?Sized>(
    builder: &mut tar::Builder<W>,
    name: &str,
    info: &FileInfo,
    size: u64,
    data: &mut R,
    blocks: &[StreamBlock],
) -> Result<()> {
    let encoded = encode_blocks(blocks);
    let (mut header, pax) = header_for(info, size, encoded.len() as u64);

    builder
        .append_pax_extensions(pax.iter().map(|(k, v)| (*k, v.as_bytes())))
        .with_context(|| format!("Failed to write PAX header for {}", name))?;

    let mut body = data.take(size).chain(Cursor::new(encoded));
    builder
        .append_data(&mut header, name, &mut body)
        .with_context(|| format!("Failed to write tar entry for {}", name))?;

    let (primary, _) = body.into_inner();
    if primary.limit() != 0 {
        bail!(
            "Short read for {}: layer reported {} bytes but {} were missing",
            name,
            size,
            primary.limit()
        );
    }
    Ok(())
}

/// Metadata decoded from a regular entry's header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMetadata {
    pub info: FileInfo,
    /// Declared size of the primary data.
    pub size: u64,
    /// Length of the tagged-block trailer following the primary data.
    pub block_len: u64,
}

pub fn pax_records<R: Read>(entry: &mut tar::Entry<'_, R>) -> Result<HashMap<String, String>> {
    let mut records = HashMap::new();
    if let Some(extensions) = entry.pax_extensions()? {
        for ext in extensions {
            let ext = ext.context("Malformed PAX extension")?;
            let key = ext.key().context("PAX key is not UTF-8")?;
            let value = ext.value().context("PAX value is not UTF-8")?;
            records.insert(key.to_string(), value.to_string());
        }
    }
    Ok(records)
}

pub fn metadata_from_entry<R: Read>(entry: &mut tar::Entry<'_, R>) -> Result<EntryMetadata> {
    let records = pax_records(entry)?;
    let header = entry.header();
    let total = entry.size();

    let header_mtime = header.mtime().context("Invalid mtime in tar header")?;
    let fallback = DateTime::from_timestamp(header_mtime as i64, 0)
        .ok_or_else(|| anyhow!("Tar header mtime out of range: {}", header_mtime))?;
    let time_of = |key: &str, default: DateTime<Utc>| -> Result<DateTime<Utc>> {
        match records.get(key) {
            Some(value) => parse_time(value),
            None => Ok(default),
        }
    };
    let last_write_time = time_of(PAX_MTIME, fallback)?;
    let last_access_time = time_of(PAX_ATIME, last_write_time)?;
    let change_time = time_of(PAX_CTIME, last_write_time)?;
    let creation_time = time_of(PAX_CREATION_TIME, last_write_time)?;

    let attributes = match records.get(PAX_FILE_ATTR) {
        Some(value) => FileAttributes(
            value
                .parse()
                .with_context(|| format!("Invalid {}: {}", PAX_FILE_ATTR, value))?,
        ),
        None if header.entry_type().is_dir() => FileAttributes::DIRECTORY,
        None => FileAttributes::NORMAL,
    };

    let block_len = match records.get(PAX_BLOCKS) {
        Some(value) => value
            .parse()
            .with_context(|| format!("Invalid {}: {}", PAX_BLOCKS, value))?,
        None => 0,
    };
    if block_len > total {
        bail!(
            "Stream blocks ({} bytes) exceed entry size ({} bytes)",
            block_len,
            total
        );
    }

    Ok(EntryMetadata {
        info: FileInfo {
            attributes,
            creation_time,
            last_access_time,
            last_write_time,
            change_time,
        },
        size: total - block_len,
        block_len,
    })
}
