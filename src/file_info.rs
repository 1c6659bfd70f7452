//! Native per-file metadata carried alongside layer content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Windows file attribute bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileAttributes(pub u32);

impl FileAttributes {
    pub const READONLY: FileAttributes = FileAttributes(0x1);
    pub const HIDDEN: FileAttributes = FileAttributes(0x2);
    pub const SYSTEM: FileAttributes = FileAttributes(0x4);
    pub const DIRECTORY: FileAttributes = FileAttributes(0x10);
    pub const ARCHIVE: FileAttributes = FileAttributes(0x20);
    pub const NORMAL: FileAttributes = FileAttributes(0x80);
    pub const REPARSE_POINT: FileAttributes = FileAttributes(0x400);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: FileAttributes) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_directory(self) -> bool {
        self.contains(Self::DIRECTORY)
    }
}

impl std::ops::BitOr for FileAttributes {
    type Output = FileAttributes;

    fn bitor(self, rhs: Self) -> Self::Output {
        FileAttributes(self.0 | rhs.0)
    }
}

/// Timestamps and attributes of a single layer file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub attributes: FileAttributes,
    pub creation_time: DateTime<Utc>,
    pub last_access_time: DateTime<Utc>,
    pub last_write_time: DateTime<Utc>,
    pub change_time: DateTime<Utc>,
}

impl FileInfo {
    /// Metadata with every timestamp set to `time`.
    pub fn new(attributes: FileAttributes, time: DateTime<Utc>) -> Self {
        Self {
            attributes,
            creation_time: time,
            last_access_time: time,
            last_write_time: time,
            change_time: time,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.attributes.is_directory()
    }
}
