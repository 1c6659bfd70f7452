//! Whiteout naming and archive path conversion.
//!
//! OCI layer tarballs have no tombstone entry type, so a deletion of `dir/name` is recorded
//! as an empty entry named `dir/.wh.name`. All functions here work on forward-slash archive
//! paths; native paths only appear at the driver boundary via [`to_native_path`].
//!
//! See <https://github.com/opencontainers/image-spec/blob/main/layer.md#whiteouts>.

use anyhow::{anyhow, Result};
use std::borrow::Cow;
use std::path::{Component, Path, PathBuf};

/// Prefix marking a file as removed relative to the parent layers.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Splits an archive path into its directory (`""` for the root) and final segment.
fn split(name: &str) -> (&str, &str) {
    let name = name.trim_end_matches('/');
    match name.rfind('/') {
        Some(idx) => (&name[..idx], &name[idx + 1..]),
        None => ("", name),
    }
}

fn join(dir: &str, base: &str) -> String {
    if dir.is_empty() || dir == "." {
        base.to_string()
    } else {
        format!("{}/{}", dir, base)
    }
}

/// Builds the whiteout entry name recording that `base` was removed from `dir`.
pub fn encode(dir: &str, base: &str) -> String {
    join(dir, &format!("{}{}", WHITEOUT_PREFIX, base))
}

/// Whiteout entry name for the deleted archive path `name`.
pub fn whiteout_name(name: &str) -> String {
    let (dir, base) = split(name);
    encode(dir, base)
}

/// Returns `(dir, base)` of the deleted file when `name` is a whiteout entry.
///
/// Names whose final segment lacks the prefix are not whiteouts and yield `None`.
pub fn decode(name: &str) -> Option<(&str, &str)> {
    let (dir, base) = split(name);
    base.strip_prefix(WHITEOUT_PREFIX)
        .map(|original| (dir, original))
}

/// The path a whiteout entry deletes, or `name` itself for any other entry.
pub fn original_path(name: &str) -> Cow<'_, str> {
    match decode(name) {
        Some((dir, base)) => Cow::Owned(join(dir, base)),
        None => Cow::Borrowed(name),
    }
}

/// Converts a native layer path into archive form (relative, `/`-separated).
pub fn to_archive_path(path: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for comp in path.components() {
        match comp {
            Component::Normal(part) => {
                let part = part
                    .to_str()
                    .ok_or_else(|| anyhow!("Non UTF-8 path in layer: {}", path.display()))?;
                parts.push(part);
            }
            Component::CurDir => {}
            // Layer paths are always relative to the layer root
            Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                return Err(anyhow!("Layer path escapes its root: {}", path.display()));
            }
        }
    }
    Ok(parts.join("/"))
}

/// Converts an archive path into the host's native path form.
pub fn to_native_path(name: &str) -> PathBuf {
    name.split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect()
}
