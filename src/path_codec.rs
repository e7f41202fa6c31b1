//! Mapping between display names, tree keys and sandbox addresses.
//!
//! Tree keys cannot contain the path separator (`.`), so every separator in
//! a display name is stored as the sentinel (`*`). `main.js` is keyed as
//! `main*js`. Sandbox paths join keys with `.` and, when they address a
//! node for mounting or writing, end in a kind accessor (`.directory` or
//! `.file.contents`).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{TreeError, TreeResult};

pub const SEPARATOR: char = '.';
pub const SENTINEL: char = '*';
pub const LOGICAL_SEPARATOR: char = '/';

const DIRECTORY_ACCESSOR: &str = "directory";
const FILE_ACCESSOR: &str = "file.contents";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
}

impl NodeKind {
    pub fn is_file(self) -> bool {
        matches!(self, NodeKind::File)
    }

    fn accessor(self) -> &'static str {
        match self {
            NodeKind::File => FILE_ACCESSOR,
            NodeKind::Directory => DIRECTORY_ACCESSOR,
        }
    }
}

/// A tree key. Never contains [`SEPARATOR`] or [`LOGICAL_SEPARATOR`].
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct EncodedName(String);

impl EncodedName {
    /// Encodes a display name. Same as [`encode`].
    pub fn from_display(name: &str) -> TreeResult<Self> {
        encode(name)
    }

    /// Accepts a key that is already in encoded form, e.g. one read back
    /// from a persisted tree.
    pub fn from_key(key: &str) -> TreeResult<Self> {
        if key.is_empty() || key.contains(SEPARATOR) || key.contains(LOGICAL_SEPARATOR) {
            return Err(TreeError::InvalidName(key.to_string()));
        }
        Ok(Self(key.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn display_name(&self) -> String {
        decode(self)
    }
}

impl<'de> Deserialize<'de> for EncodedName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        EncodedName::from_key(&raw).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for EncodedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Encodes a display name into a tree key.
///
/// Names that already contain the sentinel would not survive a round trip
/// and are rejected, as are names containing `/`.
pub fn encode(name: &str) -> TreeResult<EncodedName> {
    if name.contains(SENTINEL) || name.contains(LOGICAL_SEPARATOR) {
        return Err(TreeError::InvalidName(name.to_string()));
    }
    Ok(EncodedName(name.replace(SEPARATOR, &SENTINEL.to_string())))
}

pub fn decode(name: &EncodedName) -> String {
    name.0.replace(SENTINEL, &SEPARATOR.to_string())
}

/// Dotted address of a node inside the sandbox mount/write API.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxPath(String);

impl SandboxPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Appends the kind accessor, turning a node prefix into a mount address.
    pub fn with_accessor(&self, kind: NodeKind) -> SandboxPath {
        if self.0.is_empty() {
            return SandboxPath(kind.accessor().to_string());
        }
        SandboxPath(format!("{}{SEPARATOR}{}", self.0, kind.accessor()))
    }

    /// True when `self` is `prefix` or lies underneath it.
    pub fn starts_with(&self, prefix: &SandboxPath) -> bool {
        if prefix.is_root() {
            return true;
        }
        match self.0.strip_prefix(prefix.as_str()) {
            Some("") => true,
            Some(rest) => rest.starts_with(SEPARATOR),
            None => false,
        }
    }

    /// Swaps a leading `from` for `to`. Returns `None` when `from` is not a prefix.
    pub fn replace_prefix(&self, from: &SandboxPath, to: &SandboxPath) -> Option<SandboxPath> {
        if from.is_root() || !self.starts_with(from) {
            return None;
        }
        let rest = &self.0[from.0.len()..];
        Some(SandboxPath(format!("{}{rest}", to.0)))
    }
}

impl fmt::Display for SandboxPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Joins `segments` with `.` and appends the accessor for `kind`.
pub fn sandbox_path(segments: &[EncodedName], kind: NodeKind) -> SandboxPath {
    let mut prefix = SandboxPath::root();
    for segment in segments {
        prefix = combine(&prefix, segment);
    }
    prefix.with_accessor(kind)
}

/// Appends one step to an existing prefix.
pub fn combine(parent: &SandboxPath, name: &EncodedName) -> SandboxPath {
    if parent.is_root() {
        return SandboxPath(name.0.clone());
    }
    SandboxPath(format!("{}{SEPARATOR}{}", parent.0, name.0))
}

/// Slash-joined display names from the root. The empty path is the root.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogicalPath {
    segments: Vec<String>,
}

impl LogicalPath {
    pub fn root() -> Self {
        Self::default()
    }

    /// Parses `a/b/c`. Empty segments are ignored, so `""` and `"/"` are the root.
    pub fn parse(raw: &str) -> Self {
        Self {
            segments: raw
                .split(LOGICAL_SEPARATOR)
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn join(&self, name: impl Into<String>) -> LogicalPath {
        let mut segments = self.segments.clone();
        segments.push(name.into());
        LogicalPath { segments }
    }

    pub fn parent(&self) -> Option<LogicalPath> {
        let (_, rest) = self.segments.split_last()?;
        Some(LogicalPath {
            segments: rest.to_vec(),
        })
    }

    pub fn file_name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn starts_with(&self, prefix: &LogicalPath) -> bool {
        self.segments.starts_with(&prefix.segments)
    }

    pub fn replace_prefix(&self, from: &LogicalPath, to: &LogicalPath) -> Option<LogicalPath> {
        if !self.starts_with(from) {
            return None;
        }
        let mut segments = to.segments.clone();
        segments.extend_from_slice(&self.segments[from.segments.len()..]);
        Some(LogicalPath { segments })
    }

    /// The `/`-joined path the real filesystem uses.
    pub fn to_real_path(&self) -> String {
        self.to_string()
    }

    pub fn encoded(&self) -> TreeResult<Vec<EncodedName>> {
        self.segments.iter().map(|segment| encode(segment)).collect()
    }
}

impl fmt::Display for LogicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join(&LOGICAL_SEPARATOR.to_string()))
    }
}
