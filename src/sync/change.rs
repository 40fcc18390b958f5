//! Typed change descriptors and the keys used to match expected echoes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Discriminant of a [`ChangeDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Add,
    Modify,
    Delete,
    Move,
}

impl ChangeKind {
    /// Whether the file content must be readable before the change is sent.
    pub fn carries_content(&self) -> bool {
        matches!(self, ChangeKind::Add | ChangeKind::Modify)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Add => "add",
            ChangeKind::Modify => "modify",
            ChangeKind::Delete => "delete",
            ChangeKind::Move => "move",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single file change, with paths relative to the watch root.
///
/// Paths use `/` as separator on every platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeDescriptor {
    Add { path: String },
    Modify { path: String },
    Delete { path: String },
    Move { old_path: String, new_path: String },
}

impl ChangeDescriptor {
    pub fn add(path: impl Into<String>) -> Self {
        Self::Add { path: path.into() }
    }

    pub fn modify(path: impl Into<String>) -> Self {
        Self::Modify { path: path.into() }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::Delete { path: path.into() }
    }

    pub fn moved(old_path: impl Into<String>, new_path: impl Into<String>) -> Self {
        Self::Move {
            old_path: old_path.into(),
            new_path: new_path.into(),
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Add { .. } => ChangeKind::Add,
            Self::Modify { .. } => ChangeKind::Modify,
            Self::Delete { .. } => ChangeKind::Delete,
            Self::Move { .. } => ChangeKind::Move,
        }
    }

    /// The path the change applies to. For moves this is the destination.
    pub fn path(&self) -> &str {
        match self {
            Self::Add { path } | Self::Modify { path } | Self::Delete { path } => path,
            Self::Move { new_path, .. } => new_path,
        }
    }

    /// Key matching this change against registered echoes.
    pub fn key(&self) -> SuppressionKey {
        SuppressionKey::from(self)
    }
}

impl fmt::Display for ChangeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Move { old_path, new_path } => write!(f, "move {old_path} -> {new_path}"),
            other => write!(f, "{} {}", other.kind(), other.path()),
        }
    }
}

/// Identity of an expected echo.
///
/// Matching is exact: same kind and byte-identical paths. Moves compare both
/// source and destination; there is no prefix matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SuppressionKey {
    kind: ChangeKind,
    path: String,
    dest: Option<String>,
}

impl SuppressionKey {
    pub fn kind(&self) -> ChangeKind {
        self.kind
    }
}

impl From<&ChangeDescriptor> for SuppressionKey {
    fn from(change: &ChangeDescriptor) -> Self {
        let (path, dest) = match change {
            ChangeDescriptor::Add { path }
            | ChangeDescriptor::Modify { path }
            | ChangeDescriptor::Delete { path } => (path.clone(), None),
            ChangeDescriptor::Move { old_path, new_path } => {
                (old_path.clone(), Some(new_path.clone()))
            }
        };

        Self {
            kind: change.kind(),
            path,
            dest,
        }
    }
}

impl From<ChangeDescriptor> for SuppressionKey {
    fn from(change: ChangeDescriptor) -> Self {
        Self::from(&change)
    }
}

impl fmt::Display for SuppressionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.dest {
            Some(dest) => write!(f, "{}:{}->{}", self.kind, self.path, dest),
            None => write!(f, "{}:{}", self.kind, self.path),
        }
    }
}

/// A confirmed local change, ready to be handed to the dispatch interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    #[serde(flatten)]
    pub change: ChangeDescriptor,
    pub detected_at: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn new(change: ChangeDescriptor) -> Self {
        Self {
            change,
            detected_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> ChangeKind {
        self.change.kind()
    }
}
