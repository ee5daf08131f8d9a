//! Row types handed across the store API

use serde::{Deserialize, Serialize};

/// One received unit of data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSource {
    pub id: i64,
    pub file_store_id: i64,
    pub feed_name: Option<String>,
    pub type_name: Option<String>,
    pub last_modified_time_ms: i64,
    pub examined: bool,
    pub forwarded: bool,
}

/// Result of [`SourceStore::add_source`](crate::SourceStore::add_source)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddSource {
    Added(i64),
    AlreadyExists(i64),
}

impl AddSource {
    pub fn id(self) -> i64 {
        match self {
            Self::Added(id) | Self::AlreadyExists(id) => id,
        }
    }

    pub fn is_new(self) -> bool {
        matches!(self, Self::Added(_))
    }
}

/// Kind of an entry, derived from its file extension.
///
/// The discriminant orders entries of one item when they are streamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    Manifest = 1,
    Meta = 2,
    Context = 3,
    Data = 4,
    Other = 99,
}

impl EntryKind {
    pub fn from_extension(extension: &str) -> Self {
        match extension.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "mf" => Self::Manifest,
            "meta" => Self::Meta,
            "ctx" => Self::Context,
            "dat" => Self::Data,
            _ => Self::Other,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Manifest,
            2 => Self::Meta,
            3 => Self::Context,
            4 => Self::Data,
            _ => Self::Other,
        }
    }

    pub fn code(self) -> i64 {
        self as i64
    }
}

/// Entry to be stored by [`SourceStore::add_items`](crate::SourceStore::add_items)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEntry {
    pub extension: String,
    pub byte_size: i64,
}

impl NewEntry {
    pub fn new(extension: impl Into<String>, byte_size: i64) -> Self {
        Self {
            extension: extension.into(),
            byte_size,
        }
    }

    pub fn kind(&self) -> EntryKind {
        EntryKind::from_extension(&self.extension)
    }
}

/// Item to be stored by [`SourceStore::add_items`](crate::SourceStore::add_items)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewItem {
    pub name: String,
    pub feed_name: Option<String>,
    pub type_name: Option<String>,
    pub entries: Vec<NewEntry>,
}

impl NewItem {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            feed_name: None,
            type_name: None,
            entries: Vec::new(),
        }
    }

    pub fn feed(mut self, feed_name: impl Into<String>) -> Self {
        self.feed_name = Some(feed_name.into());
        self
    }

    pub fn type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }

    pub fn entry(mut self, extension: impl Into<String>, byte_size: i64) -> Self {
        self.entries.push(NewEntry::new(extension, byte_size));
        self
    }

    /// Uncompressed size of all entries
    pub fn byte_size(&self) -> i64 {
        self.entries.iter().map(|e| e.byte_size).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceItem {
    pub id: i64,
    pub name: String,
    pub feed_name: Option<String>,
    pub type_name: Option<String>,
    pub byte_size: i64,
    pub source_id: i64,
    pub aggregate_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub id: i64,
    pub extension: String,
    pub kind: EntryKind,
    pub byte_size: i64,
    pub item_id: i64,
}

/// Reference to an item waiting to be aggregated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewItemRef {
    pub item_id: i64,
    pub source_id: i64,
    pub feed_name: Option<String>,
    pub type_name: Option<String>,
    pub byte_size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    pub id: i64,
    pub feed_name: Option<String>,
    pub type_name: Option<String>,
    pub byte_size: i64,
    pub items: i64,
    pub create_time_ms: i64,
    pub complete: bool,
}

/// One entry of an aggregate, as a forwarder streams it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardItem {
    pub source_id: i64,
    pub file_store_id: i64,
    pub item_id: i64,
    pub item_name: String,
    pub extension: String,
    pub kind: EntryKind,
    pub byte_size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForwardDest {
    pub id: i64,
    pub name: String,
}

/// One attempt-tracking row for a subject (aggregate or source) and a
/// destination.
///
/// A forwarder receives one of these, performs the transfer, marks the
/// outcome and hands it back to `update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRecord<S> {
    pub id: i64,
    pub update_time_ms: i64,
    pub dest: ForwardDest,
    pub subject: S,
    pub success: bool,
    pub error: Option<String>,
    pub tries: i64,
}

impl<S> ForwardRecord<S> {
    pub fn mark_success(&mut self) {
        self.success = true;
        self.error = None;
    }

    pub fn mark_failure(&mut self, error: impl Into<String>) {
        self.success = false;
        self.error = Some(error.into());
    }
}
