//! Content catalog.
//!
//! Maps a content id to its storage location, source kind and format, and
//! orders the members of each group so the next item can be found for
//! look-ahead decoding.

use crate::error::CatalogError;
use cadenza_cache::MAX_CONTENT_ID_LEN;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Where an item's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Local filesystem path
    #[default]
    Local,
    /// URL on the remote store, absolute or relative to the base URL
    Remote,
}

/// How an item's bytes are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    /// Must pass through the decryption pipeline
    Protected,
    /// Served as-is
    Plain,
}

/// A single catalog item.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CatalogEntry {
    /// Content id
    pub id: String,

    /// Owning group (an album or book)
    pub group_id: String,

    /// Position within the group
    #[serde(default)]
    pub position: u32,

    /// Filesystem path or URL
    pub path: String,

    /// Storage source
    #[serde(default)]
    pub source: SourceKind,

    /// Explicit format; inferred from the extension when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<FormatKind>,
}

impl CatalogEntry {
    /// Effective format of the item.
    ///
    /// Items without an explicit format are protected when their location
    /// ends in `.xm` (case-insensitive), plain otherwise.
    #[must_use]
    pub fn format_kind(&self) -> FormatKind {
        if let Some(format) = self.format {
            return format;
        }
        let location = self
            .path
            .split(['?', '#'])
            .next()
            .unwrap_or(&self.path)
            .to_ascii_lowercase();
        if location.ends_with(".xm") {
            FormatKind::Protected
        } else {
            FormatKind::Plain
        }
    }

    /// Whether the item must be decoded before delivery.
    #[must_use]
    pub fn is_protected(&self) -> bool {
        self.format_kind() == FormatKind::Protected
    }

    fn validate(&self) -> Result<(), CatalogError> {
        if self.id.is_empty() {
            return Err(CatalogError::InvalidEntry {
                id: self.id.clone(),
                reason: "id cannot be empty".to_string(),
            });
        }
        // Ids name cache files
        if self.id == "." || self.id == ".." || self.id.contains(['/', '\\', '\0']) {
            return Err(CatalogError::InvalidEntry {
                id: self.id.clone(),
                reason: "id cannot contain path separators".to_string(),
            });
        }
        if self.id.len() > MAX_CONTENT_ID_LEN {
            return Err(CatalogError::InvalidEntry {
                id: self.id.clone(),
                reason: format!("id longer than {MAX_CONTENT_ID_LEN} bytes"),
            });
        }
        if self.path.is_empty() {
            return Err(CatalogError::InvalidEntry {
                id: self.id.clone(),
                reason: "path cannot be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Lookup interface used by the delivery controller.
pub trait Catalog: Send + Sync {
    /// Resolve an id to its entry.
    fn resolve(&self, id: &str) -> Option<CatalogEntry>;

    /// The item after `id` in its group, if any.
    fn next_in_sequence(&self, id: &str) -> Option<CatalogEntry>;

    /// All members of a group in sequence order.
    fn members_of(&self, group_id: &str) -> Vec<CatalogEntry>;

    /// Every known content id.
    fn ids(&self) -> HashSet<String>;
}

/// In-memory catalog loaded from a JSON array of entries.
#[derive(Debug, Clone, Default)]
pub struct JsonCatalog {
    entries: HashMap<String, CatalogEntry>,
    groups: HashMap<String, Vec<String>>,
}

impl JsonCatalog {
    /// Load catalog from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `CatalogError` if the file cannot be read, is not valid JSON,
    /// or contains duplicate or invalid entries.
    pub fn from_file(path: &Path) -> Result<Self, CatalogError> {
        let file = File::open(path).map_err(|source| CatalogError::LoadFailed {
            path: path.to_path_buf(),
            source,
        })?;

        let reader = BufReader::new(file);
        let entries: Vec<CatalogEntry> = serde_json::from_reader(reader)?;

        Self::from_entries(entries)
    }

    /// Build a catalog from entries.
    ///
    /// # Errors
    ///
    /// Returns `CatalogError` on duplicate ids or invalid entries.
    pub fn from_entries(entries: Vec<CatalogEntry>) -> Result<Self, CatalogError> {
        let mut by_id: HashMap<String, CatalogEntry> = HashMap::with_capacity(entries.len());
        let mut groups: HashMap<String, Vec<(u32, String)>> = HashMap::new();

        for entry in entries {
            entry.validate()?;
            if by_id.contains_key(&entry.id) {
                return Err(CatalogError::DuplicateId(entry.id));
            }
            groups
                .entry(entry.group_id.clone())
                .or_default()
                .push((entry.position, entry.id.clone()));
            by_id.insert(entry.id.clone(), entry);
        }

        let groups = groups
            .into_iter()
            .map(|(group, mut members)| {
                members.sort();
                (group, members.into_iter().map(|(_, id)| id).collect())
            })
            .collect();

        Ok(Self {
            entries: by_id,
            groups,
        })
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the catalog has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of groups.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

impl Catalog for JsonCatalog {
    fn resolve(&self, id: &str) -> Option<CatalogEntry> {
        self.entries.get(id).cloned()
    }

    fn next_in_sequence(&self, id: &str) -> Option<CatalogEntry> {
        let entry = self.entries.get(id)?;
        let members = self.groups.get(&entry.group_id)?;
        let index = members.iter().position(|m| m == id)?;
        members
            .get(index + 1)
            .and_then(|next| self.entries.get(next))
            .cloned()
    }

    fn members_of(&self, group_id: &str) -> Vec<CatalogEntry> {
        self.groups
            .get(group_id)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|id| self.entries.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn ids(&self) -> HashSet<String> {
        self.entries.keys().cloned().collect()
    }
}
