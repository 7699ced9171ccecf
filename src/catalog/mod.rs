//! In-memory code catalog.
//!
//! The catalog is built once at startup from rows of
//! `{code, title, description, category, aliases?}` and is read-only
//! afterwards. Every other component borrows it through an `Arc`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// One codable diagnosis entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub code: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub aliases: BTreeSet<String>,
}

impl CatalogItem {
    /// Text used to embed and lexically match the entry.
    pub fn searchable_text(&self) -> String {
        let mut text = self.title.clone();
        if !self.description.is_empty() && self.description != self.title {
            text.push_str(". ");
            text.push_str(&self.description);
        }
        for alias in &self.aliases {
            text.push_str("; ");
            text.push_str(alias);
        }
        text
    }
}

/// A raw catalog row as found on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogRow {
    pub code: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl CatalogRow {
    pub fn new(code: &str, title: &str, description: &str, category: &str) -> Self {
        Self {
            code: code.into(),
            title: title.into(),
            description: description.into(),
            category: category.into(),
            aliases: Vec::new(),
        }
    }

    pub fn with_aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases = aliases.iter().map(|a| a.to_string()).collect();
        self
    }
}

/// Canonical form of a code: trimmed, upper-case, no dots (`i21.01` → `I2101`).
pub fn canonical_code(code: &str) -> String {
    code.trim()
        .chars()
        .filter(|c| *c != '.')
        .flat_map(char::to_uppercase)
        .collect()
}

/// Read-only table of known codes, in load order.
#[derive(Debug, Clone)]
pub struct CodeCatalog {
    items: Vec<CatalogItem>,
    by_code: HashMap<String, usize>,
}

impl CodeCatalog {
    /// Build from rows. Duplicate codes keep their first occurrence.
    pub fn from_rows(rows: impl IntoIterator<Item = CatalogRow>) -> ConfigResult<Self> {
        let mut items = Vec::new();
        let mut by_code = HashMap::new();
        let mut duplicates = 0usize;

        for (line, row) in rows.into_iter().enumerate() {
            let code = canonical_code(&row.code);
            if code.is_empty() {
                return Err(ConfigError::Invalid {
                    message: format!("catalog row {} has an empty code", line + 1),
                });
            }
            if by_code.contains_key(&code) {
                duplicates += 1;
                continue;
            }
            let title = row.title.trim().to_string();
            let description = match row.description.trim() {
                "" => title.clone(),
                d => d.to_string(),
            };
            by_code.insert(code.clone(), items.len());
            items.push(CatalogItem {
                code,
                title,
                description,
                category: row.category.trim().to_string(),
                aliases: row
                    .aliases
                    .iter()
                    .map(|a| a.trim().to_string())
                    .filter(|a| !a.is_empty())
                    .collect(),
            });
        }

        if items.is_empty() {
            return Err(ConfigError::EmptyCatalog);
        }
        if duplicates > 0 {
            tracing::warn!(duplicates, "dropped duplicate catalog codes");
        }
        tracing::info!(codes = items.len(), "code catalog built");

        Ok(Self { items, by_code })
    }

    /// Load a JSON array or JSON Lines file of [`CatalogRow`]s.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::MissingPath {
                path: path.to_path_buf(),
            });
        }
        let data = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let parse_err = |message: String| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        };

        let rows: Vec<CatalogRow> = if data.trim_start().starts_with('[') {
            serde_json::from_str(&data).map_err(|e| parse_err(e.to_string()))?
        } else {
            data.lines()
                .enumerate()
                .filter(|(_, l)| !l.trim().is_empty())
                .map(|(i, l)| {
                    serde_json::from_str(l).map_err(|e| parse_err(format!("line {}: {e}", i + 1)))
                })
                .collect::<ConfigResult<_>>()?
        };

        Self::from_rows(rows)
    }

    /// Look up a code in any spelling (`I21.01`, `i2101`, `I2101`).
    pub fn get(&self, code: &str) -> Option<&CatalogItem> {
        self.by_code.get(&canonical_code(code)).map(|&i| &self.items[i])
    }

    pub fn contains(&self, code: &str) -> bool {
        self.by_code.contains_key(&canonical_code(code))
    }

    /// Item at a load-order position.
    pub fn item(&self, index: usize) -> Option<&CatalogItem> {
        self.items.get(index)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CatalogItem> {
        self.items.iter()
    }

    /// Code counts per category, sorted by category name.
    pub fn stats(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for item in &self.items {
            let key = if item.category.is_empty() {
                "(none)".to_string()
            } else {
                item.category.clone()
            };
            *counts.entry(key).or_insert(0) += 1;
        }
        counts
    }
}
