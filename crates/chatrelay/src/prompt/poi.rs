//! Point-of-interest alias table rendered into navigation prompts

use std::path::Path;

use crate::error::{RelayError, Result};

/// Placeholder replaced by the rendered table
pub const POI_PLACEHOLDER: &str = "{poi}";

/// A canonical place name and the other names visitors use for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoiEntry {
    pub name: String,
    pub aliases: Vec<String>,
}

/// Ordered POI table, one `name,alias,alias` row per line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoiTable {
    entries: Vec<PoiEntry>,
}

impl PoiTable {
    /// Parse the table; blank lines and `#` comments are skipped
    pub fn parse(content: &str) -> Self {
        let entries = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| {
                let mut cells = line.split(',').map(str::trim).filter(|c| !c.is_empty());
                let name = cells.next()?.to_string();
                let aliases = cells.map(str::to_string).collect();
                Some(PoiEntry { name, aliases })
            })
            .collect();

        Self { entries }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!("Failed to read POI file {}: {}", path.display(), e))
        })?;
        let table = Self::parse(&content);
        tracing::info!("Loaded {} points of interest", table.len());
        Ok(table)
    }

    /// One line per place: `name（alias、alias）`
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|entry| {
                if entry.aliases.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{}（{}）", entry.name, entry.aliases.join("、"))
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn entries(&self) -> &[PoiEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
