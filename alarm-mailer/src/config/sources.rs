//! Source list parsing.
//!
//! A source list holds one source per line, optionally followed by
//! `| description`. Blank lines and lines starting with `#` are skipped.

use std::path::Path;

use tracing::debug;

use crate::Result;

/// One entry of a source list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub name: String,
    pub description: String,
}

/// Parse a single `name | description` entry. Returns `None` for blanks and comments.
pub fn parse_entry(line: &str) -> Option<SourceEntry> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let (name, description) = match line.split_once('|') {
        Some((name, desc)) => (name.trim(), desc.trim()),
        None => (line, line),
    };
    if name.is_empty() {
        return None;
    }

    let description = if description.is_empty() { name } else { description };
    Some(SourceEntry {
        name: name.to_string(),
        description: description.to_string(),
    })
}

/// Parse the contents of a source list.
pub fn parse_list(contents: &str) -> Vec<SourceEntry> {
    contents.lines().filter_map(parse_entry).collect()
}

/// Read and parse a source list file.
pub fn read_list(path: &Path) -> Result<Vec<SourceEntry>> {
    debug!("Reading source list file: {}", path.display());
    let contents = std::fs::read_to_string(path)?;
    Ok(parse_list(&contents))
}
