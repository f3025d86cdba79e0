//! Line-oriented directory listing records and cursor pagination.
//!
//! Listers emit one record per line as `type|size|fullPath|skipped`, where
//! `type` is `f`, `d` or another single letter (as printed by `find -printf
//! %y`) and `skipped` is `1` for entries that could not be descended into.
//! A lister asked for `limit` entries returns up to `limit + 1`; the extra
//! one only signals that another page exists.

use std::path::Path;

use super::{DirEntry, DirPage};
use crate::error::{SandboxError, SandboxResult};

/// One parsed listing line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRecord {
    pub kind: char,
    pub size: u64,
    pub path: String,
    pub skipped: bool,
}

impl ListingRecord {
    /// Renders the record as a listing line without the trailing newline.
    #[must_use]
    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.kind,
            self.size,
            self.path,
            u8::from(self.skipped)
        )
    }

    /// Parses a listing line. Paths may themselves contain `|`.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let (kind, rest) = line.split_once('|')?;
        let (size, rest) = rest.split_once('|')?;
        let (path, skipped) = rest.rsplit_once('|')?;
        Some(Self {
            kind: kind.chars().next()?,
            size: size.trim().parse().unwrap_or(0),
            path: path.to_string(),
            skipped: skipped.trim() == "1",
        })
    }

    /// Converts to an entry named relative to `base`.
    #[must_use]
    pub fn to_entry(&self, base: &str) -> DirEntry {
        let base = base.trim_end_matches('/');
        let name = if self.path == base {
            ".".to_string()
        } else {
            match self.path.strip_prefix(base).and_then(|r| r.strip_prefix('/')) {
                Some(relative) => relative.to_string(),
                None => self.path.clone(),
            }
        };

        DirEntry {
            name,
            is_file: self.kind == 'f',
            is_directory: self.kind == 'd',
            size: self.size,
            skipped: self.skipped,
        }
    }
}

/// Parses every well-formed line of lister output.
#[must_use]
pub fn parse_lines(output: &str) -> Vec<ListingRecord> {
    output
        .lines()
        .filter(|line| !line.is_empty())
        .filter_map(ListingRecord::parse)
        .collect()
}

/// Decodes a cursor into the number of entries already returned.
///
/// # Errors
///
/// Returns `SandboxError::InvalidArgument` for a cursor this crate did not issue.
pub fn parse_cursor(cursor: Option<&str>) -> SandboxResult<usize> {
    match cursor {
        None | Some("") => Ok(0),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| SandboxError::invalid(format!("invalid readdir cursor: {raw}"))),
    }
}

/// Normalises a page size; zero means unlimited.
#[must_use]
pub fn effective_limit(limit: Option<usize>) -> Option<usize> {
    limit.filter(|l| *l > 0)
}

/// Builds a page from the records a lister returned starting at `offset`.
#[must_use]
pub fn paginate(
    mut records: Vec<ListingRecord>,
    base: &Path,
    offset: usize,
    limit: Option<usize>,
) -> DirPage {
    let has_more = match limit {
        Some(limit) if records.len() > limit => {
            records.truncate(limit);
            true
        }
        _ => false,
    };

    let base = base.to_string_lossy();
    let entries: Vec<DirEntry> = records.iter().map(|r| r.to_entry(&base)).collect();
    let cursor = has_more.then(|| (offset + entries.len()).to_string());

    DirPage { entries, cursor }
}
