//! Loading, normalization and deduplication of erasure identifiers.
//!
//! The input artifact is a JSON array of identifier strings. Identifiers are
//! trimmed and NFC-normalized before comparison, so `"u1"`, `" u1 "` and a
//! decomposed spelling of the same text collapse to one entry.

use std::{collections::HashSet, num::NonZeroUsize, path::Path};

use serde::Serialize;
use unicode_normalization::UnicodeNormalization;

/// Longest accepted identifier, in characters, after trimming.
pub const MAX_IDENTIFIER_CHARS: usize = 255;

/// Errors raised while loading identifiers. Always fatal, always before any
/// mutation.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("Failed to read identifier file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Identifier input is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Identifier input must be a JSON array, got {0}")]
    NotAnArray(&'static str),

    #[error("Identifier at index {index} is not a string (got {kind})")]
    NotAString { index: usize, kind: &'static str },

    #[error("Identifier list is empty")]
    Empty,

    #[error("Identifier at index {index} is blank")]
    Blank { index: usize },

    #[error(
        "Identifier at index {index} is {chars} characters long (max {max})",
        max = MAX_IDENTIFIER_CHARS
    )]
    TooLong { index: usize, chars: usize },
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Parse the identifier document into its raw, un-normalized entries.
pub fn parse_identifier_document(text: &str) -> Result<Vec<String>, InputError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let serde_json::Value::Array(items) = value else {
        return Err(InputError::NotAnArray(json_kind(&value)));
    };
    if items.is_empty() {
        return Err(InputError::Empty);
    }

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| match item {
            serde_json::Value::String(s) => Ok(s),
            other => Err(InputError::NotAString {
                index,
                kind: json_kind(&other),
            }),
        })
        .collect()
}

/// Read and parse an identifier file.
pub async fn read_identifier_file(path: impl AsRef<Path>) -> Result<Vec<String>, InputError> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| InputError::Io {
            path: path.display().to_string(),
            source,
        })?;
    parse_identifier_document(&text)
}

/// Normalize one identifier for comparison.
pub fn normalize_identifier(raw: &str) -> String {
    raw.trim().nfc().collect()
}

/// Sizes reported for the loader stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IdentifierCounts {
    pub total_requested: usize,
    pub unique_count: usize,
}

/// Deduplicated, normalized identifiers for one erasure run.
///
/// Order follows first occurrence in the input. Nothing downstream depends
/// on it, but it keeps partitioning reproducible between runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifierSet {
    ids: Vec<String>,
    total_requested: usize,
}

impl IdentifierSet {
    /// Validate, normalize and deduplicate raw identifiers.
    pub fn from_raw<S: AsRef<str>>(raw: &[S]) -> Result<Self, InputError> {
        if raw.is_empty() {
            return Err(InputError::Empty);
        }

        let mut seen = HashSet::with_capacity(raw.len());
        let mut ids = Vec::with_capacity(raw.len());

        for (index, item) in raw.iter().enumerate() {
            let normalized = normalize_identifier(item.as_ref());
            let chars = normalized.chars().count();
            if chars == 0 {
                return Err(InputError::Blank { index });
            }
            if chars > MAX_IDENTIFIER_CHARS {
                return Err(InputError::TooLong { index, chars });
            }
            if seen.insert(normalized.clone()) {
                ids.push(normalized);
            }
        }

        Ok(Self {
            ids,
            total_requested: raw.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }

    pub fn counts(&self) -> IdentifierCounts {
        IdentifierCounts {
            total_requested: self.total_requested,
            unique_count: self.ids.len(),
        }
    }

    /// Split into ordered partitions of at most `size` identifiers.
    ///
    /// `None` yields a single partition holding the whole set. Partitions are
    /// disjoint and their union is the set.
    pub fn partition(&self, size: Option<NonZeroUsize>) -> Vec<&[String]> {
        match size {
            Some(size) => self.ids.chunks(size.get()).collect(),
            None => vec![self.ids.as_slice()],
        }
    }
}
