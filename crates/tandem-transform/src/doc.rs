//! Immutable text documents.
//!
//! Positions are character offsets, so a document of `n` characters has
//! valid positions `0..=n`.

use crate::error::{Result, StepError};
use serde::{Deserialize, Serialize};

/// An immutable plain-text document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Doc {
    text: String,
}

impl Doc {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// The size of the document in characters.
    pub fn content_size(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Get the text between two positions.
    pub fn slice(&self, from: usize, to: usize) -> Result<String> {
        let (start, end) = self.byte_range(from, to)?;
        Ok(self.text[start..end].to_string())
    }

    /// Produce a new document with `from..to` replaced by `insert`.
    pub fn replace(&self, from: usize, to: usize, insert: &str) -> Result<Doc> {
        let (start, end) = self.byte_range(from, to)?;
        let mut text = String::with_capacity(self.text.len() - (end - start) + insert.len());
        text.push_str(&self.text[..start]);
        text.push_str(insert);
        text.push_str(&self.text[end..]);
        Ok(Doc { text })
    }

    fn byte_range(&self, from: usize, to: usize) -> Result<(usize, usize)> {
        if from > to {
            return Err(StepError::InvertedRange { from, to });
        }
        Ok((self.byte_offset(from)?, self.byte_offset(to)?))
    }

    fn byte_offset(&self, pos: usize) -> Result<usize> {
        match self.text.char_indices().nth(pos) {
            Some((offset, _)) => Ok(offset),
            None if pos == self.content_size() => Ok(self.text.len()),
            None => Err(StepError::OutOfRange {
                pos,
                size: self.content_size(),
            }),
        }
    }
}

impl From<&str> for Doc {
    fn from(text: &str) -> Self {
        Doc::new(text)
    }
}

impl std::fmt::Display for Doc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}
