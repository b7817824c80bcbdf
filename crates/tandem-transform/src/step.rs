//! Replace steps - the atomic, invertible edit operation.

use crate::doc::Doc;
use crate::error::{Result, StepError};
use crate::mapping::{Assoc, MapRange, Mapping, StepMap};
use serde::{Deserialize, Serialize};

/// Replace the characters in `from..to` with `text`.
///
/// Insertions have `from == to`, deletions have an empty `text`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Step {
    pub from: usize,
    pub to: usize,
    #[serde(default)]
    pub text: String,
}

impl Step {
    pub fn new(from: usize, to: usize, text: impl Into<String>) -> Self {
        Self {
            from,
            to,
            text: text.into(),
        }
    }

    pub fn insert(pos: usize, text: impl Into<String>) -> Self {
        Self::new(pos, pos, text)
    }

    pub fn delete(from: usize, to: usize) -> Self {
        Self::new(from, to, "")
    }

    /// Number of characters this step inserts.
    pub fn inserted_size(&self) -> usize {
        self.text.chars().count()
    }

    /// Apply the step, producing a new document.
    pub fn apply(&self, doc: &Doc) -> Result<Doc> {
        if self.from > self.to {
            return Err(StepError::InvertedRange {
                from: self.from,
                to: self.to,
            });
        }
        doc.replace(self.from, self.to, &self.text)
    }

    /// The position map describing this step.
    pub fn get_map(&self) -> StepMap {
        StepMap::new(vec![MapRange {
            start: self.from,
            old_size: self.to.saturating_sub(self.from),
            new_size: self.inserted_size(),
        }])
    }

    /// Create a step that undoes this one. `doc` is the document before this step.
    pub fn invert(&self, doc: &Doc) -> Result<Step> {
        Ok(Step::new(
            self.from,
            self.from + self.inserted_size(),
            doc.slice(self.from, self.to)?,
        ))
    }

    /// Map this step through a mapping.
    ///
    /// Returns `None` when the replaced range was deleted entirely.
    pub fn map(&self, mapping: &Mapping) -> Option<Step> {
        let from = mapping.map_result(self.from, Assoc::After);
        let to = mapping.map_result(self.to, Assoc::Before);
        if from.deleted_across() && to.deleted_across() {
            return None;
        }
        Some(Step::new(from.pos, from.pos.max(to.pos), self.text.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply() {
        let doc = Doc::new("hello");
        let doc = Step::insert(5, " world").apply(&doc).unwrap();
        assert_eq!(doc.text(), "hello world");

        let doc = Step::delete(0, 6).apply(&doc).unwrap();
        assert_eq!(doc.text(), "world");

        let doc = Step::new(0, 1, "W").apply(&doc).unwrap();
        assert_eq!(doc.text(), "World");
    }

    #[test]
    fn test_apply_rejects_bad_ranges() {
        let doc = Doc::new("abc");
        assert!(Step::delete(2, 1).apply(&doc).is_err());
        assert!(Step::insert(4, "x").apply(&doc).is_err());
    }

    #[test]
    fn test_invert_restores_document() {
        let doc = Doc::new("the quick fox");
        let step = Step::new(4, 9, "slow");
        let after = step.apply(&doc).unwrap();
        assert_eq!(after.text(), "the slow fox");

        let inverse = step.invert(&doc).unwrap();
        assert_eq!(inverse, Step::new(4, 8, "quick"));
        assert_eq!(inverse.apply(&after).unwrap(), doc);
    }

    #[test]
    fn test_get_map() {
        let map = Step::new(1, 3, "xyz").get_map();
        assert_eq!(map.map(5, Assoc::After), 6);
        assert!(Step::insert(3, "").get_map().is_empty());
    }

    #[test]
    fn test_map_through_insertion() {
        let mapping = Mapping::from(Step::insert(0, "ab").get_map());
        assert_eq!(
            Step::new(1, 3, "z").map(&mapping),
            Some(Step::new(3, 5, "z"))
        );
    }

    #[test]
    fn test_map_through_covering_deletion() {
        let mapping = Mapping::from(Step::delete(0, 10).get_map());
        assert_eq!(Step::delete(2, 5).map(&mapping), None);
        // An insertion point inside deleted content survives at the deletion point.
        assert_eq!(
            Step::insert(0, "x").map(&mapping),
            Some(Step::insert(0, "x"))
        );
    }

    #[test]
    fn test_wire_format() {
        let step = Step::new(1, 2, "a");
        let json = serde_json::to_string(&step).unwrap();
        assert_eq!(json, r#"{"from":1,"to":2,"text":"a"}"#);

        let parsed: Step = serde_json::from_str(r#"{"from":3,"to":4}"#).unwrap();
        assert_eq!(parsed, Step::delete(3, 4));
    }
}
