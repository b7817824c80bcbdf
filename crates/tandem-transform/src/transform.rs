//! Accumulating a sequence of steps against a document.

use crate::doc::Doc;
use crate::error::Result;
use crate::mapping::Mapping;
use crate::step::Step;

/// A document together with the steps applied to it so far.
///
/// `docs[i]` is the document *before* `steps[i]`, which is what inverting a
/// step needs.
#[derive(Clone, Debug)]
pub struct Transform {
    before: Doc,
    doc: Doc,
    steps: Vec<Step>,
    docs: Vec<Doc>,
    mapping: Mapping,
}

impl Transform {
    pub fn new(doc: Doc) -> Self {
        Self {
            before: doc.clone(),
            doc,
            steps: Vec::new(),
            docs: Vec::new(),
            mapping: Mapping::new(),
        }
    }

    /// The document the transform started from.
    pub fn before(&self) -> &Doc {
        &self.before
    }

    /// The current document.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn docs(&self) -> &[Doc] {
        &self.docs
    }

    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    pub fn mapping_mut(&mut self) -> &mut Mapping {
        &mut self.mapping
    }

    pub fn doc_changed(&self) -> bool {
        !self.steps.is_empty()
    }

    /// Apply a step. On error the transform is left untouched.
    pub fn step(&mut self, step: Step) -> Result<&mut Self> {
        let doc = step.apply(&self.doc)?;
        self.mapping.append_map(step.get_map(), None);
        self.docs.push(std::mem::replace(&mut self.doc, doc));
        self.steps.push(step);
        Ok(self)
    }

    pub fn insert(&mut self, pos: usize, text: impl Into<String>) -> Result<&mut Self> {
        self.step(Step::insert(pos, text))
    }

    pub fn delete(&mut self, from: usize, to: usize) -> Result<&mut Self> {
        self.step(Step::delete(from, to))
    }

    pub fn replace(&mut self, from: usize, to: usize, text: impl Into<String>) -> Result<&mut Self> {
        self.step(Step::new(from, to, text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::Assoc;

    #[test]
    fn test_chained_steps() {
        let mut tr = Transform::new(Doc::new("abcdef"));
        tr.insert(0, "xy").unwrap().delete(4, 6).unwrap();

        assert_eq!(tr.doc().text(), "xyabef");
        assert_eq!(tr.before().text(), "abcdef");
        assert_eq!(tr.docs().len(), 2);
        assert_eq!(tr.docs()[1].text(), "xyabcdef");
        assert_eq!(tr.mapping().map(5, Assoc::After), 5);
        assert!(tr.doc_changed());
    }

    #[test]
    fn test_failed_step_leaves_transform_untouched() {
        let mut tr = Transform::new(Doc::new("abc"));
        assert!(tr.delete(1, 9).is_err());
        assert!(!tr.doc_changed());
        assert!(tr.mapping().is_empty());
        assert_eq!(tr.doc().text(), "abc");
    }
}
